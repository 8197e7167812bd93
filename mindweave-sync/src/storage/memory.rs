//! In-process store.
//!
//! Used when the server runs without a storage path and throughout the
//! tests. A single write lock over the document map makes the version check
//! and the append one atomic step; readers only take the read lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{check_batch, AccessRecords, ChangeLog, StoreError};
use crate::model::{now_millis, Change, Collaborator, Document, ShareLink};

struct DocumentLog {
    document: Document,
    /// `changes[i].version == i + 1`
    changes: Vec<Change>,
}

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<Uuid, DocumentLog>>,
    collaborators: RwLock<HashMap<(Uuid, Uuid), Collaborator>>,
    share_links: RwLock<HashMap<Uuid, ShareLink>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeLog for MemoryStore {
    fn create_document(&self, doc: Document) -> Result<Document, StoreError> {
        let mut docs = self.docs.write();
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        docs.insert(
            doc.id,
            DocumentLog {
                document: doc.clone(),
                changes: Vec::new(),
            },
        );
        Ok(doc)
    }

    fn document(&self, doc_id: Uuid) -> Result<Document, StoreError> {
        self.docs
            .read()
            .get(&doc_id)
            .map(|log| log.document.clone())
            .ok_or(StoreError::NotFound(doc_id))
    }

    fn append_batch(&self, doc_id: Uuid, changes: Vec<Change>) -> Result<u64, StoreError> {
        let mut docs = self.docs.write();
        let log = docs.get_mut(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        check_batch(doc_id, log.document.version, &changes)?;

        if let Some(last) = changes.last() {
            log.document.version = last.version;
            log.document.updated_at = now_millis();
            log.changes.extend(changes);
        }
        Ok(log.document.version)
    }

    fn read_since(&self, doc_id: Uuid, since: u64) -> Result<Vec<Change>, StoreError> {
        let docs = self.docs.read();
        let log = docs.get(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        let start = (since as usize).min(log.changes.len());
        Ok(log.changes[start..].to_vec())
    }

    fn current_version(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        self.docs
            .read()
            .get(&doc_id)
            .map(|log| log.document.version)
            .ok_or(StoreError::NotFound(doc_id))
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.docs.read().keys().copied().collect())
    }
}

impl AccessRecords for MemoryStore {
    fn collaborators(&self, doc_id: Uuid) -> Result<Vec<Collaborator>, StoreError> {
        let mut records: Vec<Collaborator> = self
            .collaborators
            .read()
            .values()
            .filter(|c| c.doc_id == doc_id)
            .cloned()
            .collect();
        records.sort_by_key(|c| (c.added_at, c.user_id));
        Ok(records)
    }

    fn collaborator(&self, doc_id: Uuid, user_id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        Ok(self.collaborators.read().get(&(doc_id, user_id)).cloned())
    }

    fn put_collaborator(&self, record: Collaborator) -> Result<(), StoreError> {
        let mut docs = self.docs.write();
        let log = docs
            .get_mut(&record.doc_id)
            .ok_or(StoreError::NotFound(record.doc_id))?;
        log.document.collaborators.insert(record.user_id);
        self.collaborators
            .write()
            .insert((record.doc_id, record.user_id), record);
        Ok(())
    }

    fn remove_collaborator(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let mut docs = self.docs.write();
        if let Some(log) = docs.get_mut(&doc_id) {
            log.document.collaborators.remove(&user_id);
        }
        Ok(self.collaborators.write().remove(&(doc_id, user_id)).is_some())
    }

    fn put_share_link(&self, link: ShareLink) -> Result<(), StoreError> {
        if !self.docs.read().contains_key(&link.doc_id) {
            return Err(StoreError::NotFound(link.doc_id));
        }
        self.share_links.write().insert(link.id, link);
        Ok(())
    }

    fn share_link(&self, link_id: Uuid) -> Result<Option<ShareLink>, StoreError> {
        Ok(self.share_links.read().get(&link_id).cloned())
    }

    fn share_links(&self, doc_id: Uuid) -> Result<Vec<ShareLink>, StoreError> {
        let mut links: Vec<ShareLink> = self
            .share_links
            .read()
            .values()
            .filter(|l| l.doc_id == doc_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccessLevel;
    use std::sync::Arc;

    fn change(doc_id: Uuid, version: u64) -> Change {
        Change {
            id: Uuid::new_v4(),
            doc_id,
            author: Uuid::new_v4(),
            timestamp: now_millis(),
            version,
            payload: format!("edit_{version}").into_bytes(),
        }
    }

    fn store_with_doc() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let doc = store
            .create_document(Document::new("Plan", Uuid::new_v4()))
            .unwrap();
        (store, doc.id)
    }

    #[test]
    fn test_append_and_read_since() {
        let (store, doc) = store_with_doc();
        for v in 1..=5 {
            store.append(doc, change(doc, v)).unwrap();
        }
        assert_eq!(store.current_version(doc).unwrap(), 5);

        let since2 = store.read_since(doc, 2).unwrap();
        let versions: Vec<u64> = since2.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);

        assert!(store.read_since(doc, 5).unwrap().is_empty());
        assert!(store.read_since(doc, 50).unwrap().is_empty());
    }

    #[test]
    fn test_append_unknown_document() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        assert_eq!(
            store.append(doc, change(doc, 1)),
            Err(StoreError::NotFound(doc))
        );
    }

    #[test]
    fn test_append_wrong_version_conflicts() {
        let (store, doc) = store_with_doc();
        store.append(doc, change(doc, 1)).unwrap();
        assert_eq!(
            store.append(doc, change(doc, 1)),
            Err(StoreError::Conflict { current: 1 })
        );
        assert_eq!(
            store.append(doc, change(doc, 3)),
            Err(StoreError::Conflict { current: 1 })
        );
        assert_eq!(store.read_since(doc, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (store, doc) = store_with_doc();
        let bad = vec![change(doc, 1), change(doc, 2), change(doc, 4)];
        assert!(store.append_batch(doc, bad).is_err());
        assert_eq!(store.current_version(doc).unwrap(), 0);
        assert!(store.read_since(doc, 0).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_document_rejected() {
        let store = MemoryStore::new();
        let doc = Document::new("Plan", Uuid::new_v4());
        store.create_document(doc.clone()).unwrap();
        assert_eq!(
            store.create_document(doc.clone()),
            Err(StoreError::AlreadyExists(doc.id))
        );
    }

    #[test]
    fn test_concurrent_appends_stay_contiguous() {
        let (store, doc) = store_with_doc();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut accepted = 0;
                    while accepted < 25 {
                        let next = store.current_version(doc).unwrap() + 1;
                        if store.append(doc, change(doc, next)).is_ok() {
                            accepted += 1;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all = store.read_since(doc, 0).unwrap();
        assert_eq!(all.len(), 200);
        for (i, c) in all.iter().enumerate() {
            assert_eq!(c.version, i as u64 + 1);
        }
    }

    #[test]
    fn test_collaborator_records_track_document() {
        let (store, doc) = store_with_doc();
        let user = Uuid::new_v4();
        store
            .put_collaborator(Collaborator {
                user_id: user,
                doc_id: doc,
                access: AccessLevel::Edit,
                added_by: Uuid::new_v4(),
                added_at: 1,
            })
            .unwrap();
        assert!(store.document(doc).unwrap().collaborators.contains(&user));
        assert_eq!(
            store.collaborator(doc, user).unwrap().unwrap().access,
            AccessLevel::Edit
        );

        assert!(store.remove_collaborator(doc, user).unwrap());
        assert!(!store.remove_collaborator(doc, user).unwrap());
        assert!(!store.document(doc).unwrap().collaborators.contains(&user));
    }

    #[test]
    fn test_share_links_per_document() {
        let (store, doc) = store_with_doc();
        let link = ShareLink {
            id: Uuid::new_v4(),
            doc_id: doc,
            access: AccessLevel::View,
            created_by: Uuid::new_v4(),
            created_at: 1,
            expires_at: None,
            active: true,
        };
        store.put_share_link(link.clone()).unwrap();
        assert_eq!(store.share_link(link.id).unwrap(), Some(link.clone()));
        assert_eq!(store.share_links(doc).unwrap(), vec![link]);
        assert!(store.share_links(Uuid::new_v4()).unwrap().is_empty());
    }
}
