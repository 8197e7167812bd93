//! Access levels and share links.
//!
//! Durable records only. Who is *online* lives in
//! [`PresenceRegistry`](crate::presence::PresenceRegistry); the two share
//! nothing but the user id.
//!
//! | Operation               | Required level        |
//! |-------------------------|-----------------------|
//! | join / read / list      | View                  |
//! | submit changes          | Edit                  |
//! | share links, grants     | Owner                 |
//! | remove self             | any collaborator      |

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::model::{now_millis, AccessLevel, Collaborator, Document, Identity, ShareLink};
use crate::storage::Store;

/// Longest accepted document title, in bytes.
pub const MAX_TITLE_BYTES: usize = 512;

pub struct AccessControl {
    store: Arc<dyn Store>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a document owned by `owner`.
    pub fn create_document(&self, owner: &Identity, title: &str) -> SyncResult<Document> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::ValidationFailure("title must not be empty".into()));
        }
        if title.len() > MAX_TITLE_BYTES {
            return Err(SyncError::ValidationFailure(format!(
                "title exceeds {MAX_TITLE_BYTES} bytes"
            )));
        }

        let mut doc = self.store.create_document(Document::new(title, owner.id))?;
        let record = Collaborator {
            user_id: owner.id,
            doc_id: doc.id,
            access: AccessLevel::Owner,
            added_by: owner.id,
            added_at: doc.created_at,
        };
        self.store.put_collaborator(record)?;
        doc.collaborators.insert(owner.id);
        log::info!("Created document {} '{}' for {}", doc.id, doc.title, owner.id);
        Ok(doc)
    }

    /// Level `identity` joins `doc_id` with.
    pub fn can_join(&self, doc_id: Uuid, identity: &Identity) -> SyncResult<AccessLevel> {
        self.require(doc_id, identity.id, AccessLevel::View)
    }

    /// Check that `user_id` holds at least `minimum` on `doc_id`.
    pub fn require(&self, doc_id: Uuid, user_id: Uuid, minimum: AccessLevel) -> SyncResult<AccessLevel> {
        // NotFound before AccessDenied
        self.store.document(doc_id)?;
        match self.store.collaborator(doc_id, user_id)? {
            Some(record) if record.access >= minimum => Ok(record.access),
            Some(record) => Err(SyncError::AccessDenied(format!(
                "{minimum} access required, user {user_id} has {}",
                record.access
            ))),
            None => Err(SyncError::AccessDenied(format!(
                "user {user_id} is not a collaborator on {doc_id}"
            ))),
        }
    }

    pub fn create_share_link(
        &self,
        caller: &Identity,
        doc_id: Uuid,
        access: AccessLevel,
        expires_at: Option<u64>,
    ) -> SyncResult<ShareLink> {
        self.require(doc_id, caller.id, AccessLevel::Owner)?;
        if access == AccessLevel::Owner {
            return Err(SyncError::ValidationFailure(
                "share links cannot grant owner access".into(),
            ));
        }
        let now = now_millis();
        if expires_at.is_some_and(|exp| exp <= now) {
            return Err(SyncError::ValidationFailure("expiry must lie in the future".into()));
        }

        let link = ShareLink {
            id: Uuid::new_v4(),
            doc_id,
            access,
            created_by: caller.id,
            created_at: now,
            expires_at,
            active: true,
        };
        self.store.put_share_link(link.clone())?;
        log::info!("Share link {} ({access}) created on {doc_id}", link.id);
        Ok(link)
    }

    /// Grant the link's level to `identity`. Never lowers an existing level.
    pub fn redeem_share_link(&self, link_id: Uuid, identity: &Identity) -> SyncResult<Collaborator> {
        let link = self
            .store
            .share_link(link_id)?
            .ok_or_else(|| SyncError::NotFound(format!("share link {link_id}")))?;
        if !link.is_usable(now_millis()) {
            return Err(SyncError::AccessDenied(format!(
                "share link {link_id} is expired or deactivated"
            )));
        }

        if let Some(existing) = self.store.collaborator(link.doc_id, identity.id)? {
            if existing.access >= link.access {
                return Ok(existing);
            }
        }

        let record = Collaborator {
            user_id: identity.id,
            doc_id: link.doc_id,
            access: link.access,
            added_by: link.created_by,
            added_at: now_millis(),
        };
        self.store.put_collaborator(record.clone())?;
        log::info!(
            "User {} joined {} as {} via link {link_id}",
            identity.id,
            link.doc_id,
            link.access
        );
        Ok(record)
    }

    pub fn deactivate_share_link(&self, caller: &Identity, link_id: Uuid) -> SyncResult<ShareLink> {
        let mut link = self
            .store
            .share_link(link_id)?
            .ok_or_else(|| SyncError::NotFound(format!("share link {link_id}")))?;
        self.require(link.doc_id, caller.id, AccessLevel::Owner)?;
        if link.active {
            link.active = false;
            self.store.put_share_link(link.clone())?;
        }
        Ok(link)
    }

    pub fn share_links(&self, caller: &Identity, doc_id: Uuid) -> SyncResult<Vec<ShareLink>> {
        self.require(doc_id, caller.id, AccessLevel::Owner)?;
        Ok(self.store.share_links(doc_id)?)
    }

    pub fn list_collaborators(&self, caller: &Identity, doc_id: Uuid) -> SyncResult<Vec<Collaborator>> {
        self.require(doc_id, caller.id, AccessLevel::View)?;
        Ok(self.store.collaborators(doc_id)?)
    }

    /// Grant or change `target`'s level. Owner only.
    pub fn update_access(
        &self,
        caller: &Identity,
        doc_id: Uuid,
        target: Uuid,
        level: AccessLevel,
    ) -> SyncResult<Collaborator> {
        self.require(doc_id, caller.id, AccessLevel::Owner)?;
        if level == AccessLevel::Owner {
            return Err(SyncError::ValidationFailure("owner access cannot be granted".into()));
        }
        let doc = self.store.document(doc_id)?;
        if target == doc.creator {
            return Err(SyncError::AccessDenied("the owner's access cannot be changed".into()));
        }

        let record = match self.store.collaborator(doc_id, target)? {
            Some(existing) => Collaborator {
                access: level,
                ..existing
            },
            None => Collaborator {
                user_id: target,
                doc_id,
                access: level,
                added_by: caller.id,
                added_at: now_millis(),
            },
        };
        self.store.put_collaborator(record.clone())?;
        log::info!("User {target} now has {level} on {doc_id}");
        Ok(record)
    }

    /// Owner removes anyone but themselves; collaborators may remove themselves.
    pub fn remove_collaborator(&self, caller: &Identity, doc_id: Uuid, target: Uuid) -> SyncResult<()> {
        let doc = self.store.document(doc_id)?;
        if target == doc.creator {
            return Err(SyncError::AccessDenied("the owner cannot be removed".into()));
        }
        if caller.id != target {
            self.require(doc_id, caller.id, AccessLevel::Owner)?;
        }
        if !self.store.remove_collaborator(doc_id, target)? {
            return Err(SyncError::NotFound(format!(
                "collaborator {target} on document {doc_id}"
            )));
        }
        log::info!("User {target} removed from {doc_id}");
        Ok(())
    }
}
