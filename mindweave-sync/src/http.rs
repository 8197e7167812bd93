//! HTTP API: batch sync for clients without a live connection, plus
//! document creation and sharing.
//!
//! Batch submissions go through the same [`CollabHub`] as live ones, so
//! accepted changes are broadcast to connected sessions.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::hub::CollabHub;
use crate::identity::Credentials;
use crate::model::{AccessLevel, Change, Collaborator, Document, Identity, PendingChange, PresenceEntry, ShareLink};
use crate::reconciler::Reconciliation;

// ==================
// Errors
// ==================

/// [`SyncError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ValidationFailure => StatusCode::BAD_REQUEST,
            ErrorKind::Corrupt => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::TransportFailure => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind(),
            current_version: self.0.current_version(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub current_version: u64,
    pub changes: Vec<Change>,
}

/// One queued edit in a batch submission. A client-chosen id is kept.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedChange {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl From<SubmittedChange> for PendingChange {
    fn from(change: SubmittedChange) -> Self {
        let mut pending = PendingChange::new(change.payload);
        if let Some(id) = change.id {
            pending.id = id;
        }
        pending
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub base_version: u64,
    pub changes: Vec<SubmittedChange>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyncResponse {
    Accepted {
        version: u64,
        changes: Vec<Change>,
    },
    Conflict {
        current_version: u64,
        server_changes: Vec<Change>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateShareLinkRequest {
    pub access: AccessLevel,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateAccessRequest {
    pub access: AccessLevel,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub documents: usize,
}

// ==================
// Routes
// ==================

/// Create the API router.
pub fn router(hub: Arc<CollabHub>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Documents
        .route("/documents", post(create_document_handler))
        .route("/documents/:id", get(get_document_handler))
        .route("/documents/:id/changes", get(read_changes_handler))
        .route("/documents/:id/sync", post(sync_handler))
        .route("/documents/:id/presence", get(presence_handler))
        // Sharing
        .route(
            "/documents/:id/share-links",
            post(create_share_link_handler).get(list_share_links_handler),
        )
        .route("/share-links/:id", delete(deactivate_share_link_handler))
        .route("/share-links/:id/redeem", post(redeem_share_link_handler))
        // Collaborators
        .route("/documents/:id/collaborators", get(list_collaborators_handler))
        .route(
            "/documents/:id/collaborators/:user",
            put(update_access_handler).delete(remove_collaborator_handler),
        )
        .with_state(hub)
}

/// Serve the API until the listener fails.
pub async fn serve(addr: &str, hub: Arc<CollabHub>) -> SyncResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SyncError::TransportFailure(format!("bind {addr}: {e}")))?;
    log::info!("HTTP API listening on {addr}");
    axum::serve(listener, router(hub))
        .await
        .map_err(|e| SyncError::TransportFailure(e.to_string()))
}

// ==================
// Helper Functions
// ==================

/// Resolve the caller from `Authorization: Bearer` or the `x-user-*` headers.
fn identify(hub: &CollabHub, headers: &HeaderMap) -> SyncResult<Identity> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(token) = header("authorization").and_then(|v| v.strip_prefix("Bearer ")) {
        return hub.authenticate(&Credentials::token(token.trim()));
    }

    let id = header("x-user-id")
        .ok_or_else(|| SyncError::AccessDenied("no credentials presented".into()))?
        .parse::<Uuid>()
        .map_err(|_| SyncError::ValidationFailure("x-user-id is not a UUID".into()))?;
    let claimed = Identity::new(
        id,
        header("x-user-email").unwrap_or_default(),
        header("x-user-name").unwrap_or_default(),
    );
    hub.authenticate(&Credentials::claim(claimed))
}

// ==================
// Handlers
// ==================

async fn health_handler(State(hub): State<Arc<CollabHub>>) -> ApiResult<Json<HealthResponse>> {
    let documents = hub.list_documents()?.len();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        documents,
    }))
}

async fn create_document_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Json(request): Json<CreateDocumentRequest>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let caller = identify(&hub, &headers)?;
    let doc = hub.create_document(&caller, &request.title)?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn get_document_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
) -> ApiResult<Json<Document>> {
    let caller = identify(&hub, &headers)?;
    Ok(Json(hub.document(&caller, doc_id)?))
}

async fn read_changes_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Json<ChangesResponse>> {
    let caller = identify(&hub, &headers)?;
    let (current_version, changes) = hub.read_since(doc_id, &caller, query.since)?;
    Ok(Json(ChangesResponse {
        current_version,
        changes,
    }))
}

async fn sync_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<(StatusCode, Json<SyncResponse>)> {
    let caller = identify(&hub, &headers)?;
    let pending: Vec<PendingChange> = request.changes.into_iter().map(Into::into).collect();

    let outcome = hub
        .submit(doc_id, &caller, None, request.base_version, pending)
        .await?;
    Ok(match outcome {
        Reconciliation::Accepted {
            new_version,
            changes,
        } => (
            StatusCode::OK,
            Json(SyncResponse::Accepted {
                version: new_version,
                changes,
            }),
        ),
        Reconciliation::Conflict {
            current_version,
            server_changes,
        } => (
            StatusCode::CONFLICT,
            Json(SyncResponse::Conflict {
                current_version,
                server_changes,
            }),
        ),
    })
}

async fn presence_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
) -> ApiResult<Json<Vec<PresenceEntry>>> {
    let caller = identify(&hub, &headers)?;
    hub.access().require(doc_id, caller.id, AccessLevel::View)?;
    Ok(Json(hub.presence(doc_id)))
}

async fn create_share_link_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
    Json(request): Json<CreateShareLinkRequest>,
) -> ApiResult<(StatusCode, Json<ShareLink>)> {
    let caller = identify(&hub, &headers)?;
    let link = hub
        .access()
        .create_share_link(&caller, doc_id, request.access, request.expires_at)?;
    Ok((StatusCode::CREATED, Json(link)))
}

async fn list_share_links_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ShareLink>>> {
    let caller = identify(&hub, &headers)?;
    Ok(Json(hub.access().share_links(&caller, doc_id)?))
}

async fn deactivate_share_link_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(link_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let caller = identify(&hub, &headers)?;
    hub.access().deactivate_share_link(&caller, link_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn redeem_share_link_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(link_id): Path<Uuid>,
) -> ApiResult<Json<Collaborator>> {
    let caller = identify(&hub, &headers)?;
    Ok(Json(hub.access().redeem_share_link(link_id, &caller)?))
}

async fn list_collaborators_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path(doc_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Collaborator>>> {
    let caller = identify(&hub, &headers)?;
    Ok(Json(hub.access().list_collaborators(&caller, doc_id)?))
}

async fn update_access_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path((doc_id, user_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<UpdateAccessRequest>,
) -> ApiResult<Json<Collaborator>> {
    let caller = identify(&hub, &headers)?;
    let record = hub
        .access()
        .update_access(&caller, doc_id, user_id, request.access)?;
    Ok(Json(record))
}

async fn remove_collaborator_handler(
    State(hub): State<Arc<CollabHub>>,
    headers: HeaderMap,
    Path((doc_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let caller = identify(&hub, &headers)?;
    hub.access().remove_collaborator(&caller, doc_id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelEvent;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn user_request(method: &str, uri: &str, user: &Identity, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user.id.to_string())
            .header("x-user-email", user.email.as_str())
            .header("x-user-name", user.display_name.as_str());
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(hub: &Arc<CollabHub>, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router(hub.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create_doc(hub: &Arc<CollabHub>, owner: &Identity) -> Uuid {
        let (status, body) = call(
            hub,
            user_request("POST", "/documents", owner, Some(serde_json::json!({ "title": "Roadmap" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(&hub, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_identity_is_forbidden() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let request = Request::builder()
            .method("POST")
            .uri("/documents")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"title":"x"}"#))
            .unwrap();
        let (status, body) = call(&hub, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "access_denied");
    }

    #[tokio::test]
    async fn test_batch_sync_accept_then_conflict() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let owner = Identity::random("Owner");
        let doc = create_doc(&hub, &owner).await;
        let uri = format!("/documents/{doc}/sync");

        let batch = serde_json::json!({
            "base_version": 0,
            "changes": [{ "payload": [1, 2] }, { "payload": [3] }]
        });
        let (status, body) = call(&hub, user_request("POST", &uri, &owner, Some(batch))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["version"], 2);

        let stale = serde_json::json!({ "base_version": 1, "changes": [{ "payload": [9] }] });
        let (status, body) = call(&hub, user_request("POST", &uri, &owner, Some(stale))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "conflict");
        assert_eq!(body["current_version"], 2);
        assert_eq!(body["server_changes"].as_array().unwrap().len(), 1);

        let (status, body) = call(
            &hub,
            user_request("GET", &format!("/documents/{doc}/changes?since=0"), &owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_version"], 2);
        assert_eq!(body["changes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_sync_reaches_live_members() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let owner = Identity::random("Owner");
        let doc = create_doc(&hub, &owner).await;
        let mut live = hub.join(doc, &owner, Uuid::new_v4(), 0).unwrap();
        while live.subscription.try_recv().unwrap().is_some() {}

        let batch = serde_json::json!({ "base_version": 0, "changes": [{ "payload": [42] }] });
        let (status, _) = call(
            &hub,
            user_request("POST", &format!("/documents/{doc}/sync"), &owner, Some(batch)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let event = live.subscription.try_recv().unwrap().unwrap();
        match event.as_ref() {
            ChannelEvent::Change { origin, change } => {
                assert_eq!(*origin, None);
                assert_eq!(change.payload, vec![42]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let owner = Identity::random("Owner");
        let stranger = Identity::random("Stranger");
        let doc = create_doc(&hub, &owner).await;

        let (status, _) = call(
            &hub,
            user_request("GET", &format!("/documents/{}/changes", Uuid::new_v4()), &owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&hub, user_request("GET", &format!("/documents/{doc}/changes"), &stranger, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &hub,
            user_request("GET", &format!("/documents/{doc}/changes?since=5"), &owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "corrupt");

        let empty = serde_json::json!({ "base_version": 0, "changes": [] });
        let (status, body) = call(
            &hub,
            user_request("POST", &format!("/documents/{doc}/sync"), &owner, Some(empty)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_failure");
    }

    #[tokio::test]
    async fn test_share_link_flow() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let owner = Identity::random("Owner");
        let guest = Identity::random("Guest");
        let doc = create_doc(&hub, &owner).await;

        let (status, link) = call(
            &hub,
            user_request(
                "POST",
                &format!("/documents/{doc}/share-links"),
                &owner,
                Some(serde_json::json!({ "access": "edit" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let link_id = link["id"].as_str().unwrap().to_string();

        let (status, record) = call(
            &hub,
            user_request("POST", &format!("/share-links/{link_id}/redeem"), &guest, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["access"], "edit");

        let (status, list) = call(
            &hub,
            user_request("GET", &format!("/documents/{doc}/collaborators"), &guest, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 2);

        let (status, _) = call(
            &hub,
            user_request("DELETE", &format!("/share-links/{link_id}"), &owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let late = Identity::random("Late");
        let (status, _) = call(
            &hub,
            user_request("POST", &format!("/share-links/{link_id}/redeem"), &late, None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_collaborator_management() {
        let hub = Arc::new(CollabHub::in_memory(16));
        let owner = Identity::random("Owner");
        let member = Identity::random("Member");
        let doc = create_doc(&hub, &owner).await;
        let uri = format!("/documents/{doc}/collaborators/{}", member.id);

        let (status, record) = call(
            &hub,
            user_request("PUT", &uri, &owner, Some(serde_json::json!({ "access": "view" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["access"], "view");

        // Owner cannot be granted.
        let (status, _) = call(
            &hub,
            user_request("PUT", &uri, &owner, Some(serde_json::json!({ "access": "owner" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&hub, user_request("DELETE", &uri, &owner, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let owner_uri = format!("/documents/{doc}/collaborators/{}", owner.id);
        let (status, _) = call(&hub, user_request("DELETE", &owner_uri, &owner, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
