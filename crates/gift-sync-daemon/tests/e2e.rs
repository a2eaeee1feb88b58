//! End-to-end tests for the sync daemon components.
//!
//! Runs `SyncManager` over a real `FileLocalStore` and `HttpRemoteStore`
//! against an in-process mock of the document API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use gift_sync_core::{
    Entity, EntityType, Gift, LocalStore, OfflineRepository, QueueStatus, SharedGate, SyncError, SyncManager,
    SyncState,
};
use gift_sync_daemon::{FileLocalStore, HttpRemoteStore, NetworkProbe};
use serde_json::{Value, json};
use tempfile::TempDir;

const USER: &str = "u1";
const TOKEN: &str = "secret-token";

type DocKey = (String, String, String);

/// In-memory document server speaking the REST document API.
#[derive(Clone, Default)]
struct MockServer {
    docs: Arc<Mutex<BTreeMap<DocKey, Value>>>,
}

impl MockServer {
    fn insert(&self, collection: &str, id: &str, doc: Value) {
        self.docs
            .lock()
            .unwrap()
            .insert((USER.into(), collection.into(), id.into()), doc);
    }

    fn doc(&self, collection: &str, id: &str) -> Option<Value> {
        self.docs
            .lock()
            .unwrap()
            .get(&(USER.into(), collection.into(), id.into()))
            .cloned()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_docs(
    State(server): State<MockServer>,
    Path((user, collection)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let documents: Vec<Value> = server
        .docs
        .lock()
        .unwrap()
        .iter()
        .filter(|((u, c, _), _)| *u == user && *c == collection)
        .map(|(_, doc)| doc.clone())
        .collect();
    Ok(Json(json!({ "documents": documents })))
}

async fn put_doc(
    State(server): State<MockServer>,
    Path((user, collection, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(doc): Json<Value>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let mut docs = server.docs.lock().unwrap();
    let key = (user, collection, id);
    if headers.contains_key(IF_NONE_MATCH) && docs.contains_key(&key) {
        return StatusCode::PRECONDITION_FAILED;
    }
    docs.insert(key, doc);
    StatusCode::OK
}

async fn delete_doc(
    State(server): State<MockServer>,
    Path((user, collection, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match server.docs.lock().unwrap().remove(&(user, collection, id)) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

/// Start the mock server; returns its base URL.
async fn start_server(server: MockServer) -> String {
    let app = Router::new()
        .route("/health", get(health))
        .route("/users/{user}/{collection}", get(list_docs))
        .route("/users/{user}/{collection}/{id}", put(put_doc).delete(delete_doc))
        .with_state(server);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Client {
    _dir: TempDir,
    local: Arc<FileLocalStore>,
    gate: Arc<SharedGate>,
    manager: SyncManager<FileLocalStore, HttpRemoteStore>,
    repo: OfflineRepository<FileLocalStore>,
}

async fn client(base_url: &str, token: &str) -> Client {
    let dir = TempDir::new().unwrap();
    let local = Arc::new(FileLocalStore::open(dir.path()).await.unwrap());
    let remote =
        HttpRemoteStore::new(base_url, Some(token.into()), Duration::from_secs(5)).unwrap();
    let gate = Arc::new(SharedGate::new(true, true, Some(USER.into())));
    let manager = SyncManager::new(
        Arc::clone(&local),
        Arc::new(remote),
        gate.clone(),
        Default::default(),
    );
    let repo = OfflineRepository::new(manager.queue().clone(), Arc::clone(&local));
    Client {
        _dir: dir,
        local,
        gate,
        manager,
        repo,
    }
}

fn gift(id: &str, name: &str) -> Entity {
    let epoch = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
    Entity::Gift(Gift {
        id: id.into(),
        user_id: USER.into(),
        name: name.into(),
        description: None,
        giver_id: Some("p1".into()),
        category: None,
        occasion: Some("Wedding".into()),
        estimated_value: Some(120.0),
        received_at: None,
        image_ids: Vec::new(),
        needs_return: true,
        created_at: epoch,
        updated_at: epoch,
    })
}

#[tokio::test]
async fn test_push_encodes_timestamps_and_pull_decodes_legacy_documents() {
    let server = MockServer::default();
    // Written by another client with the older timestamp encoding
    server.insert(
        "persons",
        "p1",
        json!({
            "id": "p1",
            "userId": USER,
            "name": "Aunt May",
            "createdAt": { "_seconds": 1_700_000_000i64, "_nanoseconds": 0 },
            "updatedAt": { "_seconds": 1_700_000_000i64, "_nanoseconds": 0 },
        }),
    );
    let base = start_server(server.clone()).await;
    let c = client(&base, TOKEN).await;

    c.repo.create(gift("g1", "Wedding Set")).await.unwrap();
    let state = c.manager.trigger_sync(USER).await.unwrap();

    assert_eq!(state.pending_operations, 0);
    assert!(state.error.is_none());
    assert!(state.last_sync_time.is_some());

    let doc = server.doc("gifts", "g1").expect("gift pushed");
    assert_eq!(doc["name"], "Wedding Set");
    assert!(doc["updatedAt"]["seconds"].is_i64());
    assert!(doc["updatedAt"]["nanoseconds"].is_u64());
    assert!(doc.get("entityType").is_none());

    let person = c.local.get(EntityType::Person, "p1").await.unwrap();
    assert!(matches!(person, Some(Entity::Person(p)) if p.name == "Aunt May"));

    // Pulling the just-pushed gift back is a no-op
    let local_gift = c.local.get(EntityType::Gift, "g1").await.unwrap();
    c.manager.trigger_sync(USER).await.unwrap();
    assert_eq!(c.local.get(EntityType::Gift, "g1").await.unwrap(), local_gift);
}

#[tokio::test]
async fn test_create_against_existing_document_falls_back_to_update() {
    let server = MockServer::default();
    server.insert("gifts", "g1", json!({ "id": "g1", "stale": true }));
    let base = start_server(server.clone()).await;
    let c = client(&base, TOKEN).await;

    c.repo.create(gift("g1", "Wedding Set")).await.unwrap();
    let state = c.manager.trigger_sync(USER).await.unwrap();

    assert!(state.error.is_none());
    let doc = server.doc("gifts", "g1").unwrap();
    assert_eq!(doc["name"], "Wedding Set");
    assert!(doc.get("stale").is_none());
}

#[tokio::test]
async fn test_delete_propagates_and_missing_documents_count_as_deleted() {
    let server = MockServer::default();
    let base = start_server(server.clone()).await;
    let c = client(&base, TOKEN).await;

    c.repo.create(gift("g1", "Vase")).await.unwrap();
    c.manager.trigger_sync(USER).await.unwrap();
    assert!(server.doc("gifts", "g1").is_some());

    c.repo.delete(USER, EntityType::Gift, "g1").await.unwrap();
    // Never reached the server
    c.repo.delete(USER, EntityType::Gift, "g-unknown").await.unwrap();

    let state = c.manager.trigger_sync(USER).await.unwrap();
    assert!(state.error.is_none());
    assert_eq!(state.pending_operations, 0);
    assert!(server.doc("gifts", "g1").is_none());
    assert!(c.local.get(EntityType::Gift, "g1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_credentials_stop_the_cycle() {
    let server = MockServer::default();
    let base = start_server(server.clone()).await;
    let c = client(&base, "expired-token").await;

    c.repo.create(gift("g1", "Wedding Set")).await.unwrap();
    let state = c.manager.trigger_sync(USER).await.unwrap();

    assert_eq!(
        state.error,
        Some(SyncError::AuthExpired {
            user_id: USER.into()
        })
    );
    assert!(state.last_sync_time.is_none());
    assert!(server.doc("gifts", "g1").is_none());

    let items = c.manager.queue().list_pending().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Pending);
    assert_eq!(items[0].retry_count, 0);
}

#[tokio::test]
async fn test_offline_changes_sync_once_reachable() {
    // Nothing listening here
    let dead_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let dead_base = format!("http://127.0.0.1:{dead_port}");

    let server = MockServer::default();
    let base = start_server(server.clone()).await;
    let c = client(&base, TOKEN).await;

    assert!(!NetworkProbe::new(&dead_base).unwrap().refresh(&c.gate).await);
    c.repo.create(gift("g1", "Wedding Set")).await.unwrap();

    let state = c.manager.trigger_sync(USER).await.unwrap();
    assert_eq!(state, SyncState::default());
    assert!(server.doc("gifts", "g1").is_none());

    assert!(NetworkProbe::new(&base).unwrap().refresh(&c.gate).await);
    let state = c.manager.trigger_sync(USER).await.unwrap();
    assert_eq!(state.pending_operations, 0);
    assert!(server.doc("gifts", "g1").is_some());
}

#[tokio::test]
async fn test_unreachable_remote_keeps_items_queued() {
    let dead_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let c = client(&format!("http://127.0.0.1:{dead_port}"), TOKEN).await;

    c.repo.create(gift("g1", "Wedding Set")).await.unwrap();
    // The gate still believes we are online; the request itself fails
    let state = c.manager.trigger_sync(USER).await.unwrap();

    assert_eq!(state.pending_operations, 1);
    assert!(matches!(
        state.error,
        Some(SyncError::Item { terminal: false, .. }) | Some(SyncError::Pull { .. })
    ));
    let items = c.manager.queue().list_pending().await.unwrap();
    assert_eq!(items[0].retry_count, 1);
    assert_eq!(items[0].status, QueueStatus::Failed);
}
