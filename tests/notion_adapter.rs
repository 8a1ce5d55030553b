//! The Notion adapter against a fake Notion API served by axum.

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use docsync::blocks;
use docsync::config::{ConflictPolicy, FilterConfig, RemoteConfig};
use docsync::connector_notion::NotionRemote;
use docsync::models::SyncMode;
use docsync::registry::{Filters, Mapping};
use docsync::remote::{RemoteAdapter, RemoteError};
use docsync::report::Outcome;
use docsync::state::InMemoryStateStore;
use docsync::sync::{Binding, CancellationToken, Orchestrator, SyncOptions, SyncSettings, UNCHANGED};

const TOKEN: &str = "secret-token";
const DB_ID: &str = "0123456789abcdef0123456789abcdef";
const PAGE_ID: &str = "fedcba9876543210fedcba9876543210";
const QUERY_PAGE: usize = 2;
const BLOCK_PAGE: usize = 50;

// ============ Fake Notion ============

struct FakePage {
    parent: Value,
    title_property: String,
    title: String,
    archived: bool,
    edited: String,
}

#[derive(Default)]
struct Fake {
    pages: HashMap<String, FakePage>,
    children: HashMap<String, Vec<Value>>,
    clock: i64,
    next_id: u64,
    requests: Vec<String>,
    fail_deletes: bool,
}

type Shared = Arc<Mutex<Fake>>;

impl Fake {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:032x}", self.next_id)
    }

    fn tick(&mut self) -> String {
        self.clock += 1;
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (base + chrono::Duration::minutes(self.clock))
            .format("%Y-%m-%dT%H:%M:00.000Z")
            .to_string()
    }

    fn touch(&mut self, page_id: &str) {
        let edited = self.tick();
        if let Some(page) = self.pages.get_mut(page_id) {
            page.edited = edited;
        }
    }

    fn page_json(&self, id: &str) -> Option<Value> {
        let page = self.pages.get(id)?;
        let mut properties = serde_json::Map::new();
        properties.insert(
            page.title_property.clone(),
            json!({ "type": "title", "title": [{ "plain_text": page.title }] }),
        );
        Some(json!({
            "object": "page",
            "id": id,
            "parent": page.parent,
            "archived": page.archived,
            "last_edited_time": page.edited,
            "properties": properties,
        }))
    }

    fn append(&mut self, parent: &str, blocks: Vec<Value>) {
        for mut block in blocks {
            let id = self.new_id();
            block["id"] = json!(id);
            if block["type"] == "table" {
                let rows = block["table"]
                    .as_object_mut()
                    .and_then(|t| t.remove("children"))
                    .and_then(|c| c.as_array().cloned())
                    .unwrap_or_default();
                block["has_children"] = json!(true);
                self.append(&id, rows);
            }
            self.children.entry(parent.to_string()).or_default().push(block);
        }
    }

    /// Page owning the block list `parent`.
    fn owner(&self, block_id: &str) -> Option<String> {
        self.children.iter().find_map(|(parent, list)| {
            list.iter()
                .any(|b| b["id"] == block_id)
                .then(|| parent.clone())
        })
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "object": "error", "code": "object_not_found" })),
    )
        .into_response()
}

fn paginate(items: Vec<Value>, cursor: Option<&str>, size: usize) -> Value {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + size).min(items.len());
    let has_more = end < items.len();
    let results: Vec<Value> = items[start.min(end)..end].to_vec();
    json!({
        "object": "list",
        "results": results,
        "has_more": has_more,
        "next_cursor": if has_more { json!(end.to_string()) } else { Value::Null },
    })
}

async fn require_auth(
    State(state): State<Shared>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    let auth = headers.get("Authorization").and_then(|v| v.to_str().ok());
    let version = headers.get("Notion-Version");
    let expected = format!("Bearer {}", TOKEN);
    if auth != Some(expected.as_str()) || version.is_none() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let line = format!("{} {}", req.method(), req.uri().path());
    state.lock().unwrap().requests.push(line);
    next.run(req).await
}

async fn get_database(Path(id): Path<String>) -> Response {
    if id != DB_ID {
        return not_found();
    }
    Json(json!({
        "object": "database",
        "id": DB_ID,
        "properties": {
            "Tags": { "type": "multi_select" },
            "Document": { "type": "title" }
        }
    }))
    .into_response()
}

async fn query_database(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let fake = state.lock().unwrap();
    let mut ids: Vec<&String> = fake
        .pages
        .iter()
        .filter(|(_, p)| p.parent["database_id"] == id.as_str() && !p.archived)
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    let rows: Vec<Value> = ids.iter().filter_map(|id| fake.page_json(id)).collect();
    Json(paginate(rows, body["start_cursor"].as_str(), QUERY_PAGE)).into_response()
}

async fn create_page(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut fake = state.lock().unwrap();
    let Some((title_property, title)) = body["properties"]
        .as_object()
        .and_then(|p| p.iter().next())
        .map(|(k, v)| (k.clone(), blocks::plain_text(&v["title"])))
    else {
        return (StatusCode::BAD_REQUEST, "missing title").into_response();
    };
    let id = fake.new_id();
    let edited = fake.tick();
    let parent = body["parent"].clone();

    if let Some(parent_page) = parent["page_id"].as_str() {
        let link = json!({
            "object": "block",
            "id": id,
            "type": "child_page",
            "last_edited_time": edited,
            "child_page": { "title": title },
        });
        fake.children
            .entry(parent_page.to_string())
            .or_default()
            .push(link);
    }
    fake.pages.insert(
        id.clone(),
        FakePage {
            parent,
            title_property,
            title,
            archived: false,
            edited,
        },
    );
    let children = body["children"].as_array().cloned().unwrap_or_default();
    if children.len() > 100 {
        return (StatusCode::BAD_REQUEST, "too many children").into_response();
    }
    fake.append(&id, children);
    Json(fake.page_json(&id)).into_response()
}

async fn get_page(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    match state.lock().unwrap().page_json(&id) {
        Some(page) => Json(page).into_response(),
        None => not_found(),
    }
}

async fn update_page(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut fake = state.lock().unwrap();
    if !fake.pages.contains_key(&id) {
        return not_found();
    }
    if let Some(archived) = body["archived"].as_bool() {
        fake.pages.get_mut(&id).unwrap().archived = archived;
    }
    fake.touch(&id);
    Json(fake.page_json(&id)).into_response()
}

async fn list_block_children(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let fake = state.lock().unwrap();
    let items = fake.children.get(&id).cloned().unwrap_or_default();
    let size = params
        .get("page_size")
        .and_then(|s| s.parse().ok())
        .unwrap_or(BLOCK_PAGE)
        .min(BLOCK_PAGE);
    Json(paginate(items, params.get("start_cursor").map(String::as_str), size)).into_response()
}

async fn append_block_children(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut fake = state.lock().unwrap();
    let children = body["children"].as_array().cloned().unwrap_or_default();
    if children.len() > 100 {
        return (StatusCode::BAD_REQUEST, "too many children").into_response();
    }
    fake.append(&id, children);
    fake.touch(&id);
    Json(json!({ "object": "list", "results": [] })).into_response()
}

async fn delete_block(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut fake = state.lock().unwrap();
    if fake.fail_deletes {
        return (StatusCode::BAD_GATEWAY, "upstream").into_response();
    }
    let Some(owner) = fake.owner(&id) else {
        return not_found();
    };
    if let Some(list) = fake.children.get_mut(&owner) {
        list.retain(|b| b["id"] != id.as_str());
    }
    fake.touch(&owner);
    Json(json!({ "object": "block", "id": id, "archived": true })).into_response()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn fake_notion() -> (Shared, NotionRemote) {
    let state: Shared = Arc::new(Mutex::new(Fake::default()));
    let app = Router::new()
        .route("/databases/{id}", get(get_database))
        .route("/databases/{id}/query", post(query_database))
        .route("/pages", post(create_page))
        .route("/pages/{id}", get(get_page).patch(update_page))
        .route(
            "/blocks/{id}/children",
            get(list_block_children).patch(append_block_children),
        )
        .route("/blocks/{id}", axum::routing::delete(delete_block))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());
    let base = serve(app).await;
    let remote = NotionRemote::new(&base, TOKEN, "2022-06-28", Duration::from_secs(5)).unwrap();
    (state, remote)
}

fn count(state: &Shared, line: &str) -> usize {
    let fake = state.lock().unwrap();
    fake.requests
        .iter()
        .filter(|r| r.starts_with(line))
        .count()
}

const SAMPLE: &str = "# Setup\n\nInstall the CLI first.\n\n```bash\ncargo install docsync\n```\n\n| Key | Value |\n| --- | --- |\n| token | env |\n\n- one\n- two\n";

fn normalized(markdown: &str) -> String {
    blocks::render_markdown(&blocks::parse_markdown(markdown))
}

// ============ Adapter ============

#[tokio::test]
async fn create_and_fetch_through_a_database() {
    let (_state, remote) = fake_notion().await;
    assert!(remote.validate_target(DB_ID).is_ok());

    let meta = remote
        .create(DB_ID, "guides/setup.md", SAMPLE.as_bytes())
        .await
        .unwrap();
    assert_eq!(meta.name, "guides/setup.md");
    assert!(meta.version.is_some());

    let fetched = remote.fetch(&meta.id).await.unwrap().unwrap();
    assert_eq!(fetched.meta.name, "guides/setup.md");
    let text = String::from_utf8(fetched.content).unwrap();
    assert_eq!(text, normalized(SAMPLE));
    assert!(text.contains("| token | env |"));
    assert!(text.contains("```bash"));
}

#[tokio::test]
async fn database_listing_follows_cursors_and_skips_archived() {
    let (state, remote) = fake_notion().await;
    let mut ids = Vec::new();
    for name in ["c.md", "a.md", "e.md", "b.md", "d.md"] {
        ids.push(remote.create(DB_ID, name, b"text").await.unwrap().id);
    }
    remote.delete(&ids[2]).await.unwrap();

    let listed = remote.list_children(DB_ID).await.unwrap();
    let names: Vec<&str> = listed.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["a.md", "b.md", "c.md", "d.md"]);
    assert!(count(&state, &format!("POST /databases/{}/query", DB_ID)) >= 2);
    assert_eq!(count(&state, &format!("GET /databases/{}", DB_ID)), 1);
}

#[tokio::test]
async fn page_parent_lists_child_pages() {
    let (_state, remote) = fake_notion().await;
    let meta = remote.create(PAGE_ID, "a.md", b"hello").await.unwrap();

    let listed = remote.list_children(PAGE_ID).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "a.md");
    assert_eq!(listed[0].id, meta.id);
}

#[tokio::test]
async fn update_replaces_content_and_checks_version() {
    let (_state, remote) = fake_notion().await;
    let meta = remote.create(DB_ID, "a.md", b"first\n").await.unwrap();

    let stale = remote
        .update(&meta.id, b"second\n", Some("2000-01-01T00:00:00.000Z"))
        .await
        .unwrap_err();
    assert!(matches!(stale, RemoteError::VersionConflict { .. }));

    let updated = remote
        .update(&meta.id, b"second\n", meta.version.as_deref())
        .await
        .unwrap();
    assert_ne!(updated.version, meta.version);

    let fetched = remote.fetch(&meta.id).await.unwrap().unwrap();
    assert_eq!(fetched.content, normalized("second\n").into_bytes());
}

#[tokio::test]
async fn update_appends_before_removing_old_blocks() {
    let (state, remote) = fake_notion().await;
    let meta = remote.create(DB_ID, "a.md", b"first\n\nkept\n").await.unwrap();
    state.lock().unwrap().requests.clear();

    remote
        .update(&meta.id, b"second\n", meta.version.as_deref())
        .await
        .unwrap();

    let requests = state.lock().unwrap().requests.clone();
    let append = format!("PATCH /blocks/{}/children", meta.id);
    let last_append = requests.iter().rposition(|r| *r == append).unwrap();
    let first_delete = requests
        .iter()
        .position(|r| r.starts_with("DELETE /blocks/"))
        .unwrap();
    assert!(last_append < first_delete, "{:?}", requests);
    assert_eq!(count(&state, "DELETE /blocks/"), 2);
}

#[tokio::test]
async fn interrupted_update_keeps_previous_content() {
    let (state, remote) = fake_notion().await;
    let meta = remote.create(DB_ID, "a.md", b"first\n").await.unwrap();
    state.lock().unwrap().fail_deletes = true;

    let err = remote
        .update(&meta.id, b"second\n", meta.version.as_deref())
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let fetched = remote.fetch(&meta.id).await.unwrap().unwrap();
    let text = String::from_utf8(fetched.content).unwrap();
    assert!(text.contains("first"), "{}", text);
    assert!(text.contains("second"), "{}", text);
}

#[tokio::test]
async fn rate_limit_applies_to_each_http_request() {
    let (state, remote) = fake_notion().await;
    let remote = remote.with_rate_limit(10.0, 1);
    let markdown: String = (0..250).map(|i| format!("paragraph {}\n\n", i)).collect();

    let started = std::time::Instant::now();
    remote.create(DB_ID, "long.md", markdown.as_bytes()).await.unwrap();
    let elapsed = started.elapsed();

    // One operation, five requests: database lookup, create, two appends, readback.
    let requests = state.lock().unwrap().requests.len();
    assert_eq!(requests, 5);
    assert!(elapsed >= Duration::from_millis(350), "{:?}", elapsed);
}

#[tokio::test]
async fn long_documents_are_written_in_batches() {
    let (state, remote) = fake_notion().await;
    let markdown: String = (0..250).map(|i| format!("paragraph {}\n\n", i)).collect();

    let meta = remote.create(DB_ID, "long.md", markdown.as_bytes()).await.unwrap();
    assert_eq!(count(&state, "POST /pages"), 1);
    assert_eq!(count(&state, &format!("PATCH /blocks/{}/children", meta.id)), 2);

    let fetched = remote.fetch(&meta.id).await.unwrap().unwrap();
    let text = String::from_utf8(fetched.content).unwrap();
    assert!(text.starts_with("paragraph 0\n"));
    assert!(text.contains("paragraph 249"));
    assert_eq!(text.matches("paragraph").count(), 250);
}

#[tokio::test]
async fn archived_pages_read_as_absent() {
    let (_state, remote) = fake_notion().await;
    let meta = remote.create(DB_ID, "a.md", b"bye").await.unwrap();
    remote.delete(&meta.id).await.unwrap();

    assert!(remote.fetch(&meta.id).await.unwrap().is_none());
    let err = remote.update(&meta.id, b"again", None).await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
    assert!(remote.fetch("ffffffffffffffffffffffffffffffff").await.unwrap().is_none());
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let state: Shared = Arc::new(Mutex::new(Fake::default()));
    let app = Router::new()
        .route("/pages/{id}", get(get_page))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);
    let url = serve(app).await;

    let intruder = NotionRemote::new(&url, "wrong", "2022-06-28", Duration::from_secs(5)).unwrap();
    let err = intruder.fetch("abc").await.unwrap_err();
    assert!(matches!(err, RemoteError::Unauthorized(_)));
    assert!(!err.is_retryable());
}

async fn flaky_page(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "limited" => (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "7")], "slow down").into_response(),
        "broken" => (StatusCode::BAD_GATEWAY, "upstream").into_response(),
        "invalid" => (StatusCode::BAD_REQUEST, "validation_error").into_response(),
        _ => (StatusCode::OK, "not json").into_response(),
    }
}

#[tokio::test]
async fn http_failures_map_to_remote_errors() {
    let url = serve(Router::new().route("/pages/{id}", get(flaky_page))).await;
    let remote = NotionRemote::new(&url, TOKEN, "2022-06-28", Duration::from_secs(5)).unwrap();

    let limited = remote.fetch("limited").await.unwrap_err();
    assert_eq!(
        limited,
        RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
    assert!(matches!(
        remote.fetch("broken").await.unwrap_err(),
        RemoteError::Server { status: 502, .. }
    ));
    let invalid = remote.fetch("invalid").await.unwrap_err();
    assert!(matches!(invalid, RemoteError::Rejected { status: 400, .. }));
    assert!(!invalid.is_retryable());
    assert!(matches!(
        remote.fetch("garbage").await.unwrap_err(),
        RemoteError::InvalidResponse(_)
    ));
}

#[test]
fn missing_token_is_a_configuration_error() {
    let mut config = RemoteConfig::default();
    config.notion.token_env = "DOCSYNC_TEST_TOKEN_THAT_IS_NEVER_SET".to_string();
    let err = NotionRemote::from_config(&config).err().unwrap();
    assert!(err.to_string().contains("DOCSYNC_TEST_TOKEN_THAT_IS_NEVER_SET"));
}

// ============ Full cycle ============

#[tokio::test]
async fn sync_cycle_against_notion_is_idempotent() {
    let (_state, remote) = fake_notion().await;
    let remote: Arc<dyn RemoteAdapter> = Arc::new(remote);
    let tmp = TempDir::new().unwrap();
    // Not in the canonical rendering: trailing spaces and a `*` bullet.
    fs::write(tmp.path().join("a.md"), "# Title  \n\n* item\n").unwrap();
    fs::write(tmp.path().join("b.md"), SAMPLE).unwrap();

    let binding = Binding {
        mapping: Mapping {
            name: "notion".to_string(),
            source_root: tmp.path().to_path_buf(),
            target_id: DB_ID.to_string(),
            mode: SyncMode::Bidirectional,
            conflict_policy: ConflictPolicy::Newest,
            filters: Filters::compile(&FilterConfig::default()).unwrap(),
            follow_symlinks: false,
            sync_interval: Duration::from_secs(300),
            max_retries: 0,
            retry_delay: Duration::ZERO,
            backup_retention: 3,
        },
        state: Arc::new(InMemoryStateStore::new()),
    };
    let orch = Orchestrator::new(remote.clone(), SyncSettings::default());

    let first = orch
        .sync_mapping(&binding, &CancellationToken::new(), SyncOptions::default())
        .await;
    assert_eq!(first.outcome("a.md"), Some(Outcome::Synced));
    assert_eq!(first.outcome("b.md"), Some(Outcome::Synced));

    let second = orch
        .sync_mapping(&binding, &CancellationToken::new(), SyncOptions::default())
        .await;
    for id in ["a.md", "b.md"] {
        assert_eq!(second.entry(id).unwrap().detail, UNCHANGED, "{}", id);
    }
    assert_eq!(
        fs::read_to_string(tmp.path().join("a.md")).unwrap(),
        "# Title  \n\n* item\n"
    );
}
