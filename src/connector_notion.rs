//! Notion remote adapter.
//!
//! Maps the [`RemoteAdapter`] contract onto the Notion REST API:
//!
//! - a **target** is a database (documents are its rows) or a page
//!   (documents are its `child_page` blocks); which one is discovered on
//!   first use and cached;
//! - a document's **name** is its page title, holding the document id;
//! - **content** is the page's block list rendered to markdown (see
//!   [`crate::blocks`]);
//! - the **version token** is `last_edited_time`;
//! - **delete** archives the page.
//!
//! `last_edited_time` only has minute precision, so an unchanged token does
//! not prove unchanged content and the adapter reports
//! `stable_versions = false`; the detector fetches content every cycle. The
//! same truncation is reported as `timestamp_resolution`, which newest-wins
//! resolution adds to its margin before letting a local edit beat a remote
//! one.
//!
//! Requests carry the `Notion-Version` header and a bearer token read from
//! the environment variable named by `remote.notion.token_env`. HTTP 429
//! honors `Retry-After`; block writes are batched 100 at a time.
//!
//! One operation can take many HTTP requests (pagination, block batches,
//! per-block deletes), so the rate limit and the timeout apply to every
//! request rather than to the operation. An update appends the new blocks
//! before deleting the old ones: if it stops halfway the page still holds
//! all of its previous content.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::blocks::{self, Block};
use crate::config::RemoteConfig;
use crate::models::{RemoteContent, RemoteMeta};
use crate::remote::{Capabilities, RateLimiter, RemoteAdapter, RemoteError};

/// Maximum blocks per append request.
const BLOCK_BATCH: usize = 100;
const PAGE_SIZE: u32 = 100;
/// `last_edited_time` is truncated to the minute.
const TIME_RESOLUTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParentKind {
    /// Database with the name of its title property.
    Database { title_property: String },
    Page,
}

pub struct NotionRemote {
    client: reqwest::Client,
    base_url: String,
    token: String,
    api_version: String,
    limiter: Option<RateLimiter>,
    parents: Mutex<HashMap<String, ParentKind>>,
}

impl NotionRemote {
    pub fn new(base_url: &str, token: &str, api_version: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            api_version: api_version.to_string(),
            limiter: None,
            parents: Mutex::new(HashMap::new()),
        })
    }

    /// Share a token bucket across every HTTP request this adapter sends.
    pub fn with_rate_limit(mut self, requests_per_second: f64, burst: u32) -> Self {
        self.limiter = Some(RateLimiter::new(requests_per_second, burst));
        self
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let env = &config.notion.token_env;
        let token = match std::env::var(env) {
            Ok(token) if !token.trim().is_empty() => token,
            _ => bail!("{} not set; export the Notion integration token", env),
        };
        Ok(Self::new(
            &config.notion.base_url,
            &token,
            &config.notion.api_version,
            Duration::from_secs(config.timeout_secs),
        )?
        .with_rate_limit(config.requests_per_second, config.burst))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.api_version);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| RemoteError::InvalidResponse(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();
        Err(status_error(status, retry_after, path, message))
    }

    async fn get(&self, path: &str) -> Result<Value, RemoteError> {
        self.request(Method::GET, path, None).await
    }

    /// Every child block of `block_id`, following pagination.
    async fn children(&self, block_id: &str) -> Result<Vec<Value>, RemoteError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut path = format!("/blocks/{}/children?page_size={}", block_id, PAGE_SIZE);
            if let Some(c) = &cursor {
                path.push_str(&format!("&start_cursor={}", c));
            }
            let page = self.get(&path).await?;
            out.extend(results(&page)?);
            match next_cursor(&page) {
                Some(next) => cursor = Some(next),
                None => return Ok(out),
            }
        }
    }

    async fn append(&self, block_id: &str, children: &[Value]) -> Result<(), RemoteError> {
        for batch in children.chunks(BLOCK_BATCH) {
            let body = json!({ "children": batch });
            self.request(
                Method::PATCH,
                &format!("/blocks/{}/children", block_id),
                Some(&body),
            )
            .await?;
        }
        Ok(())
    }

    async fn parent_kind(&self, parent: &str) -> Result<ParentKind, RemoteError> {
        if let Some(kind) = self.parents.lock().unwrap().get(parent) {
            return Ok(kind.clone());
        }

        let kind = match self.get(&format!("/databases/{}", parent)).await {
            Ok(db) => ParentKind::Database {
                title_property: title_property(&db).unwrap_or_else(|| "Name".to_string()),
            },
            Err(RemoteError::NotFound(_)) | Err(RemoteError::Rejected { .. }) => ParentKind::Page,
            Err(e) => return Err(e),
        };
        self.parents
            .lock()
            .unwrap()
            .insert(parent.to_string(), kind.clone());
        Ok(kind)
    }

    /// Page metadata, or `None` if the page is missing or archived.
    async fn page_meta(&self, id: &str) -> Result<Option<RemoteMeta>, RemoteError> {
        match self.get(&format!("/pages/{}", id)).await {
            Ok(page) => {
                if page.get("archived").and_then(|a| a.as_bool()) == Some(true) {
                    return Ok(None);
                }
                Ok(Some(page_to_meta(&page)?))
            }
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The page's content blocks, with table rows filled in. Sub-pages are
    /// documents of their own and are left out.
    async fn page_blocks(&self, id: &str) -> Result<Vec<Block>, RemoteError> {
        let mut blocks = Vec::new();
        for raw in self.children(id).await? {
            if raw.get("type").and_then(|t| t.as_str()) == Some("child_page") {
                continue;
            }
            match blocks::from_notion(&raw) {
                Some(Block::Table { .. }) => {
                    let block_id = raw.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                    let rows = self.children(block_id).await?;
                    blocks.push(blocks::table_from_rows(&rows));
                }
                Some(block) => blocks.push(block),
                None => {}
            }
        }
        Ok(blocks)
    }

    async fn current_meta(&self, id: &str) -> Result<RemoteMeta, RemoteError> {
        self.page_meta(id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
}

fn status_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    path: &str,
    message: String,
) -> RemoteError {
    match status.as_u16() {
        429 => RemoteError::RateLimited { retry_after },
        401 | 403 => RemoteError::Unauthorized(message),
        404 => RemoteError::NotFound(path.to_string()),
        // Notion reports transaction collisions as 409; they succeed on retry.
        409 => RemoteError::Server {
            status: 409,
            message,
        },
        s if status.is_server_error() => RemoteError::Server { status: s, message },
        s => RemoteError::Rejected { status: s, message },
    }
}

fn results(page: &Value) -> Result<Vec<Value>, RemoteError> {
    page.get("results")
        .and_then(|r| r.as_array())
        .cloned()
        .ok_or_else(|| RemoteError::InvalidResponse("missing results array".to_string()))
}

fn next_cursor(page: &Value) -> Option<String> {
    if page.get("has_more").and_then(|h| h.as_bool()) != Some(true) {
        return None;
    }
    page.get("next_cursor")
        .and_then(|c| c.as_str())
        .map(|c| c.to_string())
}

fn title_property(database: &Value) -> Option<String> {
    database
        .get("properties")?
        .as_object()?
        .iter()
        .find(|(_, p)| p.get("type").and_then(|t| t.as_str()) == Some("title"))
        .map(|(name, _)| name.clone())
}

fn page_title(page: &Value) -> Option<String> {
    let props = page.get("properties")?.as_object()?;
    let title = props
        .values()
        .find(|p| p.get("type").and_then(|t| t.as_str()) == Some("title"))?;
    Some(blocks::plain_text(title.get("title")?))
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn page_to_meta(page: &Value) -> Result<RemoteMeta, RemoteError> {
    let id = page
        .get("id")
        .and_then(|i| i.as_str())
        .ok_or_else(|| RemoteError::InvalidResponse("page without id".to_string()))?;
    let version = page
        .get("last_edited_time")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string());
    Ok(RemoteMeta {
        id: id.to_string(),
        name: page_title(page).unwrap_or_default(),
        modified: parse_time(page.get("last_edited_time")),
        version,
        size: None,
    })
}

fn child_page_to_meta(block: &Value) -> Option<RemoteMeta> {
    let id = block.get("id")?.as_str()?;
    let title = block.get("child_page")?.get("title")?.as_str()?;
    Some(RemoteMeta {
        id: id.to_string(),
        name: title.to_string(),
        version: block
            .get("last_edited_time")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string()),
        modified: parse_time(block.get("last_edited_time")),
        size: None,
    })
}

fn notion_blocks(content: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(content);
    blocks::parse_markdown(&text)
        .iter()
        .map(blocks::to_notion)
        .collect()
}

#[async_trait]
impl RemoteAdapter for NotionRemote {
    fn name(&self) -> &str {
        "notion"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            verbatim_content: false,
            stable_versions: false,
            trustworthy_timestamps: true,
            timestamp_resolution: TIME_RESOLUTION,
        }
    }

    /// Notion ids are 32 hex digits, optionally dash-separated.
    fn validate_target(&self, target: &str) -> std::result::Result<(), String> {
        let hex: String = target.chars().filter(|c| *c != '-').collect();
        if hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err("expected a 32-character Notion page or database id".to_string())
        }
    }

    async fn fetch(&self, id: &str) -> Result<Option<RemoteContent>, RemoteError> {
        let Some(mut meta) = self.page_meta(id).await? else {
            return Ok(None);
        };
        let blocks = self.page_blocks(id).await?;
        let content = blocks::render_markdown(&blocks).into_bytes();
        meta.size = Some(content.len() as u64);
        Ok(Some(RemoteContent { meta, content }))
    }

    async fn create(
        &self,
        parent: &str,
        name: &str,
        content: &[u8],
    ) -> Result<RemoteMeta, RemoteError> {
        let children = notion_blocks(content);
        let (first, rest) = children.split_at(children.len().min(BLOCK_BATCH));

        let (parent_json, title_property) = match self.parent_kind(parent).await? {
            ParentKind::Database { title_property } => {
                (json!({ "database_id": parent }), title_property)
            }
            ParentKind::Page => (json!({ "page_id": parent }), "title".to_string()),
        };
        let mut properties = serde_json::Map::new();
        properties.insert(title_property, json!({ "title": blocks::rich_text(name) }));

        let body = json!({
            "parent": parent_json,
            "properties": properties,
            "children": first,
        });
        let page = self.request(Method::POST, "/pages", Some(&body)).await?;
        let meta = page_to_meta(&page)?;

        if !rest.is_empty() {
            self.append(&meta.id, rest).await?;
            return self.current_meta(&meta.id).await;
        }
        Ok(meta)
    }

    async fn update(
        &self,
        id: &str,
        content: &[u8],
        expected_version: Option<&str>,
    ) -> Result<RemoteMeta, RemoteError> {
        let meta = self.current_meta(id).await?;
        if let Some(expected) = expected_version {
            if meta.version.as_deref() != Some(expected) {
                return Err(RemoteError::VersionConflict {
                    id: id.to_string(),
                    expected: Some(expected.to_string()),
                    actual: meta.version,
                });
            }
        }

        let stale: Vec<String> = self
            .children(id)
            .await?
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) != Some("child_page"))
            .filter_map(|b| b.get("id").and_then(|i| i.as_str()).map(str::to_string))
            .collect();

        self.append(id, &notion_blocks(content)).await?;
        for block_id in &stale {
            match self
                .request(Method::DELETE, &format!("/blocks/{}", block_id), None)
                .await
            {
                Ok(_) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.current_meta(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let body = json!({ "archived": true });
        self.request(Method::PATCH, &format!("/pages/{}", id), Some(&body))
            .await?;
        Ok(())
    }

    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteMeta>, RemoteError> {
        let mut out = Vec::new();
        match self.parent_kind(parent).await? {
            ParentKind::Database { .. } => {
                let mut cursor: Option<String> = None;
                loop {
                    let mut body = json!({ "page_size": PAGE_SIZE });
                    if let Some(c) = &cursor {
                        body["start_cursor"] = json!(c);
                    }
                    let page = self
                        .request(
                            Method::POST,
                            &format!("/databases/{}/query", parent),
                            Some(&body),
                        )
                        .await?;
                    for row in results(&page)? {
                        if row.get("archived").and_then(|a| a.as_bool()) == Some(true) {
                            continue;
                        }
                        out.push(page_to_meta(&row)?);
                    }
                    match next_cursor(&page) {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
            }
            ParentKind::Page => {
                for block in self.children(parent).await? {
                    if block.get("type").and_then(|t| t.as_str()) != Some("child_page") {
                        continue;
                    }
                    if let Some(meta) = child_page_to_meta(&block) {
                        out.push(meta);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> NotionRemote {
        NotionRemote::new("http://localhost:1", "secret", "2022-06-28", Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn validates_notion_ids() {
        let r = remote();
        assert!(r.validate_target("0123456789abcdef0123456789ABCDEF").is_ok());
        assert!(r
            .validate_target("01234567-89ab-cdef-0123-456789abcdef")
            .is_ok());
        assert!(r.validate_target("db_123").is_err());
        assert!(r.validate_target("").is_err());
    }

    #[test]
    fn minute_timestamps_loosen_newest_wins() {
        let caps = remote().capabilities();
        assert_eq!(caps.timestamp_resolution, Duration::from_secs(60));

        let resolver = crate::resolve::for_policy(crate::config::ConflictPolicy::Newest, caps, 5);
        let at = |secs: i64| crate::models::Fingerprint {
            digest: String::new(),
            size: 0,
            modified: DateTime::from_timestamp(1_700_000_000 + secs, 0),
            version: None,
        };
        // Remote edited later in the same minute it reports; local must not win.
        assert_eq!(
            resolver.resolve(&at(40), &at(0)),
            crate::resolve::Resolution::Defer
        );
    }

    #[test]
    fn maps_http_status_to_error_classes() {
        let e = status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), "/p", String::new());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(3)));
        assert!(e.is_retryable());
        assert!(status_error(StatusCode::BAD_GATEWAY, None, "/p", String::new()).is_retryable());
        assert!(!status_error(StatusCode::UNAUTHORIZED, None, "/p", String::new()).is_retryable());
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, None, "/p", String::new()),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, None, "/p", String::new()),
            RemoteError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn reads_page_metadata() {
        let page = json!({
            "id": "page-1",
            "last_edited_time": "2024-03-01T10:15:00.000Z",
            "properties": {
                "Name": { "type": "title", "title": [{ "plain_text": "guides/setup.md" }] },
                "Tags": { "type": "multi_select", "multi_select": [] }
            }
        });
        let meta = page_to_meta(&page).unwrap();
        assert_eq!(meta.name, "guides/setup.md");
        assert_eq!(meta.version.as_deref(), Some("2024-03-01T10:15:00.000Z"));
        assert!(meta.modified.is_some());
    }

    #[test]
    fn finds_database_title_property() {
        let db = json!({
            "properties": {
                "Status": { "type": "select" },
                "Document": { "type": "title" }
            }
        });
        assert_eq!(title_property(&db).as_deref(), Some("Document"));
    }
}
