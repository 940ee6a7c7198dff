//! Gerrit REST API client.
//!
//! Talks to the authenticated `/a/` endpoints with HTTP basic auth. Every
//! JSON response carries the `)]}'` XSSI prefix, which is stripped before
//! parsing.

use super::remote::{
    CommentInput, RemoteChange, RemoteChangeSummary, RemoteClient, RemoteComment, RemoteConnector,
    RemoteFile, RemotePatchSet, ReviewInput, ReviewResult,
};
use crate::error::AppError;
use crate::models::{
    ChangeStatus, CommentRange, CommentSide, Credentials, FileChangeType, FileEdit, Instance, PatchSetKind,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDateTime;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Prefix Gerrit puts in front of every JSON body.
const XSSI_PREFIX: &str = ")]}'";

/// Query options for a full change fetch.
const CHANGE_OPTIONS: &[&str] = &["ALL_REVISIONS", "ALL_FILES", "DETAILED_LABELS", "DETAILED_ACCOUNTS"];

/// Gerrit client configuration.
#[derive(Debug, Clone)]
pub struct GerritClientConfig {
    /// Base URL of the Gerrit server (e.g., `https://review.example.org`).
    pub base_url: String,

    pub username: String,

    /// HTTP password for basic auth.
    pub http_password: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

/// Gerrit API client.
#[derive(Debug)]
pub struct GerritClient {
    client: Client,
    config: GerritClientConfig,
    /// Account id of the authenticated user, fetched once.
    self_account: OnceCell<i64>,
}

/// Account as returned with `DETAILED_ACCOUNTS`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GerritAccount {
    #[serde(rename = "_account_id")]
    pub account_id: Option<i64>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
}

impl GerritAccount {
    fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.email.clone())
            .or_else(|| self.account_id.map(|id| id.to_string()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GerritFileInfo {
    pub status: Option<String>,
    pub old_path: Option<String>,
    #[serde(default)]
    pub lines_inserted: i64,
    #[serde(default)]
    pub lines_deleted: i64,
    #[serde(default)]
    pub size_delta: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GerritRevision {
    pub kind: Option<String>,
    #[serde(rename = "_number")]
    pub number: i64,
    pub created: String,
    pub uploader: Option<GerritAccount>,
    #[serde(default)]
    pub files: HashMap<String, GerritFileInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GerritApproval {
    #[serde(rename = "_account_id")]
    pub account_id: Option<i64>,
    pub value: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GerritLabel {
    #[serde(default)]
    pub all: Vec<GerritApproval>,
}

/// `ChangeInfo` entity.
#[derive(Debug, Clone, Deserialize)]
pub struct GerritChange {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub topic: Option<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    pub change_id: String,
    pub subject: String,
    pub status: String,
    pub owner: GerritAccount,
    pub updated: String,
    #[serde(rename = "_number")]
    pub number: i64,
    pub current_revision: Option<String>,
    #[serde(default)]
    pub revisions: HashMap<String, GerritRevision>,
    #[serde(default)]
    pub labels: HashMap<String, GerritLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GerritRange {
    pub start_line: i64,
    pub start_character: i64,
    pub end_line: i64,
    pub end_character: i64,
}

/// `CommentInfo` entity.
#[derive(Debug, Clone, Deserialize)]
pub struct GerritComment {
    pub id: String,
    pub path: Option<String>,
    pub patch_set: Option<i64>,
    pub side: Option<String>,
    pub line: Option<i64>,
    pub range: Option<GerritRange>,
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub message: String,
    pub updated: String,
    pub author: Option<GerritAccount>,
    pub unresolved: Option<bool>,
}

/// `CommentInput` entity.
#[derive(Debug, Clone, Serialize)]
struct GerritCommentInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    side: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<GerritRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<&'a str>,
    message: &'a str,
    unresolved: bool,
}

#[derive(Debug, Clone, Serialize)]
struct GerritReviewInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drafts: Option<&'static str>,
    omit_duplicate_comments: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GerritReviewResult {
    #[serde(default)]
    labels: BTreeMap<String, i32>,
}

/// One chunk of a `DiffInfo` body.
#[derive(Debug, Clone, Default, Deserialize)]
struct GerritDiffChunk {
    #[serde(default)]
    ab: Vec<String>,
    #[serde(default)]
    a: Vec<String>,
    #[serde(default)]
    b: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GerritDiff {
    #[serde(default)]
    content: Vec<GerritDiffChunk>,
}

/// Parse Gerrit's `yyyy-mm-dd hh:mm:ss.fffffffff` UTC timestamps.
pub fn parse_timestamp(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Strip the XSSI prefix from a response body.
pub fn strip_xssi_prefix(body: &str) -> &str {
    body.strip_prefix(XSSI_PREFIX)
        .map(str::trim_start)
        .unwrap_or(body)
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

fn side_param(side: CommentSide) -> Option<&'static str> {
    match side {
        CommentSide::Parent => Some("PARENT"),
        CommentSide::Revision => None,
    }
}

fn to_range(range: &CommentRange) -> GerritRange {
    GerritRange {
        start_line: range.start_line,
        start_character: range.start_character,
        end_line: range.end_line,
        end_character: range.end_character,
    }
}

impl GerritComment {
    fn into_remote(self, path: &str) -> RemoteComment {
        RemoteComment {
            updated: parse_timestamp(&self.updated).unwrap_or_default(),
            side: self.side.as_deref().map(CommentSide::from).unwrap_or(CommentSide::Revision),
            path: self.path.unwrap_or_else(|| path.to_string()),
            patch_set: self.patch_set.unwrap_or_default(),
            range: self.range.map(|r| CommentRange {
                start_line: r.start_line,
                start_character: r.start_character,
                end_line: r.end_line,
                end_character: r.end_character,
            }),
            line: self.line,
            author: self.author.map(|a| a.display_name()).unwrap_or_default(),
            unresolved: self.unresolved.unwrap_or(false),
            in_reply_to: self.in_reply_to,
            message: self.message,
            id: self.id,
        }
    }
}

impl GerritChange {
    fn into_remote(self, self_account: Option<i64>) -> RemoteChange {
        let mut patch_sets: Vec<RemotePatchSet> = self
            .revisions
            .into_iter()
            .map(|(sha, rev)| {
                let mut files: Vec<RemoteFile> = rev
                    .files
                    .into_iter()
                    .map(|(path, info)| RemoteFile {
                        change_type: info.status.as_deref().map(FileChangeType::from).unwrap_or(FileChangeType::Modified),
                        old_path: info.old_path,
                        lines_inserted: info.lines_inserted,
                        lines_deleted: info.lines_deleted,
                        size_delta: info.size_delta,
                        path,
                    })
                    .collect();
                files.sort_by(|a, b| a.path.cmp(&b.path));
                RemotePatchSet {
                    number: rev.number,
                    revision: sha,
                    author: rev.uploader.map(|a| a.display_name()).unwrap_or_default(),
                    kind: rev.kind.as_deref().map(PatchSetKind::from).unwrap_or(PatchSetKind::Rework),
                    created: parse_timestamp(&rev.created).unwrap_or_default(),
                    files,
                }
            })
            .collect();
        patch_sets.sort_by_key(|ps| ps.number);

        let votes = match self_account {
            Some(me) => self
                .labels
                .iter()
                .filter_map(|(name, label)| {
                    label
                        .all
                        .iter()
                        .find(|a| a.account_id == Some(me))
                        .and_then(|a| a.value)
                        .filter(|v| *v != 0)
                        .map(|v| (name.clone(), v))
                })
                .collect(),
            None => BTreeMap::new(),
        };

        RemoteChange {
            change_id: self.id,
            number: self.number,
            project: self.project,
            branch: self.branch,
            subject: self.subject,
            status: ChangeStatus::from(self.status.as_str()),
            owner: self.owner.display_name(),
            current_revision: self.current_revision.unwrap_or_default(),
            updated: parse_timestamp(&self.updated).unwrap_or_default(),
            topic: self.topic,
            hashtags: self.hashtags,
            patch_sets,
            votes,
        }
    }
}

/// Render a `DiffInfo` as unified-style lines.
fn render_diff(diff: &GerritDiff) -> String {
    let mut out = String::new();
    for chunk in &diff.content {
        for line in &chunk.ab {
            out.push(' ');
            out.push_str(line);
            out.push('\n');
        }
        for line in &chunk.a {
            out.push('-');
            out.push_str(line);
            out.push('\n');
        }
        for line in &chunk.b {
            out.push('+');
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

impl GerritClient {
    /// Create a new Gerrit client.
    pub fn new(config: GerritClientConfig) -> Result<Self, AppError> {
        let mut headers = header::HeaderMap::new();

        let basic = STANDARD.encode(format!("{}:{}", config.username, config.http_password));
        let mut auth_value = header::HeaderValue::from_str(&format!("Basic {}", basic))
            .map_err(|_| AppError::authentication("Invalid credential format"))?;
        auth_value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth_value);
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            self_account: OnceCell::new(),
        })
    }

    /// Authenticated endpoint URL.
    fn api_url(&self, path: &str) -> String {
        format!("{}/a{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn change_path(change: &str) -> String {
        format!("/changes/{}", encode(change))
    }

    fn revision_path(change: &str, revision: &str) -> String {
        format!("{}/revisions/{}", Self::change_path(change), encode(revision))
    }

    /// Map an error status to an `AppError`.
    async fn error_for(response: Response, endpoint: &str) -> AppError {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return AppError::authentication("Gerrit rejected the credentials. Please re-authenticate.");
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let body = strip_xssi_prefix(&body).trim();
        let message = match status {
            StatusCode::FORBIDDEN => "Access denied".to_string(),
            StatusCode::NOT_FOUND => "Resource not found".to_string(),
            StatusCode::TOO_MANY_REQUESTS => "Rate limit exceeded".to_string(),
            _ if !body.is_empty() => body.to_string(),
            _ => format!("Request failed ({})", status_code),
        };
        AppError::remote_api_full(message, status_code, endpoint)
    }

    /// Send a request and parse the JSON body.
    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, endpoint: &str) -> Result<T, AppError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, endpoint).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::internal(format!("Failed to read response: {}", e)))?;
        serde_json::from_str(strip_xssi_prefix(&body))
            .map_err(|e| AppError::internal(format!("Failed to parse response from {}: {}", endpoint, e)))
    }

    /// Send a request whose response body is irrelevant.
    async fn send_empty(&self, request: RequestBuilder, endpoint: &str) -> Result<(), AppError> {
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(response, endpoint).await)
        }
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, AppError> {
        self.send_json(self.client.get(self.api_url(endpoint)), endpoint).await
    }

    /// Account id of the authenticated user.
    pub async fn self_account_id(&self) -> Result<i64, AppError> {
        self.self_account
            .get_or_try_init(|| async {
                let account: GerritAccount = self.get("/accounts/self").await?;
                account
                    .account_id
                    .ok_or_else(|| AppError::remote_api("Account response lacks _account_id"))
            })
            .await
            .copied()
    }

    /// Publish every draft on a revision, optionally with votes and a message.
    async fn publish(&self, change: &str, revision: &str, review: &ReviewInput) -> Result<GerritReviewResult, AppError> {
        let endpoint = format!("{}/review", Self::revision_path(change, revision));
        let body = GerritReviewInput {
            message: review.message.as_deref(),
            labels: review.labels.clone(),
            drafts: Some("PUBLISH"),
            omit_duplicate_comments: true,
        };
        self.send_json(self.client.post(self.api_url(&endpoint)).json(&body), &endpoint)
            .await
    }

    /// Create or update a draft and publish it, returning the published comment.
    async fn save_and_publish(
        &self,
        change: &str,
        revision: &str,
        remote_id: Option<&str>,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError> {
        let drafts = format!("{}/drafts", Self::revision_path(change, revision));
        let input = GerritCommentInput {
            id: remote_id,
            path: &comment.path,
            side: side_param(comment.side),
            line: comment.line,
            range: comment.range.as_ref().map(to_range),
            in_reply_to: comment.in_reply_to.as_deref(),
            message: &comment.message,
            unresolved: comment.unresolved,
        };

        let endpoint = match remote_id {
            Some(id) => format!("{}/{}", drafts, encode(id)),
            None => drafts,
        };
        let request = self.client.put(self.api_url(&endpoint)).json(&input);
        let draft: GerritComment = self.send_json(request, &endpoint).await?;

        self.publish(change, revision, &ReviewInput::default()).await?;
        log::debug!("Published comment {} on {}", draft.id, change);

        Ok(draft.into_remote(&comment.path))
    }
}

#[async_trait]
impl RemoteClient for GerritClient {
    async fn server_version(&self) -> Result<String, AppError> {
        self.get("/config/server/version").await
    }

    async fn fetch_change(&self, change: &str) -> Result<RemoteChange, AppError> {
        let endpoint = Self::change_path(change);
        let options: Vec<(&str, &str)> = CHANGE_OPTIONS.iter().map(|o| ("o", *o)).collect();
        let request = self.client.get(self.api_url(&endpoint)).query(&options);

        let info: GerritChange = match self.send_json(request, &endpoint).await {
            Err(AppError::RemoteApi {
                status_code: Some(404), ..
            }) => return Err(AppError::change_not_found(change)),
            other => other?,
        };

        let me = self.self_account_id().await?;
        Ok(info.into_remote(Some(me)))
    }

    async fn fetch_file_diff(&self, change: &str, revision: &str, path: &str) -> Result<String, AppError> {
        let endpoint = format!("{}/files/{}/diff", Self::revision_path(change, revision), encode(path));
        let diff: GerritDiff = self.get(&endpoint).await?;
        Ok(render_diff(&diff))
    }

    async fn fetch_comments(&self, change: &str) -> Result<Vec<RemoteComment>, AppError> {
        let endpoint = format!("{}/comments", Self::change_path(change));
        let by_path: BTreeMap<String, Vec<GerritComment>> = self.get(&endpoint).await?;

        let mut comments: Vec<RemoteComment> = by_path
            .into_iter()
            .flat_map(|(path, list)| {
                list.into_iter()
                    .map(|c| c.into_remote(&path))
                    .collect::<Vec<_>>()
            })
            .collect();
        comments.sort_by(|a, b| (a.updated, &a.id).cmp(&(b.updated, &b.id)));
        Ok(comments)
    }

    async fn post_comment(
        &self,
        change: &str,
        revision: &str,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError> {
        self.save_and_publish(change, revision, None, comment).await
    }

    async fn update_comment(
        &self,
        change: &str,
        revision: &str,
        remote_id: &str,
        comment: &CommentInput,
    ) -> Result<RemoteComment, AppError> {
        self.save_and_publish(change, revision, Some(remote_id), comment).await
    }

    async fn delete_comment(&self, change: &str, revision: &str, remote_id: &str) -> Result<(), AppError> {
        let endpoint = format!(
            "{}/comments/{}/delete",
            Self::revision_path(change, revision),
            encode(remote_id)
        );
        let body = serde_json::json!({ "reason": "Deleted by author" });
        self.send_empty(self.client.post(self.api_url(&endpoint)).json(&body), &endpoint)
            .await
    }

    async fn post_review(&self, change: &str, revision: &str, review: &ReviewInput) -> Result<ReviewResult, AppError> {
        let result = self.publish(change, revision, review).await?;
        let rejected_labels = review
            .labels
            .keys()
            .filter(|name| !result.labels.contains_key(*name))
            .cloned()
            .collect();
        Ok(ReviewResult {
            applied_labels: result.labels,
            rejected_labels,
        })
    }

    async fn push_patch_set(&self, change: &str, edits: &[FileEdit], message: &str) -> Result<RemotePatchSet, AppError> {
        let base = format!("{}/edit", Self::change_path(change));

        for edit in edits {
            let endpoint = format!("{}/{}", base, encode(&edit.path));
            let request = match &edit.content {
                Some(content) => self
                    .client
                    .put(self.api_url(&endpoint))
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(content.clone()),
                None => self.client.delete(self.api_url(&endpoint)),
            };
            self.send_empty(request, &endpoint).await?;
        }

        let endpoint = format!("{}:message", base);
        let body = serde_json::json!({ "message": message });
        self.send_empty(self.client.put(self.api_url(&endpoint)).json(&body), &endpoint)
            .await?;

        let endpoint = format!("{}:publish", base);
        let body = serde_json::json!({ "notify": "OWNER" });
        self.send_empty(self.client.post(self.api_url(&endpoint)).json(&body), &endpoint)
            .await?;

        let updated = self.fetch_change(change).await?;
        updated
            .current_patch_set()
            .cloned()
            .ok_or_else(|| AppError::remote_api("Published edit produced no patch set"))
    }

    async fn search_changes(&self, query: &str, limit: u32) -> Result<Vec<RemoteChangeSummary>, AppError> {
        let endpoint = "/changes/";
        let request = self
            .client
            .get(self.api_url(endpoint))
            .query(&[("q", query), ("n", &limit.to_string())]);
        let results: Vec<GerritChange> = self.send_json(request, endpoint).await?;

        Ok(results
            .into_iter()
            .map(|c| RemoteChangeSummary {
                status: ChangeStatus::from(c.status.as_str()),
                owner: c.owner.display_name(),
                updated: parse_timestamp(&c.updated).unwrap_or_default(),
                change_id: c.id,
                number: c.number,
                project: c.project,
                branch: c.branch,
                subject: c.subject,
            })
            .collect())
    }
}

/// Builds [`GerritClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct GerritConnector;

impl RemoteConnector for GerritConnector {
    fn connect(
        &self,
        instance: &Instance,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteClient>, AppError> {
        let client = GerritClient::new(GerritClientConfig {
            base_url: instance.url.clone(),
            username: credentials.username,
            http_password: credentials.http_password,
            timeout_secs: timeout.as_secs().max(1),
        })?;
        Ok(Arc::new(client))
    }
}
