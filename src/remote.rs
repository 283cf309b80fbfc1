use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::PathPolicy;
use crate::scanner::Node;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DATA_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// `unreachable` retry schedule: 3 attempts, 200 ms doubling toward 1 s,
/// plus jitter.
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BASE_MS: u64 = 200;
const RETRY_CAP_MS: u64 = 1000;

/// Everything the sandbox call surface can fail with, already classified for
/// the API boundary.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote timed out: {0}")]
    Timeout(String),
    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("remote conflict: {0}")]
    Conflict(String),
    #[error("remote error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("sync policy forbids uploading {0}")]
    PolicyRejected(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Deserialize)]
pub struct RemoteScript {
    pub path: String,
    modified: f64,
}

impl RemoteScript {
    /// Floored to integer seconds; float modtimes drift across platforms and
    /// break equality checks.
    pub fn modified_unix(&self) -> i64 {
        self.modified.floor() as i64
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoteFile {
    pub content: String,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteMetadata {
    #[serde(default)]
    pub input_metadata: String,
    #[serde(default)]
    pub output_metadata: String,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Node,
}

#[derive(Debug, Deserialize)]
struct ScriptsResponse {
    scripts: Vec<RemoteScript>,
}

#[derive(Debug, Serialize)]
struct PutFileBody<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct PutMetadataBody<'a> {
    input_metadata: &'a str,
    output_metadata: &'a str,
}

/// Typed client for one remote sandbox. The base URL is the sandbox's
/// forwarded port (`https://…:8787` by convention).
#[derive(Clone)]
pub struct SandboxClient {
    base: String,
    http: HttpClient,
    policy: Arc<PathPolicy>,
}

impl SandboxClient {
    pub fn new(base_url: &str, policy: Arc<PathPolicy>) -> RemoteResult<Self> {
        let http = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DATA_TIMEOUT)
            .user_agent(concat!("vibefoundry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
            policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn health(&self) -> RemoteResult<bool> {
        let url = format!("{}/health", self.base);
        let resp = self
            .send(|| self.http.get(url.clone()).timeout(HEALTH_TIMEOUT))
            .await?;
        let body: HealthResponse = decode(resp, "health").await?;
        Ok(body.status == "ok")
    }

    pub async fn list_all(&self) -> RemoteResult<Node> {
        let url = format!("{}/files", self.base);
        let resp = self.send(|| self.http.get(url.clone())).await?;
        let body: TreeResponse = decode(resp, "list files").await?;
        Ok(body.tree)
    }

    pub async fn list_scripts(&self) -> RemoteResult<Vec<RemoteScript>> {
        let url = format!("{}/scripts", self.base);
        let resp = self.send(|| self.http.get(url.clone())).await?;
        let body: ScriptsResponse = decode(resp, "list scripts").await?;
        Ok(body.scripts)
    }

    pub async fn get_file(&self, path: &str) -> RemoteResult<RemoteFile> {
        let url = format!("{}/files/{}", self.base, encode_path(path));
        let resp = self.send(|| self.http.get(url.clone())).await?;
        decode(resp, "get file").await
    }

    pub async fn get_script(&self, path: &str) -> RemoteResult<RemoteFile> {
        let url = format!("{}/scripts/{}", self.base, encode_path(path));
        let resp = self.send(|| self.http.get(url.clone())).await?;
        decode(resp, "get script").await
    }

    /// Upload one file. Forbidden-for-sync paths are refused here, before any
    /// bytes leave the machine, no matter what the caller already checked.
    pub async fn put_file(&self, path: &str, content: &str) -> RemoteResult<()> {
        if self.policy.is_forbidden_for_sync(Path::new(path)) {
            return Err(RemoteError::PolicyRejected(path.to_string()));
        }
        let url = format!("{}/scripts/{}", self.base, encode_path(path));
        let body = serde_json::to_vec(&PutFileBody { content })
            .map_err(|e| RemoteError::Server { status: 0, body: e.to_string() })?;
        let resp = self
            .send(|| {
                self.http
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        expect_ok(resp, "put file").await
    }

    pub async fn get_metadata(&self) -> RemoteResult<RemoteMetadata> {
        let url = format!("{}/metadata", self.base);
        let resp = self.send(|| self.http.get(url.clone())).await?;
        decode(resp, "get metadata").await
    }

    pub async fn put_metadata(&self, input_text: &str, output_text: &str) -> RemoteResult<()> {
        let url = format!("{}/metadata", self.base);
        let body = serde_json::to_vec(&PutMetadataBody {
            input_metadata: input_text,
            output_metadata: output_text,
        })
        .map_err(|e| RemoteError::Server { status: 0, body: e.to_string() })?;
        let resp = self
            .send(|| {
                self.http
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        expect_ok(resp, "put metadata").await
    }

    /// Send with bounded retry: only transport-level `unreachable` failures
    /// are retried; everything else surfaces immediately.
    async fn send<F>(&self, build: F) -> RemoteResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay = Duration::from_millis(RETRY_BASE_MS);
        let mut last_err = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_timeout() => {
                    return Err(RemoteError::Timeout(err.to_string()));
                }
                Err(err) if err.is_connect() || err.is_request() => {
                    last_err = Some(RemoteError::Unreachable(err.to_string()));
                    if attempt < RETRY_ATTEMPTS {
                        tokio::time::sleep(jittered(delay)).await;
                        delay = (delay * 2).min(Duration::from_millis(RETRY_CAP_MS));
                    }
                }
                Err(err) => return Err(RemoteError::Unreachable(err.to_string())),
            }
        }
        Err(last_err.unwrap_or_else(|| RemoteError::Unreachable("request failed".into())))
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter = rand::rng().random_range(0..=100u64);
    base + Duration::from_millis(jitter)
}

/// URL-encode a relative path as a single segment (slashes included).
fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}

async fn classify_status(resp: Response, op: &str) -> RemoteError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Unauthorized(format!("{op}: {body}"))
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(format!("{op}: {body}")),
        StatusCode::CONFLICT => RemoteError::Conflict(format!("{op}: {body}")),
        _ => RemoteError::Server {
            status: status.as_u16(),
            body: format!("{op}: {body}"),
        },
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> RemoteResult<T> {
    if !resp.status().is_success() {
        return Err(classify_status(resp, op).await);
    }
    resp.json::<T>().await.map_err(|e| RemoteError::Server {
        status: 0,
        body: format!("{op}: invalid response body: {e}"),
    })
}

async fn expect_ok(resp: Response, op: &str) -> RemoteResult<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(classify_status(resp, op).await)
}
