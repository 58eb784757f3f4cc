//! Host services reachable from inside a context
//!
//! Everything an extension can touch outside its own interpreter goes
//! through one of these: per-extension key/value storage and the outbound
//! HTTP gateway. Both are shared by every context of the service.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Per-extension ceilings of [`ExtensionStorage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLimits {
    /// Key plus value bytes held for one extension
    pub max_bytes: usize,
    pub max_keys: usize,
    pub max_value_bytes: usize,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_keys: 1000,
            max_value_bytes: 1024 * 1024,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage value of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("storage key limit of {limit} reached")]
    TooManyKeys { limit: usize },

    #[error("storage quota exceeded: {requested} bytes requested, {limit} byte limit")]
    QuotaExceeded { requested: usize, limit: usize },
}

#[derive(Debug, Default)]
struct Bucket {
    entries: BTreeMap<String, String>,
    bytes: usize,
}

/// In-memory storage scoped per extension and shared by all its contexts
#[derive(Debug, Default)]
pub struct ExtensionStorage {
    buckets: DashMap<String, Bucket>,
    limits: StorageLimits,
}

impl ExtensionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: StorageLimits) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> StorageLimits {
        self.limits
    }

    /// Stored JSON text for `key`
    pub fn get(&self, extension_id: &str, key: &str) -> Option<String> {
        self.buckets
            .get(extension_id)
            .and_then(|bucket| bucket.entries.get(key).cloned())
    }

    /// Store `json` under `key`, refusing writes that would take the
    /// extension past its limits. A refused write leaves the bucket as it was.
    pub fn set(&self, extension_id: &str, key: &str, json: String) -> Result<(), StorageError> {
        let limits = self.limits;
        if json.len() > limits.max_value_bytes {
            return Err(StorageError::ValueTooLarge {
                size: json.len(),
                limit: limits.max_value_bytes,
            });
        }

        let mut bucket = self.buckets.entry(extension_id.to_string()).or_default();
        let replaced = bucket.entries.get(key).map(|old| key.len() + old.len());
        if replaced.is_none() && bucket.entries.len() >= limits.max_keys {
            return Err(StorageError::TooManyKeys {
                limit: limits.max_keys,
            });
        }

        let requested = bucket.bytes - replaced.unwrap_or(0) + key.len() + json.len();
        if requested > limits.max_bytes {
            return Err(StorageError::QuotaExceeded {
                requested,
                limit: limits.max_bytes,
            });
        }

        bucket.entries.insert(key.to_string(), json);
        bucket.bytes = requested;
        Ok(())
    }

    pub fn remove(&self, extension_id: &str, key: &str) -> bool {
        self.buckets.get_mut(extension_id).map_or(false, |mut bucket| {
            match bucket.entries.remove(key) {
                Some(old) => {
                    bucket.bytes = bucket.bytes.saturating_sub(key.len() + old.len());
                    true
                }
                None => false,
            }
        })
    }

    pub fn keys(&self, extension_id: &str) -> Vec<String> {
        self.buckets
            .get(extension_id)
            .map(|bucket| bucket.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Bytes currently held for one extension
    pub fn usage(&self, extension_id: &str) -> usize {
        self.buckets
            .get(extension_id)
            .map_or(0, |bucket| bucket.bytes)
    }
}

/// Outbound request issued by `sandbox.http.fetch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response handed back to the extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Response body exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("Request failed: {0}")]
    Transport(String),
}

/// Performs outbound HTTP on behalf of extensions.
///
/// Called from the blocking thread that runs the interpreter, so
/// implementations are synchronous.
pub trait HttpGateway: Send + Sync {
    fn fetch(&self, request: HttpRequest, timeout: Duration) -> Result<HttpResponse, GatewayError>;
}

/// Gateway backed by an async `reqwest` client driven on the service runtime
pub struct ReqwestGateway {
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
    max_response_bytes: usize,
}

impl ReqwestGateway {
    pub fn new(
        handle: tokio::runtime::Handle,
        max_response_bytes: usize,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("extension-sandbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            handle,
            max_response_bytes,
        })
    }

    async fn send(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::InvalidRequest(format!("unsupported method {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(timeout)
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if response
            .content_length()
            .is_some_and(|length| length > self.max_response_bytes as u64)
        {
            return Err(GatewayError::ResponseTooLarge(self.max_response_bytes));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?
        {
            if bytes.len() + chunk.len() > self.max_response_bytes {
                return Err(GatewayError::ResponseTooLarge(self.max_response_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

impl HttpGateway for ReqwestGateway {
    fn fetch(&self, request: HttpRequest, timeout: Duration) -> Result<HttpResponse, GatewayError> {
        self.handle.block_on(self.send(request, timeout))
    }
}

/// Whether `host` is covered by the allow-list; `*.example.com` entries
/// match subdomains only.
pub fn host_allowed<'a, I>(host: &str, allowed: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let host = host.to_ascii_lowercase();
    allowed.into_iter().any(|entry| match entry.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
        None => entry.eq_ignore_ascii_case(&host),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_storage_is_scoped_per_extension() {
        let storage = ExtensionStorage::new();
        storage.set("E1", "count", "1".into()).unwrap();
        storage.set("E2", "count", "2".into()).unwrap();

        assert_eq!(storage.get("E1", "count").as_deref(), Some("1"));
        assert_eq!(storage.get("E2", "count").as_deref(), Some("2"));
        assert_eq!(storage.keys("E1"), vec!["count".to_string()]);

        assert!(storage.remove("E1", "count"));
        assert!(!storage.remove("E1", "count"));
        assert!(storage.get("E1", "count").is_none());
        assert_eq!(storage.get("E2", "count").as_deref(), Some("2"));
    }

    #[test]
    fn test_storage_limits_are_enforced() {
        let storage = ExtensionStorage::with_limits(StorageLimits {
            max_bytes: 64,
            max_keys: 2,
            max_value_bytes: 32,
        });

        assert_eq!(
            storage.set("E1", "big", "x".repeat(33)),
            Err(StorageError::ValueTooLarge { size: 33, limit: 32 })
        );

        storage.set("E1", "a", "x".repeat(30)).unwrap();
        assert_eq!(storage.usage("E1"), 31);
        assert!(matches!(
            storage.set("E1", "bb", "x".repeat(32)),
            Err(StorageError::QuotaExceeded { requested: 65, limit: 64 })
        ));
        storage.set("E1", "b", "x".repeat(20)).unwrap();
        assert_eq!(
            storage.set("E1", "c", "1".into()),
            Err(StorageError::TooManyKeys { limit: 2 })
        );

        // overwriting an existing key is measured against its old size
        storage.set("E1", "a", "x".repeat(32)).unwrap();
        assert_eq!(storage.usage("E1"), 33 + 21);

        assert!(storage.remove("E1", "a"));
        assert_eq!(storage.usage("E1"), 21);
        storage.set("E1", "c", "1".into()).unwrap();

        // another extension has its own budget
        storage.set("E2", "a", "x".repeat(30)).unwrap();
        assert_eq!(storage.usage("E2"), 31);
    }

    #[test]
    fn test_host_allow_list() {
        let allowed = vec!["api.example.com".to_string(), "*.trusted.io".to_string()];
        assert!(host_allowed("api.example.com", &allowed));
        assert!(host_allowed("API.EXAMPLE.COM", &allowed));
        assert!(host_allowed("eu.trusted.io", &allowed));
        assert!(!host_allowed("trusted.io", &allowed));
        assert!(!host_allowed("evil.com", &allowed));
        assert!(!host_allowed("api.example.com.evil.com", &allowed));
    }

    async fn serve_once(response: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            // the client may hang up early on oversized bodies
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/")
    }

    fn get(url: String) -> HttpRequest {
        HttpRequest {
            url,
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gateway_caps_response_bodies() {
        let gateway = Arc::new(ReqwestGateway::new(tokio::runtime::Handle::current(), 1024).unwrap());
        let fetch = |url: String| {
            let gateway = gateway.clone();
            tokio::task::spawn_blocking(move || gateway.fetch(get(url), Duration::from_secs(5)))
        };

        let small = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec()).await;
        let response = fetch(small).await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "hello");

        // declared length over the cap is refused before the body is read
        let declared = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\nxxxx".to_vec(),
        )
        .await;
        assert_eq!(
            fetch(declared).await.unwrap(),
            Err(GatewayError::ResponseTooLarge(1024))
        );

        // chunked bodies are cut off once they pass the cap
        let mut chunked = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for _ in 0..8 {
            chunked.extend_from_slice(b"200\r\n");
            chunked.extend_from_slice(&[b'y'; 512]);
            chunked.extend_from_slice(b"\r\n");
        }
        chunked.extend_from_slice(b"0\r\n\r\n");
        let streamed = serve_once(chunked).await;
        assert_eq!(
            fetch(streamed).await.unwrap(),
            Err(GatewayError::ResponseTooLarge(1024))
        );
    }

    #[test]
    fn test_request_defaults() {
        let request: HttpRequest = serde_json::from_str(r#"{"url":"https://a.b/c"}"#).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
    }
}
