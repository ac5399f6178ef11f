// REST blob endpoint:
//   PUT    {base}/{owner}/{key}   body = bytes
//   GET    {base}/{owner}/{key}   404 → missing
//   DELETE {base}/{owner}/{key}   404 → missing
//   GET    {base}/{owner}         JSON array of keys

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

use super::object_store::{check_segment, ObjectStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::pii::safe_log_preview;

pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        HttpObjectStore {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn owner_url(&self, owner_id: &str) -> EngineResult<String> {
        check_segment("owner id", owner_id)?;
        Ok(format!("{}/{}", self.base_url, owner_id))
    }

    fn object_url(&self, owner_id: &str, key: &str) -> EngineResult<String> {
        check_segment("object key", key)?;
        Ok(format!("{}/{}", self.owner_url(owner_id)?, key))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    async fn fail(method: &str, url: &str, response: Response) -> EngineError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!("[kmem-backup] {} {} failed: {}", method, url, status);
        EngineError::Storage(format!(
            "{} {} returned {}: {}",
            method,
            url,
            status.as_u16(),
            safe_log_preview(&body, 200)
        ))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn put(&self, owner_id: &str, key: &str, bytes: Vec<u8>) -> EngineResult<()> {
        let url = self.object_url(owner_id, key)?;
        let len = bytes.len();
        let response = self
            .authed(self.client.put(&url))
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail("PUT", &url, response).await);
        }
        debug!("[kmem-backup] PUT {} ({} bytes)", url, len);
        Ok(())
    }

    async fn get(&self, owner_id: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let url = self.object_url(owner_id, key)?;
        let response = self.authed(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            _ => Err(Self::fail("GET", &url, response).await),
        }
    }

    async fn delete(&self, owner_id: &str, key: &str) -> EngineResult<bool> {
        let url = self.object_url(owner_id, key)?;
        let response = self.authed(self.client.delete(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(Self::fail("DELETE", &url, response).await),
        }
    }

    async fn list(&self, owner_id: &str) -> EngineResult<Vec<String>> {
        let url = self.owner_url(owner_id)?;
        let response = self.authed(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            s if s.is_success() => {
                let mut keys: Vec<String> = response.json().await?;
                keys.sort();
                Ok(keys)
            }
            _ => Err(Self::fail("GET", &url, response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_from_checked_segments() {
        let store = HttpObjectStore::new("https://backup.example.com/v1/", None);
        assert_eq!(
            store.object_url("u1", "abc.kbak").unwrap(),
            "https://backup.example.com/v1/u1/abc.kbak"
        );
        assert_eq!(store.owner_url("u1").unwrap(), "https://backup.example.com/v1/u1");
        assert!(store.object_url("u1", "../secrets").is_err());
        assert!(store.owner_url("a b").is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let store = HttpObjectStore::new("http://127.0.0.1:9", None);
        let err = store.list("u1").await.unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
        assert!(err.is_retryable());
    }
}
