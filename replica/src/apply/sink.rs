use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};

/// External receiver of buffered batches.
pub trait BatchSink: Clone + Send + Sync + 'static {
    /// Delivers one serialized batch. `key` identifies the batch across retries.
    fn flush(&self, key: &str, payload: Vec<u8>) -> impl Future<Output = ReplicaResult<()>> + Send;
}

/// Posts batches as a multipart file upload to `{url}sync`.
#[derive(Debug, Clone)]
pub struct HttpBatchSink {
    client: reqwest::Client,
    sync_url: Arc<str>,
}

impl HttpBatchSink {
    pub const IDEMPOTENCY_KEY_HEADER: &'static str = "Idempotency-Key";

    pub fn new(url: &str) -> ReplicaResult<Self> {
        if !url.ends_with('/') {
            bail!(
                ErrorKind::ConfigError,
                "Sink url must end with a slash",
                url
            );
        }

        Ok(Self {
            client: reqwest::Client::new(),
            sync_url: Arc::from(format!("{url}sync")),
        })
    }
}

impl BatchSink for HttpBatchSink {
    async fn flush(&self, key: &str, payload: Vec<u8>) -> ReplicaResult<()> {
        let part = Part::bytes(payload)
            .file_name("file")
            .mime_str("text/plain")?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.sync_url.as_ref())
            .header(Self::IDEMPOTENCY_KEY_HEADER, key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        info!(url = %self.sync_url, status = %response.status(), "sent batch to sink");

        Ok(())
    }
}

/// Writes every batch to `batch_{consumer}_{tick}.json` in a directory.
#[derive(Debug, Clone)]
pub struct FileBatchSink {
    dir: PathBuf,
}

impl FileBatchSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut parts = key.rsplitn(3, ':');
        let tick = parts.next().unwrap_or(key);
        let file_name = match parts.next() {
            Some(consumer) => format!("batch_{consumer}_{tick}.json"),
            None => format!("batch_{tick}.json"),
        };

        self.dir.join(file_name)
    }
}

impl BatchSink for FileBatchSink {
    async fn flush(&self, key: &str, payload: Vec<u8>) -> ReplicaResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        tokio::fs::write(&path, payload).await?;

        info!(path = %path.display(), "wrote batch file");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_sink_requires_trailing_slash() {
        let err = HttpBatchSink::new("http://localhost:8080/api").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(HttpBatchSink::new("http://localhost:8080/api/").is_ok());
    }

    #[tokio::test]
    async fn file_sink_names_files_after_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileBatchSink::new(dir.path().join("out"));

        sink.flush("replika:leaf:42", b"{}".to_vec()).await.unwrap();

        let written = tokio::fs::read(dir.path().join("out").join("batch_leaf_42.json"))
            .await
            .unwrap();
        assert_eq!(written, b"{}");
    }
}
