//! Fetching metadata and signature documents.

use async_trait::async_trait;
use ignition_errors::{ErrorKind, Result, UpdateError};

/// Fetches the bytes behind a metadata or signature URI.
///
/// The engine never talks to the network itself; download remotes are
/// served by whatever fetcher the embedding binary provides. The in-tree
/// [`FileFetcher`] handles local paths and `file://` URIs, which also
/// covers the test suites.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Fetch the document at `uri`.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed fetcher.
#[derive(Debug, Default)]
pub struct FileFetcher;

#[async_trait]
impl MetadataFetcher for FileFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpdateError::new(ErrorKind::NotReachable, format!("'{path}' does not exist"))
            } else {
                UpdateError::from(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_plain_path_and_file_uri() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metadata.xml");
        tokio::fs::write(&path, b"<components/>").await?;

        let fetcher = FileFetcher;
        let display = path.display().to_string();
        assert_eq!(fetcher.fetch(&display).await?, b"<components/>");
        assert_eq!(
            fetcher.fetch(&format!("file://{display}")).await?,
            b"<components/>"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_not_reachable() {
        let fetcher = FileFetcher;
        let err = fetcher.fetch("/definitely/not/here.xml").await;
        assert!(err.is_err_and(|e| e.kind() == ErrorKind::NotReachable));
    }
}
