//! File-level operations: download, listing, metadata, upload, save.
//! Each goes through the queue for its verb.

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::*;
use tokio::fs;

impl FtpClient {
    // ─── RETR ────────────────────────────────────────────────────

    /// Download a remote file into memory.
    pub async fn get(&self, path: &str) -> FtpResult<Vec<u8>> {
        let out = self.inner.retr.enqueue(path).await?;
        self.touch();
        out.into_raw()
    }

    /// Download `paths.source()` (remote) and write it to `paths.target()` (local).
    /// Returns the local path.
    pub async fn save(&self, paths: impl Into<TransferPaths>) -> FtpResult<String> {
        let paths = paths.into();
        paths.validate()?;
        let bytes = self.get(paths.source()).await?;
        fs::write(paths.target(), &bytes)
            .await
            .map_err(|e| FtpError::io_error(format!("writing {}: {}", paths.target(), e)))?;
        log::debug!("saved {} ({} bytes) to {}", paths.source(), bytes.len(), paths.target());
        Ok(paths.target().to_string())
    }

    // ─── LIST / NLST ────────────────────────────────────────────

    pub async fn ls(&self, path: &str) -> FtpResult<Vec<StatRecord>> {
        let out = self.inner.list.enqueue(path).await?;
        self.touch();
        out.into_listing()
    }

    pub async fn lsnames(&self, path: &str) -> FtpResult<Vec<String>> {
        let out = self.inner.nlst.enqueue(path).await?;
        self.touch();
        out.into_names()
    }

    // ─── MDTM / SIZE ────────────────────────────────────────────

    /// Modification time of a remote file, epoch milliseconds.
    pub async fn filemtime(&self, path: &str) -> FtpResult<i64> {
        let out = self.inner.mdtm.enqueue(path).await?;
        self.touch();
        out.into_timestamp()
    }

    pub async fn size(&self, path: &str) -> FtpResult<u64> {
        let out = self.inner.size.enqueue(path).await?;
        self.touch();
        out.into_size()
    }

    // ─── STOR ────────────────────────────────────────────────────

    /// Upload `paths.source()` (local) to `paths.target()` (remote).
    ///
    /// The job is queued as soon as the returned future is first polled.
    pub async fn put(&self, paths: impl Into<TransferPaths>) -> FtpResult<Reply> {
        let reply = self.inner.uploads.put(paths)?.await;
        self.touch();
        reply
    }
}
