//! Directory operations: mkdir, rmdir, cwd, rename, delete.

use crate::ftp::client::FtpClient;
use crate::ftp::error::FtpResult;
use futures::future::{join_all, BoxFuture};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CWD_REPLY: Regex = Regex::new(r"directory is (.*)").unwrap();
    static ref DELE_REPLY: Regex = Regex::new(r"eleted (.*)").unwrap();
}

/// `dir` + `/` + `name`, without doubling the separator.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

impl FtpClient {
    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a directory, returning the path the server reports.
    pub async fn mkdir(&self, path: &str) -> FtpResult<String> {
        let reply = self.exec(format!("MKD {}", path)).await?;
        Ok(reply.text)
    }

    // ─── PWD / CWD ───────────────────────────────────────────────

    pub async fn getcwd(&self) -> FtpResult<String> {
        let reply = self.exec("PWD").await?;
        self.set_cwd(&reply.text);
        Ok(reply.text)
    }

    /// Change directory and return the new working directory.
    pub async fn chdir(&self, path: &str) -> FtpResult<String> {
        let reply = self.exec(format!("CWD {}", path)).await?;
        match CWD_REPLY.captures(&reply.text).and_then(|c| c.get(1)) {
            Some(dir) => {
                let dir = dir.as_str().trim().trim_matches('"').to_string();
                self.set_cwd(&dir);
                Ok(dir)
            }
            // the reply does not name the directory; ask for it
            None => self.getcwd().await,
        }
    }

    /// Return to the directory recorded at login.
    pub async fn root(&self) -> FtpResult<String> {
        let base = self.base_dir();
        self.chdir(&base).await
    }

    // ─── DELE ────────────────────────────────────────────────────

    /// Delete a remote file, returning the name the server reports.
    pub async fn unlink(&self, path: &str) -> FtpResult<String> {
        let reply = self.exec(format!("DELE {}", path)).await?;
        Ok(DELE_REPLY
            .captures(&reply.text)
            .and_then(|c| c.get(1))
            .map_or(reply.text.clone(), |m| m.as_str().to_string()))
    }

    // ─── RNFR / RNTO ────────────────────────────────────────────

    /// Rename (or move) a file or directory. `RNTO` follows `RNFR` with no
    /// other queued command in between.
    pub async fn rename(&self, from: &str, to: &str) -> FtpResult<String> {
        let reply = self
            .commands()
            .submit_chain(format!("RNFR {}", from), format!("RNTO {}", to))
            .await?;
        self.touch();
        Ok(reply.text)
    }

    // ─── RMD ─────────────────────────────────────────────────────

    /// Remove a directory. When the server refuses with 550 the contents are
    /// listed and removed first (files with DELE, subdirectories
    /// recursively), then `RMD` is retried once all of them have finished.
    pub fn rmdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, FtpResult<()>> {
        Box::pin(async move {
            match self.exec(format!("RMD {}", path)).await {
                Ok(_) => return Ok(()),
                Err(e) if e.code == Some(550) => {
                    log::info!("[{}] {} not removable yet: {}", self.id(), path, e.message);
                }
                Err(e) => return Err(e),
            }

            let entries = self.ls(path).await?;
            let removals = entries
                .iter()
                .filter(|e| e.filename != "." && e.filename != "..")
                .map(|entry| async move {
                    let child = join_remote(path, &entry.filename);
                    let res = if entry.is_directory {
                        self.rmdir(&child).await
                    } else {
                        self.unlink(&child).await.map(|_| ())
                    };
                    (child, res)
                });

            for (child, res) in join_all(removals).await {
                match res {
                    Ok(()) => log::debug!("[{}] removed {}", self.id(), child),
                    Err(e) => log::warn!("[{}] could not remove {}: {}", self.id(), child, e),
                }
            }

            self.exec(format!("RMD {}", path)).await.map(|_| ())
        })
    }
}
