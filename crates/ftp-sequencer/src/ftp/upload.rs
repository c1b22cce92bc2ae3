//! `STOR` upload queue.
//!
//! Each job writes its payload to a fresh passive data connection, closes it,
//! then issues `STOR` on the control channel. Abort is checked after the data
//! channel opens, after the payload is written and after the reply arrives.

use crate::ftp::command_queue::{CommandSender, Pending};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::queue::{lock_book, JobBook};
use crate::ftp::transfer::DataChannelManager;
use crate::ftp::types::{QueueState, Reply, TransferPaths};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A queued upload. The local file is read in the background from the
/// moment the job is created.
#[derive(Debug)]
pub struct UploadJob {
    pub id: String,
    pub local: String,
    pub remote: String,
    pub queued_at: DateTime<Utc>,
    payload: JoinHandle<std::io::Result<Vec<u8>>>,
    reply: oneshot::Sender<FtpResult<Reply>>,
}

struct UploadShared {
    commands: CommandSender,
    data: DataChannelManager,
    peer: SocketAddr,
    jobs: Mutex<JobBook<UploadJob>>,
    state: watch::Sender<QueueState>,
}

#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<UploadShared>,
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("state", &self.state())
            .field("pending", &self.len())
            .finish()
    }
}

impl UploadQueue {
    pub fn new(commands: CommandSender, data: DataChannelManager, peer: SocketAddr) -> Self {
        let (state, _) = watch::channel(QueueState::Idle);
        Self {
            inner: Arc::new(UploadShared {
                commands,
                data,
                peer,
                jobs: Mutex::new(JobBook::default()),
                state,
            }),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.inner.state.subscribe()
    }

    pub fn len(&self) -> usize {
        lock_book(&self.inner.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an upload of `paths.source()` (local) to `paths.target()` (remote).
    ///
    /// The job takes its place in the queue immediately; the file read
    /// happens concurrently and a read failure completes the job with an
    /// `IoError`.
    pub fn put(&self, paths: impl Into<TransferPaths>) -> FtpResult<Pending<Reply>> {
        let paths = paths.into();
        paths.validate()?;
        let local = paths.source().to_string();
        let remote = paths.target().to_string();

        let read_path = local.clone();
        let payload = tokio::spawn(async move { tokio::fs::read(read_path).await });

        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4().to_string();
        log::debug!("upload {} queued: {} -> {}", id, local, remote);
        let job = UploadJob {
            id: id.clone(),
            local,
            remote,
            queued_at: Utc::now(),
            payload,
            reply: tx,
        };

        let mut jobs = lock_book(&self.inner.jobs);
        jobs.push(id, job);
        if self.state() == QueueState::Idle {
            self.inner.state.send_replace(QueueState::Busy);
            tokio::spawn(self.clone().drain());
        }
        Ok(Pending::new(rx))
    }

    async fn drain(self) {
        loop {
            let job = {
                let mut jobs = lock_book(&self.inner.jobs);
                match jobs.next() {
                    Some(job) => job,
                    None => {
                        self.inner.state.send_replace(QueueState::Idle);
                        log::debug!("upload queue empty");
                        return;
                    }
                }
            };
            self.process(job).await;
        }
    }

    async fn process(&self, job: UploadJob) {
        let UploadJob {
            id,
            local,
            remote,
            payload,
            reply,
            ..
        } = job;

        let bytes = match payload.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                let _ = reply.send(Err(FtpError::io_error(format!("reading {}: {}", local, e))));
                return;
            }
            Err(e) => {
                let _ = reply.send(Err(FtpError::io_error(format!("reading {}: {}", local, e))));
                return;
            }
        };

        let data = &self.inner.data;
        data.set_active(true);
        let res = self.store(&remote, &bytes).await;
        let _ = reply.send(res);
        data.set_active(false);

        // checkpoint 3
        if self.checkpoint() {
            log::debug!("upload {} ({}) aborted after its reply", id, remote);
        }
        if self.state() == QueueState::Aborting {
            self.inner.state.send_replace(QueueState::Busy);
        }
    }

    async fn store(&self, remote: &str, bytes: &[u8]) -> FtpResult<Reply> {
        let aborted = || FtpError::aborted(format!("upload of {} aborted", remote));

        let mut conn = match self.inner.data.open(&self.inner.commands, self.inner.peer).await {
            Ok(conn) => conn,
            Err(e) => return Err(if self.checkpoint() { aborted() } else { e }),
        };

        // checkpoint 1
        if self.checkpoint() {
            return Err(aborted());
        }

        let sent = conn.send_and_close(bytes).await;

        // checkpoint 2
        if self.checkpoint() {
            return Err(aborted());
        }
        sent?;

        let reply = self.inner.commands.run_now(format!("STOR {}", remote)).await;
        drop(conn);
        reply
    }

    /// Consume a pending abort, flagging the queue as aborting.
    fn checkpoint(&self) -> bool {
        if self.inner.data.take_abort() {
            self.inner.state.send_replace(QueueState::Aborting);
            true
        } else {
            false
        }
    }
}
