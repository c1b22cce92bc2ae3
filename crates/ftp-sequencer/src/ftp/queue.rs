//! Download-style transfer queues, one per verb (`RETR`, `LIST`, `NLST`,
//! `MDTM`, `SIZE`).
//!
//! Jobs drain one at a time on a spawned task. Every job leases the data
//! channel, so queues for different verbs interleave but never overlap.

use crate::ftp::command_queue::{CommandSender, Pending};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::hooks::{HookRegistry, PayloadHook};
use crate::ftp::session::TransferVerbs;
use crate::ftp::transfer::DataChannelManager;
use crate::ftp::types::{QueueState, Reply, TransferOutput};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Jobs keyed by id, drained in insertion order.
#[derive(Debug)]
pub struct JobBook<J> {
    pub items: HashMap<String, J>,
    pub order: VecDeque<String>,
}

impl<J> Default for JobBook<J> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            order: VecDeque::new(),
        }
    }
}

impl<J> JobBook<J> {
    pub fn push(&mut self, id: String, job: J) {
        self.items.insert(id.clone(), job);
        self.order.push_back(id);
    }

    /// Remove and return the oldest job.
    pub fn next(&mut self) -> Option<J> {
        while let Some(id) = self.order.pop_front() {
            if let Some(job) = self.items.remove(&id) {
                return Some(job);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Lock a job book, recovering it if a drain task panicked mid-update.
pub(crate) fn lock_book<J>(book: &Mutex<JobBook<J>>) -> MutexGuard<'_, JobBook<J>> {
    book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A queued download-style command.
#[derive(Debug)]
pub struct TransferJob {
    pub id: String,
    pub path: String,
    pub queued_at: DateTime<Utc>,
    reply: oneshot::Sender<FtpResult<TransferOutput>>,
}

struct QueueShared {
    verb: String,
    commands: CommandSender,
    data: DataChannelManager,
    peer: SocketAddr,
    hook: Option<PayloadHook>,
    jobs: Mutex<JobBook<TransferJob>>,
    state: watch::Sender<QueueState>,
}

/// Serialized queue for one download-style verb.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueShared>,
}

impl std::fmt::Debug for TransferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferQueue")
            .field("verb", &self.inner.verb)
            .field("state", &self.state())
            .field("pending", &self.len())
            .finish()
    }
}

impl TransferQueue {
    /// Build the queue for `verb`, marking it as a data-transfer verb and
    /// binding its payload hook if the registry has one.
    pub fn create(
        verb: &str,
        commands: CommandSender,
        data: DataChannelManager,
        peer: SocketAddr,
        hooks: &HookRegistry,
        transfer_verbs: &TransferVerbs,
    ) -> Self {
        let verb = verb.to_ascii_uppercase();
        if let Ok(mut verbs) = transfer_verbs.write() {
            verbs.insert(verb.clone());
        }
        let (state, _) = watch::channel(QueueState::Idle);
        Self {
            inner: Arc::new(QueueShared {
                hook: hooks.get(&verb),
                verb,
                commands,
                data,
                peer,
                jobs: Mutex::new(JobBook::default()),
                state,
            }),
        }
    }

    pub fn verb(&self) -> &str {
        &self.inner.verb
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.inner.state.subscribe()
    }

    /// Jobs waiting, not counting the one being processed.
    pub fn len(&self) -> usize {
        lock_book(&self.inner.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `<VERB> <path>`. An idle queue starts draining right away.
    pub fn enqueue(&self, path: &str) -> Pending<TransferOutput> {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4().to_string();
        let job = TransferJob {
            id: id.clone(),
            path: path.to_string(),
            queued_at: Utc::now(),
            reply: tx,
        };

        let mut jobs = lock_book(&self.inner.jobs);
        jobs.push(id, job);
        if self.state() == QueueState::Idle {
            self.inner.state.send_replace(QueueState::Busy);
            tokio::spawn(self.clone().drain());
        }
        Pending::new(rx)
    }

    async fn drain(self) {
        loop {
            let job = {
                let mut jobs = lock_book(&self.inner.jobs);
                match jobs.next() {
                    Some(job) => job,
                    None => {
                        self.inner.state.send_replace(QueueState::Idle);
                        log::debug!("{} queue empty", self.inner.verb);
                        return;
                    }
                }
            };
            self.process(job).await;
        }
    }

    async fn process(&self, job: TransferJob) {
        let TransferJob { id, path, reply, queued_at } = job;
        let verb = &self.inner.verb;
        let data = &self.inner.data;
        log::debug!("{} {} started (job {}, queued {})", verb, path, id, queued_at);

        let mut conn = match data.open(&self.inner.commands, self.inner.peer).await {
            Ok(conn) => conn,
            Err(e) => {
                let e = if data.take_abort() {
                    FtpError::aborted(format!("{} {} aborted", verb, path))
                } else {
                    e
                };
                let _ = reply.send(Err(e));
                return;
            }
        };

        let command = if path.is_empty() {
            verb.clone()
        } else {
            format!("{} {}", verb, path)
        };
        let payload = conn.start_download();
        let (answer, finished) = self.inner.commands.submit_tracked(command, Some(payload));

        let res = answer.await;
        let out = if data.take_abort() {
            self.inner.state.send_replace(QueueState::Aborting);
            Err(FtpError::aborted(format!("{} {} aborted", verb, path)))
        } else {
            res.and_then(|r| self.apply_hook(&r))
        };
        if reply.send(out).is_err() {
            log::trace!("{} {}: caller went away", verb, path);
        }

        if let Err(e) = finished.await {
            log::debug!("{} {} finished with {}", verb, path, e);
        }
        drop(conn);

        if data.take_abort() {
            log::debug!("late abort after {} {} ignored", verb, path);
        }
        if self.state() == QueueState::Aborting {
            self.inner.state.send_replace(QueueState::Busy);
        }
    }

    fn apply_hook(&self, reply: &Reply) -> FtpResult<TransferOutput> {
        let input = reply.raw();
        match &self.inner.hook {
            Some(hook) => hook(input),
            None => Ok(TransferOutput::Raw(input.to_vec())),
        }
    }
}
