//! FIFO command sequencing for the half-duplex control channel.
//!
//! [`CommandQueue`] is owned by the session driver. Callers talk to it through
//! a cloneable [`CommandSender`] and get a [`Pending`] completion back.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::Event;
use crate::ftp::types::Reply;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

pub type ReplyTx = oneshot::Sender<FtpResult<Reply>>;
pub type DoneTx = oneshot::Sender<FtpResult<()>>;
pub type PayloadRx = oneshot::Receiver<FtpResult<Vec<u8>>>;

/// One command line plus the completions it owes its caller.
#[derive(Debug)]
pub struct Command {
    pub text: String,
    pub reply: ReplyTx,
    /// Fired once the whole reply cycle is over, after `reply`.
    pub finished: Option<DoneTx>,
    /// Data-channel payload for download-style verbs.
    pub payload: Option<PayloadRx>,
    /// Written straight away without taking the queue slot.
    pub bypass: bool,
    /// Follow-up line written on success while the slot is still held.
    pub then: Option<String>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> (Self, Pending<Reply>) {
        let (tx, rx) = oneshot::channel();
        let cmd = Self {
            text: text.into(),
            reply: tx,
            finished: None,
            payload: None,
            bypass: false,
            then: None,
        };
        (cmd, Pending::new(rx))
    }

    /// Complete both completions with `err`.
    pub fn fail(self, err: FtpError) {
        if let Some(done) = self.finished {
            let _ = done.send(Err(err.clone()));
        }
        let _ = self.reply.send(Err(err));
    }
}

/// Completion handle for a submitted command or job.
///
/// Resolves to `Disconnected` if the session goes away before answering.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<FtpResult<T>>,
}

impl<T> Pending<T> {
    pub fn new(rx: oneshot::Receiver<FtpResult<T>>) -> Self {
        Self { rx }
    }
}

impl<T> Future for Pending<T> {
    type Output = FtpResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FtpError::disconnected(
                "session closed before the command completed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandQueueState {
    Idle,
    Busy,
    /// The control channel failed; nothing will be dispatched again.
    Failed,
}

/// Backlog of queued commands with one busy slot.
#[derive(Debug)]
pub struct CommandQueue {
    backlog: VecDeque<Command>,
    state: CommandQueueState,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            backlog: VecDeque::new(),
            state: CommandQueueState::Idle,
        }
    }

    /// Append (or prepend) a command. Returns `true` when the queue is idle
    /// and should be advanced right away.
    pub fn register(&mut self, cmd: Command, prepend: bool) -> bool {
        if self.state == CommandQueueState::Failed {
            cmd.fail(FtpError::disconnected("control channel has failed"));
            return false;
        }
        if prepend {
            self.backlog.push_front(cmd);
        } else {
            self.backlog.push_back(cmd);
        }
        self.state == CommandQueueState::Idle
    }

    /// Take the next command if the slot is free, marking the queue busy.
    pub fn advance(&mut self) -> Option<Command> {
        if self.state != CommandQueueState::Idle {
            return None;
        }
        let next = self.backlog.pop_front();
        if next.is_some() {
            self.state = CommandQueueState::Busy;
        }
        next
    }

    /// Release the busy slot.
    pub fn finish(&mut self) {
        if self.state == CommandQueueState::Busy {
            self.state = CommandQueueState::Idle;
        }
    }

    /// Fail every queued command and refuse new ones.
    pub fn fail_all(&mut self, err: &FtpError) {
        self.state = CommandQueueState::Failed;
        for cmd in self.backlog.drain(..) {
            cmd.fail(err.clone());
        }
    }

    pub fn state(&self) -> CommandQueueState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }
}

/// Cloneable handle for submitting commands to a session.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl CommandSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Queue a command behind everything already submitted.
    pub fn submit(&self, text: impl Into<String>) -> Pending<Reply> {
        let (cmd, pending) = Command::new(text);
        self.send(Event::Submit { cmd, prepend: false });
        pending
    }

    /// Queue a command ahead of the backlog.
    pub fn submit_front(&self, text: impl Into<String>) -> Pending<Reply> {
        let (cmd, pending) = Command::new(text);
        self.send(Event::Submit { cmd, prepend: true });
        pending
    }

    /// Write a command immediately, bypassing the backlog.
    pub fn run_now(&self, text: impl Into<String>) -> Pending<Reply> {
        let (mut cmd, pending) = Command::new(text);
        cmd.bypass = true;
        self.send(Event::Submit { cmd, prepend: false });
        pending
    }

    /// Queue a command and also get a completion for its whole reply cycle.
    /// `payload` carries the data-channel bytes for download-style verbs.
    pub fn submit_tracked(
        &self,
        text: impl Into<String>,
        payload: Option<PayloadRx>,
    ) -> (Pending<Reply>, Pending<()>) {
        let (mut cmd, pending) = Command::new(text);
        let (done_tx, done_rx) = oneshot::channel();
        cmd.finished = Some(done_tx);
        cmd.payload = payload;
        self.send(Event::Submit { cmd, prepend: false });
        (pending, Pending::new(done_rx))
    }

    /// Queue `first`, then write `then` as soon as `first` succeeds without
    /// letting another queued command in between. Resolves with the reply
    /// to `then`, or the error from whichever failed.
    pub fn submit_chain(&self, first: impl Into<String>, then: impl Into<String>) -> Pending<Reply> {
        let (mut cmd, pending) = Command::new(first);
        cmd.then = Some(then.into());
        self.send(Event::Submit { cmd, prepend: false });
        pending
    }

    /// Ask the session driver to stop. Outstanding commands fail.
    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: Event) {
        // A closed channel drops the command; its Pending reports Disconnected.
        if self.tx.send(event).is_err() {
            log::debug!("session driver gone, command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;

    #[test]
    fn test_fifo_with_single_slot() {
        let mut q = CommandQueue::new();
        let (a, _pa) = Command::new("NOOP");
        let (b, _pb) = Command::new("PWD");
        assert!(q.register(a, false));
        assert_eq!(q.advance().unwrap().text, "NOOP");
        assert_eq!(q.state(), CommandQueueState::Busy);

        assert!(!q.register(b, false));
        assert!(q.advance().is_none());

        q.finish();
        assert_eq!(q.advance().unwrap().text, "PWD");
        q.finish();
        assert!(q.advance().is_none());
        assert_eq!(q.state(), CommandQueueState::Idle);
    }

    #[test]
    fn test_prepend_jumps_backlog() {
        let mut q = CommandQueue::new();
        let (a, _pa) = Command::new("A");
        let (b, _pb) = Command::new("B");
        let (c, _pc) = Command::new("C");
        q.register(a, false);
        let _ = q.advance();
        q.register(b, false);
        q.register(c, true);
        q.finish();
        assert_eq!(q.advance().unwrap().text, "C");
        q.finish();
        assert_eq!(q.advance().unwrap().text, "B");
    }

    #[tokio::test]
    async fn test_fail_all_completes_backlog() {
        let mut q = CommandQueue::new();
        let (a, pa) = Command::new("A");
        q.register(a, false);
        q.fail_all(&FtpError::disconnected("gone"));
        assert_eq!(q.state(), CommandQueueState::Failed);
        assert_eq!(pa.await.unwrap_err().kind, FtpErrorKind::Disconnected);

        let (b, pb) = Command::new("B");
        assert!(!q.register(b, false));
        assert!(q.advance().is_none());
        assert_eq!(pb.await.unwrap_err().kind, FtpErrorKind::Disconnected);
    }

    #[test]
    fn test_pending_resolves_once_answered() {
        let (tx, rx) = oneshot::channel();
        let mut pending = tokio_test::task::spawn(Pending::new(rx));
        tokio_test::assert_pending!(pending.poll());

        let _ = tx.send(Ok(Reply::new(200, "ok")));
        assert!(pending.is_woken());
        let reply = tokio_test::assert_ready_ok!(pending.poll());
        assert_eq!(reply.code, 200);
    }

    #[tokio::test]
    async fn test_pending_without_driver_is_disconnected() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = CommandSender::new(tx);
        let err = sender.submit("NOOP").await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Disconnected);
    }
}
