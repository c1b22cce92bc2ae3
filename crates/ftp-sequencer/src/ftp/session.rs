//! Session driver.
//!
//! One task per connection owns the control writer, the [`CommandQueue`] and
//! the commands awaiting replies. Everything that changes protocol state
//! arrives as an [`Event`] and is applied here, one at a time.
//!
//! Replies are matched to commands in write order: each reply goes to the
//! oldest awaiting command that still accepts replies.

use crate::ftp::command_queue::{Command, CommandQueue, CommandSender, DoneTx, ReplyTx};
use crate::ftp::dispatcher::{classify, verb_of, ReplyParser, Transition};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{ControlChannel, ControlWriter};
use crate::ftp::types::{Reply, ReplyRecord};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Verbs whose 125/150 reply means a payload is coming on the data channel.
pub type TransferVerbs = Arc<RwLock<HashSet<String>>>;

/// Input to the session driver.
#[derive(Debug)]
pub enum Event {
    /// A bypassing command is written at once; others join the queue.
    Submit { cmd: Command, prepend: bool },
    Inbound(Vec<u8>),
    ControlClosed(Option<FtpError>),
    Payload { id: u64, result: FtpResult<Vec<u8>> },
    Shutdown,
}

/// Where an in-flight command is in its reply cycle.
#[derive(Debug)]
pub enum Phase {
    AwaitingReply,
    /// 150 seen; waiting for the data channel. A terminal reply that arrives
    /// first is stashed and applied with the payload.
    AwaitingPayload {
        preliminary: ReplyRecord,
        stashed: Option<ReplyRecord>,
    },
    /// Caller answered; the command retires on its terminal reply.
    AwaitingTerminal,
    /// DELE got 226; the file-action reply decides the outcome.
    AwaitingFileAction,
}

#[derive(Debug)]
enum PayloadSlot {
    Absent,
    Waiting,
    Ready(FtpResult<Vec<u8>>),
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    verb: String,
    holds_slot: bool,
    phase: Phase,
    reply: Option<ReplyTx>,
    finished: Option<DoneTx>,
    then: Option<String>,
    payload: PayloadSlot,
}

impl InFlight {
    fn accepts_replies(&self) -> bool {
        !matches!(
            self.phase,
            Phase::AwaitingPayload {
                stashed: Some(_),
                ..
            }
        )
    }

    /// Answer the caller. Later calls are no-ops.
    fn deliver(&mut self, res: FtpResult<Reply>, session_id: &str) {
        if let Some(tx) = self.reply.take() {
            let res = res.map_err(|e| e.with_session(session_id));
            let _ = tx.send(res);
        }
    }
}

/// Start the reader and driver tasks for a freshly logged-in control channel.
///
/// `parser` may already hold bytes read during the banner exchange.
pub fn start(
    session_id: String,
    channel: ControlChannel,
    parser: ReplyParser,
    transfer_verbs: TransferVerbs,
) -> (CommandSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (reader, writer) = channel.into_split();
    let reader_task = reader.spawn_forwarder(tx.clone());

    let driver = SessionDriver {
        session_id,
        writer,
        parser,
        queue: CommandQueue::new(),
        awaiting: VecDeque::new(),
        transfer_verbs,
        events_tx: tx.clone(),
        events: rx,
        reader_task,
        next_id: 0,
        closed: false,
    };
    let handle = tokio::spawn(driver.run());
    (CommandSender::new(tx), handle)
}

struct SessionDriver {
    session_id: String,
    writer: ControlWriter,
    parser: ReplyParser,
    queue: CommandQueue,
    awaiting: VecDeque<InFlight>,
    transfer_verbs: TransferVerbs,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    reader_task: JoinHandle<()>,
    next_id: u64,
    closed: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        log::debug!("[{}] session driver started", self.session_id);
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
            if self.closed {
                break;
            }
        }
        self.reader_task.abort();
        self.writer.shutdown().await;
        log::info!("[{}] session closed", self.session_id);
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Submit { cmd, .. } if cmd.bypass => self.write(cmd, false).await,
            Event::Submit { cmd, prepend } => {
                if self.queue.register(cmd, prepend) {
                    self.pump().await;
                }
            }
            Event::Inbound(chunk) => {
                for rec in self.parser.feed(&chunk) {
                    self.on_reply(rec).await;
                    if self.closed {
                        break;
                    }
                }
            }
            Event::Payload { id, result } => self.on_payload(id, result).await,
            Event::ControlClosed(err) => {
                if self.parser.has_partial() {
                    log::debug!("[{}] control closed in the middle of a reply", self.session_id);
                }
                let err = err.unwrap_or_else(|| FtpError::disconnected("server closed the control connection"));
                self.fail_session(err);
            }
            Event::Shutdown => self.fail_session(FtpError::cancelled("session shut down")),
        }
    }

    /// Dispatch the next queued command if the slot is free.
    async fn pump(&mut self) {
        if let Some(cmd) = self.queue.advance() {
            self.write(cmd, true).await;
        }
    }

    async fn write(&mut self, cmd: Command, holds_slot: bool) {
        let id = self.next_id;
        self.next_id += 1;

        let Command {
            text,
            reply,
            finished,
            payload,
            then,
            ..
        } = cmd;

        let payload = match payload {
            Some(rx) => {
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = rx.await.unwrap_or_else(|_| {
                        Err(FtpError::data_channel("data connection dropped before the payload arrived"))
                    });
                    let _ = tx.send(Event::Payload { id, result });
                });
                PayloadSlot::Waiting
            }
            None => PayloadSlot::Absent,
        };

        self.awaiting.push_back(InFlight {
            id,
            verb: verb_of(&text),
            holds_slot,
            phase: Phase::AwaitingReply,
            reply: Some(reply),
            finished,
            then,
            payload,
        });

        if let Err(e) = self.writer.send_command(&text).await {
            self.fail_session(e);
        }
    }

    async fn on_reply(&mut self, rec: ReplyRecord) {
        let Some(idx) = self.awaiting.iter().position(InFlight::accepts_replies) else {
            let err = FtpError::from_reply(rec.code, &rec.body);
            if err.is_fatal() {
                log::warn!("[{}] server closing: {}", self.session_id, rec.body);
                self.fail_session(err);
            } else {
                log::warn!("[{}] unsolicited reply {} {}", self.session_id, rec.code, rec.body);
            }
            return;
        };

        let verb = self.awaiting[idx].verb.clone();
        let phase = std::mem::replace(&mut self.awaiting[idx].phase, Phase::AwaitingReply);
        log::debug!("[{}] {} <- {} ({:?})", self.session_id, verb, rec.code, phase);

        match phase {
            Phase::AwaitingReply => match classify(rec.code, &rec.body, &verb) {
                Transition::AwaitNextReply => {}
                Transition::AwaitFileAction => self.awaiting[idx].phase = Phase::AwaitingFileAction,
                Transition::AwaitPayload => self.expect_payload(idx, rec).await,
                Transition::Finish(res) => self.finish(idx, rec.code, res).await,
            },
            Phase::AwaitingPayload {
                preliminary,
                stashed: None,
            } => {
                if rec.code >= 400 {
                    // the payload, if it still arrives, is dropped
                    let res = Err(FtpError::from_reply(rec.code, &rec.body));
                    self.finish(idx, rec.code, res).await;
                } else if rec.code < 200 {
                    self.awaiting[idx].phase = Phase::AwaitingPayload {
                        preliminary,
                        stashed: None,
                    };
                } else {
                    self.awaiting[idx].phase = Phase::AwaitingPayload {
                        preliminary,
                        stashed: Some(rec),
                    };
                }
            }
            stashed @ Phase::AwaitingPayload { .. } => {
                self.awaiting[idx].phase = stashed;
            }
            Phase::AwaitingTerminal => match classify(rec.code, &rec.body, &verb) {
                Transition::Finish(res) => self.finish(idx, rec.code, res).await,
                _ => self.awaiting[idx].phase = Phase::AwaitingTerminal,
            },
            Phase::AwaitingFileAction => match rec.code {
                200..=299 => self.finish(idx, rec.code, Ok(rec.body)).await,
                400..=599 => {
                    let res = Err(FtpError::from_reply(rec.code, &rec.body));
                    self.finish(idx, rec.code, res).await;
                }
                _ => self.awaiting[idx].phase = Phase::AwaitingFileAction,
            },
        }
    }

    /// A 125/150 arrived for a download-style verb.
    async fn expect_payload(&mut self, idx: usize, preliminary: ReplyRecord) {
        let registered = self
            .transfer_verbs
            .read()
            .map(|verbs| verbs.contains(&self.awaiting[idx].verb))
            .unwrap_or(false);

        let entry = &mut self.awaiting[idx];
        if !registered || matches!(entry.payload, PayloadSlot::Absent) {
            // nothing will hand us a payload; the terminal reply answers
            entry.phase = Phase::AwaitingTerminal;
            return;
        }

        match std::mem::replace(&mut entry.payload, PayloadSlot::Absent) {
            PayloadSlot::Ready(result) => {
                entry.phase = Phase::AwaitingPayload {
                    preliminary,
                    stashed: None,
                };
                let id = entry.id;
                self.on_payload(id, result).await;
            }
            slot => {
                entry.payload = slot;
                entry.phase = Phase::AwaitingPayload {
                    preliminary,
                    stashed: None,
                };
            }
        }
    }

    async fn on_payload(&mut self, id: u64, result: FtpResult<Vec<u8>>) {
        let Some(idx) = self.awaiting.iter().position(|f| f.id == id) else {
            log::trace!("[{}] payload for retired command #{} dropped", self.session_id, id);
            return;
        };

        let entry = &mut self.awaiting[idx];
        match std::mem::replace(&mut entry.phase, Phase::AwaitingReply) {
            Phase::AwaitingPayload { preliminary, stashed } => {
                let head = stashed.as_ref().unwrap_or(&preliminary);
                let res = result.map(|data| Reply {
                    code: head.code,
                    text: head.body.clone(),
                    data: Some(data),
                });
                let done = res.as_ref().map(|_| ()).map_err(Clone::clone);
                entry.deliver(res, &self.session_id);

                if stashed.is_some() {
                    self.retire(idx, done).await;
                } else {
                    entry.phase = Phase::AwaitingTerminal;
                }
            }
            other => {
                // early payload; used once the 150 (or the terminal reply) shows up
                entry.phase = other;
                entry.payload = PayloadSlot::Ready(result);
            }
        }
    }

    async fn finish(&mut self, idx: usize, code: u16, res: FtpResult<String>) {
        let entry = &mut self.awaiting[idx];

        if res.is_ok() {
            if let Some(next) = entry.then.take() {
                entry.verb = verb_of(&next);
                entry.phase = Phase::AwaitingReply;
                // commands written since `first` are ahead of `next` on the wire
                if let Some(entry) = self.awaiting.remove(idx) {
                    self.awaiting.push_back(entry);
                }
                if let Err(e) = self.writer.send_command(&next).await {
                    self.fail_session(e);
                }
                return;
            }
        }

        // a payload that never got its 150 does not belong to this reply
        entry.payload = PayloadSlot::Absent;
        let done = res.as_ref().map(|_| ()).map_err(Clone::clone);
        entry.deliver(
            res.map(|text| Reply {
                code,
                text,
                data: None,
            }),
            &self.session_id,
        );
        self.retire(idx, done).await;
    }

    /// Drop a finished command and hand its slot to the next queued one.
    async fn retire(&mut self, idx: usize, done: FtpResult<()>) {
        let Some(entry) = self.awaiting.remove(idx) else {
            return;
        };
        if let Some(tx) = entry.finished {
            let _ = tx.send(done);
        }
        if entry.holds_slot {
            self.queue.finish();
            self.pump().await;
        }
    }

    /// The control channel is unusable: fail everything and stop.
    fn fail_session(&mut self, err: FtpError) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::info!("[{}] control channel down: {}", self.session_id, err);

        let err = err.with_session(&self.session_id);
        for mut entry in self.awaiting.drain(..) {
            entry.deliver(Err(err.clone()), &self.session_id);
            if let Some(tx) = entry.finished.take() {
                let _ = tx.send(Err(err.clone()));
            }
        }
        self.queue.fail_all(&err);
    }
}
