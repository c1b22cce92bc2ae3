//! Control-channel reply parsing and classification.
//!
//! [`ReplyParser`] turns raw inbound chunks into [`ReplyRecord`]s.
//! [`classify`] decides what a record means for the command it answers; the
//! session driver applies the resulting [`Transition`].

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::ReplyRecord;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REPLY_LINE: Regex = Regex::new(r"^(\d{1,3})(?:([ -])(.*))?$").unwrap();
}

/// Verbs whose 1xx preliminary reply means the client is sending, not receiving.
const STORE_VERBS: [&str; 3] = ["STOR", "APPE", "STOU"];

/// First token of a command line, upper-cased.
pub fn verb_of(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Incremental reply reader. Keeps partial lines and open multi-line replies
/// between chunks.
#[derive(Debug, Default)]
pub struct ReplyParser {
    partial: Vec<u8>,
    multi: Option<(u16, Vec<String>)>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk, returning every reply it completes.
    ///
    /// Records are unique by code within a chunk; the first one wins.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<ReplyRecord> {
        self.partial.extend_from_slice(chunk.as_ref());

        let mut out: Vec<ReplyRecord> = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            // decoded per line so a character split across reads survives
            let decoded = String::from_utf8_lossy(&raw);
            let line = decoded.trim_end_matches(|c| c == '\r' || c == '\n');
            if let Some(rec) = self.push_line(line) {
                if out.iter().any(|r| r.code == rec.code) {
                    log::trace!("dropping duplicate {} in chunk", rec.code);
                    continue;
                }
                out.push(rec);
            }
        }
        out
    }

    /// Whether bytes are buffered that have not formed a reply yet.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty() || self.multi.is_some()
    }

    fn push_line(&mut self, line: &str) -> Option<ReplyRecord> {
        let caps = REPLY_LINE.captures(line);

        if let Some((code, lines)) = self.multi.as_mut() {
            let code = *code;
            match caps {
                Some(c) if c[1].parse::<u16>().ok() == Some(code) => {
                    let rest = c.get(3).map_or("", |m| m.as_str()).to_string();
                    lines.push(rest);
                    if c.get(2).map_or(" ", |m| m.as_str()) == "-" {
                        return None;
                    }
                    let body = lines.join("\n");
                    self.multi = None;
                    return Some(ReplyRecord { code, body });
                }
                _ => {
                    lines.push(line.to_string());
                    return None;
                }
            }
        }

        let Some(caps) = caps else {
            if !line.is_empty() {
                log::trace!("dropping line without reply code: {}", line);
            }
            return None;
        };
        let code = caps[1].parse::<u16>().ok()?;
        let rest = caps.get(3).map_or("", |m| m.as_str()).to_string();

        if caps.get(2).map(|m| m.as_str()) == Some("-") {
            self.multi = Some((code, vec![rest]));
            return None;
        }
        Some(ReplyRecord { code, body: rest })
    }
}

/// What a reply means for the command awaiting it.
#[derive(Debug)]
pub enum Transition {
    /// 125/150 for a download-style verb: the payload comes on the data channel.
    AwaitPayload,
    /// Preliminary reply; the command stays on its current reply.
    AwaitNextReply,
    /// 226 for DELE: the file-action reply still follows.
    AwaitFileAction,
    /// The reply completes the command.
    Finish(FtpResult<String>),
}

/// Map a reply record to a transition for `verb`.
pub fn classify(code: u16, body: &str, verb: &str) -> Transition {
    match code {
        125 | 150 if STORE_VERBS.contains(&verb) => Transition::AwaitNextReply,
        125 | 150 => Transition::AwaitPayload,
        100..=199 => Transition::AwaitNextReply,
        257 => Transition::Finish(Ok(quoted_path(body))),
        226 if verb == "DELE" => Transition::AwaitFileAction,
        400..=599 => Transition::Finish(Err(FtpError::from_reply(code, body))),
        _ => Transition::Finish(Ok(body.to_string())),
    }
}

/// Extract the path from a 257 body, `"/a ""b"""` → `/a "b"`.
/// Without quotes the whole body is returned.
pub fn quoted_path(body: &str) -> String {
    let Some(start) = body.find('"') else {
        return body.to_string();
    };
    let mut out = String::new();
    let mut chars = body[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
                continue;
            }
            break;
        }
        out.push(c);
    }
    out
}
