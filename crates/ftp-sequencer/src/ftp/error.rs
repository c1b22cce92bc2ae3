//! Error type shared by every layer of the client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// Reply code that produced the error, when it came from the server.
    pub code: Option<u16>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FtpErrorKind {
    /// TCP connect or banner failure.
    ConnectionFailed,
    /// USER/PASS refused.
    AuthFailed,
    /// 4xx/5xx with no more specific meaning.
    CommandRejected,
    /// PASV negotiation or the data socket failed.
    DataChannelFailed,
    /// The server reported the transfer itself as failed.
    TransferFailed,
    /// A reply or payload could not be understood.
    ProtocolError,
    /// Local file or socket I/O.
    IoError,
    Timeout,
    /// The control connection is gone; nothing more will run on it.
    Disconnected,
    PermissionDenied,
    NotFound,
    QuotaExceeded,
    /// Interrupted by `abort()`.
    Aborted,
    /// The session was shut down while the operation was outstanding.
    Cancelled,
    InvalidConfig,
    Unknown,
}

pub type FtpResult<T> = Result<T, FtpError>;

/// Reply text hints that refine a 450/550.
const REPLY_HINTS: [(&str, FtpErrorKind); 5] = [
    ("permission", FtpErrorKind::PermissionDenied),
    ("denied", FtpErrorKind::PermissionDenied),
    ("not found", FtpErrorKind::NotFound),
    ("no such", FtpErrorKind::NotFound),
    ("quota", FtpErrorKind::QuotaExceeded),
];

impl FtpErrorKind {
    /// Kind for a failure reply, looking at the text where the code alone
    /// is ambiguous.
    pub fn for_reply(code: u16, text: &str) -> Self {
        match code {
            421 => Self::Disconnected,
            425 | 426 => Self::DataChannelFailed,
            430 | 530 => Self::AuthFailed,
            451 | 452 | 552 => Self::TransferFailed,
            450 | 550 => {
                let lower = text.to_lowercase();
                REPLY_HINTS
                    .iter()
                    .find(|(needle, _)| lower.contains(needle))
                    .map_or(Self::CommandRejected, |(_, kind)| *kind)
            }
            400..=599 => Self::CommandRejected,
            _ => Self::Unknown,
        }
    }
}

macro_rules! kind_constructors {
    ($($name:ident => $kind:ident),* $(,)?) => {
        $(
            pub fn $name(msg: impl Into<String>) -> Self {
                Self::new(FtpErrorKind::$kind, msg)
            }
        )*
    };
}

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            session_id: None,
        }
    }

    kind_constructors! {
        connection_failed => ConnectionFailed,
        auth_failed => AuthFailed,
        data_channel => DataChannelFailed,
        protocol_error => ProtocolError,
        io_error => IoError,
        timeout => Timeout,
        disconnected => Disconnected,
        aborted => Aborted,
        cancelled => Cancelled,
        invalid_config => InvalidConfig,
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Tag with the session id unless one is already set.
    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        if self.session_id.is_none() {
            self.session_id = Some(id.into());
        }
        self
    }

    /// Error for a failure reply; `text` is the reply body without its code.
    pub fn from_reply(code: u16, text: &str) -> Self {
        Self::new(FtpErrorKind::for_reply(code, text), text).with_code(code)
    }

    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        self.kind == FtpErrorKind::Disconnected
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message),
            None => write!(f, "[FTP {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(e.to_string()),
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for FtpError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_config(format!("config JSON: {}", e))
    }
}

impl From<url::ParseError> for FtpError {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_config(format!("config URL: {}", e))
    }
}
