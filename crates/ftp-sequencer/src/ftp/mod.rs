//! FTP client (RFC 959 subset, passive mode only).
//!
//! Architecture:
//! - `types`: data structures, config
//! - `error`: FTP-specific error type
//! - `protocol`: control-channel transport
//! - `connection`: TCP connect and banner
//! - `dispatcher`: reply parsing and classification
//! - `command_queue`: FIFO command queue and submission handle
//! - `session`: the driver task that owns protocol state
//! - `transfer`: passive data channel (PASV) and abort
//! - `queue`: per-verb download queues
//! - `upload`: the STOR queue
//! - `hooks`: per-verb payload transforms
//! - `parser`: Unix LIST line parsing
//! - `client`: the client handle, login, pass-through commands
//! - `directory`: mkdir, rmdir, cwd, rename, delete
//! - `file_ops`: get, save, ls, mtime, size, put

pub mod types;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod dispatcher;
pub mod command_queue;
pub mod session;
pub mod transfer;
pub mod queue;
pub mod upload;
pub mod hooks;
pub mod parser;
pub mod client;
pub mod directory;
pub mod file_ops;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use client::FtpClient;
pub use command_queue::{CommandSender, Pending};
pub use hooks::HookRegistry;
pub use queue::TransferQueue;
pub use transfer::DataChannelManager;
pub use upload::UploadQueue;
