//! # ftp-sequencer
//!
//! FTP client core. Drives the control connection's command/reply cycle
//! and multiplexes a passive data connection for transfers.
//!
//! ## Features
//!
//! - **Command sequencing**: a FIFO queue with one command in flight, plus
//!   run-now bypass and chained commands
//! - **Reply dispatch**: multi-line folding, per-command two-phase waits for
//!   data transfers
//! - **Passive data channel**: a single leased connection with abort support
//! - **Transfer queues**: one per download verb, and one for `STOR`
//! - **Payload hooks**: LIST, NLST, MDTM and SIZE results as typed values

pub mod ftp;

pub use ftp::*;
