//! TCP transport: establishes the FTP control connection.
//!
//! Handles the plain-TCP connect, the timeout policy from
//! `FtpConnectionConfig` and reading the welcome banner.

use crate::ftp::dispatcher::ReplyParser;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::ControlChannel;
use crate::ftp::types::{FtpConnectionConfig, ReplyRecord};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Establish the control connection and read the welcome banner.
///
/// The returned parser carries any bytes the server sent after the banner.
pub async fn connect(
    config: &FtpConnectionConfig,
) -> FtpResult<(ControlChannel, ReplyParser, ReplyRecord)> {
    let addr = format!("{}:{}", config.host, config.port);
    let dur = Duration::from_secs(config.connect_timeout_sec);

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();

    let mut channel = ControlChannel::from_tcp(tcp)?;
    let mut parser = ReplyParser::new();
    let banner = timeout(dur, read_banner(&mut channel, &mut parser))
        .await
        .map_err(|_| FtpError::timeout(format!("no welcome banner from {}", addr)))??;

    Ok((channel, parser, banner))
}

/// Read until the server's first non-preliminary reply (a `120` may precede `220`).
async fn read_banner(channel: &mut ControlChannel, parser: &mut ReplyParser) -> FtpResult<ReplyRecord> {
    loop {
        let chunk = channel
            .reader
            .read_chunk()
            .await?
            .ok_or_else(|| FtpError::connection_failed("server closed before sending a banner"))?;

        for rec in parser.feed(&chunk) {
            if rec.code < 200 {
                log::debug!("preliminary banner {}: {}", rec.code, rec.body);
                continue;
            }
            if rec.code >= 400 {
                return Err(FtpError::from_reply(rec.code, &rec.body));
            }
            return Ok(rec);
        }
    }
}
