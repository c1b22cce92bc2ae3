//! Control-channel transport (RFC 959 §4).
//!
//! Handles:
//! - Writing command lines terminated with `\r\n`
//! - Reading raw reply bytes, handed to the reply parser undecoded
//! - Forwarding inbound chunks to the session driver

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::Event;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_BUF: usize = 8 * 1024;

/// The control connection, before it is split between reader and driver.
pub struct ControlChannel {
    pub reader: ControlReader,
    pub writer: ControlWriter,
    peer: SocketAddr,
}

impl ControlChannel {
    pub fn from_tcp(stream: TcpStream) -> FtpResult<Self> {
        let peer = stream.peer_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: ControlReader { inner: rd },
            writer: ControlWriter { inner: wr },
            peer,
        })
    }

    /// Address of the server end of the control connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_split(self) -> (ControlReader, ControlWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of the control connection.
pub struct ControlReader {
    inner: OwnedReadHalf,
}

impl ControlReader {
    /// Read whatever the server sent next. `None` on EOF.
    pub async fn read_chunk(&mut self) -> FtpResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; READ_BUF];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        log::trace!("<<< {}", String::from_utf8_lossy(&buf).trim_end());
        Ok(Some(buf))
    }

    /// Forward chunks to the driver until EOF or a read error.
    pub fn spawn_forwarder(mut self, events: mpsc::UnboundedSender<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.read_chunk().await {
                    Ok(Some(chunk)) => {
                        if events.send(Event::Inbound(chunk)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = events.send(Event::ControlClosed(None));
                        break;
                    }
                    Err(e) => {
                        let _ = events.send(Event::ControlClosed(Some(e)));
                        break;
                    }
                }
            }
        })
    }
}

/// Write half of the control connection.
pub struct ControlWriter {
    inner: OwnedWriteHalf,
}

impl ControlWriter {
    /// Send one command line (without trailing CRLF, we add it).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        self.inner
            .write_all(line.as_bytes())
            .await
            .map_err(|e| FtpError::disconnected(format!("control write failed: {}", e)))?;
        if cmd.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("PASS ")) {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
