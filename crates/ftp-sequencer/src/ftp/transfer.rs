//! Passive-mode data channel.
//!
//! [`DataChannelManager`] negotiates `PASV` through the command queue, opens
//! the data socket and tracks its state. Only one [`DataConnection`] exists
//! at a time; it holds the manager's single lease until dropped.

use crate::ftp::command_queue::{CommandSender, PayloadRx};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{DataConnectionState, FtpConnectionConfig};
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_REPLY: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
}

/// Data-channel settings taken from the connection config.
#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub address_hint: bool,
    pub pasv_port: Option<u16>,
    pub timeout: Duration,
}

impl From<&FtpConnectionConfig> for DataChannelConfig {
    fn from(cfg: &FtpConnectionConfig) -> Self {
        Self {
            address_hint: cfg.pasv_address_hint,
            pasv_port: cfg.pasv_port,
            timeout: Duration::from_secs(cfg.data_timeout_sec),
        }
    }
}

struct Shared {
    config: DataChannelConfig,
    slot: Arc<Semaphore>,
    state: watch::Sender<DataConnectionState>,
    close_tx: Mutex<Option<watch::Sender<bool>>>,
    aborted: AtomicBool,
    active: AtomicBool,
}

/// Owner of the single passive data connection.
#[derive(Clone)]
pub struct DataChannelManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DataChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelManager")
            .field("state", &self.state())
            .field("aborted", &self.shared.aborted.load(Ordering::SeqCst))
            .field("active", &self.shared.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl DataChannelManager {
    pub fn new(config: DataChannelConfig) -> Self {
        let (state, _) = watch::channel(DataConnectionState::Closed);
        Self {
            shared: Arc::new(Shared {
                config,
                slot: Arc::new(Semaphore::new(1)),
                state,
                close_tx: Mutex::new(None),
                aborted: AtomicBool::new(false),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Wait for the lease, negotiate `PASV` and connect.
    ///
    /// `peer` is the server end of the control connection.
    pub async fn open(&self, commands: &CommandSender, peer: SocketAddr) -> FtpResult<DataConnection> {
        let permit = self
            .shared
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FtpError::data_channel("data channel manager closed"))?;

        self.set_state(DataConnectionState::Connecting);
        let stream = match self.negotiate(commands, peer).await {
            Ok(s) => s,
            Err(e) => {
                self.set_state(DataConnectionState::Closed);
                return Err(e);
            }
        };

        if self.is_aborted() {
            self.set_state(DataConnectionState::Closed);
            return Err(FtpError::aborted("data channel aborted while connecting"));
        }

        let (close_tx, close_rx) = watch::channel(false);
        if let Ok(mut slot) = self.shared.close_tx.lock() {
            *slot = Some(close_tx);
        }
        self.set_state(DataConnectionState::Open);
        log::debug!("data connection open to {:?}", stream.peer_addr().ok());

        Ok(DataConnection {
            stream: Some(stream),
            close_rx,
            manager: self.clone(),
            _permit: permit,
        })
    }

    async fn negotiate(&self, commands: &CommandSender, peer: SocketAddr) -> FtpResult<TcpStream> {
        let reply = commands.submit(pasv_command(&peer, self.shared.config.address_hint)).await?;
        let addr = resolve_pasv(&reply.text, peer, self.shared.config.pasv_port)?;

        timeout(self.shared.config.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FtpError::data_channel(format!("PASV data connect to {} timed out", addr)))?
            .map_err(|e| FtpError::data_channel(format!("PASV data connect to {}: {}", addr, e)))
    }

    /// Force the data socket closed and flag the current job as aborted.
    ///
    /// Does nothing when no connection is leased and no upload is active.
    /// Returns whether the abort took effect.
    pub fn abort(&self) -> bool {
        let state = self.state();
        if state == DataConnectionState::Closed && !self.is_active() {
            return false;
        }
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.set_state(DataConnectionState::Aborting);
        if let Ok(slot) = self.shared.close_tx.lock() {
            if let Some(tx) = slot.as_ref() {
                let _ = tx.send(true);
            }
        }
        log::info!("data channel aborted (was {:?})", state);
        true
    }

    /// Consume the abort flag.
    pub fn take_abort(&self) -> bool {
        self.shared.aborted.swap(false, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Mark an upload in progress, so `abort` applies even before `open`.
    pub fn set_active(&self, active: bool) {
        self.shared.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DataConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DataConnectionState> {
        self.shared.state.subscribe()
    }

    fn set_state(&self, state: DataConnectionState) {
        self.shared.state.send_replace(state);
    }

    fn release(&self) {
        if let Ok(mut slot) = self.shared.close_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(true);
            }
        }
        self.set_state(DataConnectionState::Closed);
    }
}

/// The leased data socket. Dropping it closes the socket and frees the lease.
pub struct DataConnection {
    stream: Option<TcpStream>,
    close_rx: watch::Receiver<bool>,
    manager: DataChannelManager,
    _permit: OwnedSemaphorePermit,
}

impl DataConnection {
    /// Collect the payload in the background until EOF or a forced close.
    pub fn start_download(&mut self) -> PayloadRx {
        let (tx, rx) = oneshot::channel();
        let stream = self.stream.take();
        let mut close = self.close_rx.clone();

        tokio::spawn(async move {
            let Some(mut stream) = stream else {
                let _ = tx.send(Err(FtpError::data_channel("data connection already consumed")));
                return;
            };
            let mut buf = Vec::new();
            let res = tokio::select! {
                r = stream.read_to_end(&mut buf) => r.map(|n| {
                    log::trace!("data channel read {} bytes", n);
                }).map_err(FtpError::from),
                _ = wait_closed(&mut close) => {
                    Err(FtpError::aborted("data connection closed before the payload completed"))
                }
            };
            let _ = tx.send(res.map(|_| buf));
        });
        rx
    }

    /// Write the whole payload, then shut the socket down.
    pub async fn send_and_close(&mut self, payload: &[u8]) -> FtpResult<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| FtpError::data_channel("data connection already consumed"))?;
        let mut close = self.close_rx.clone();

        let res = tokio::select! {
            r = async {
                stream.write_all(payload).await?;
                stream.shutdown().await
            } => r.map_err(FtpError::from),
            _ = wait_closed(&mut close) => Err(FtpError::aborted("upload aborted")),
        };
        if res.is_ok() && self.manager.state() == DataConnectionState::Open {
            self.manager.set_state(DataConnectionState::Closing);
        }
        log::trace!("data channel wrote {} bytes: {:?}", payload.len(), res.is_ok());
        res
    }
}

impl Drop for DataConnection {
    fn drop(&mut self) {
        self.manager.release();
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// `PASV`, or `PASV h1,h2,h3,h4` carrying the control peer's IPv4 address.
pub fn pasv_command(peer: &SocketAddr, address_hint: bool) -> String {
    match peer.ip() {
        IpAddr::V4(ip) if address_hint => {
            let [a, b, c, d] = ip.octets();
            format!("PASV {},{},{},{}", a, b, c, d)
        }
        _ => "PASV".to_string(),
    }
}

/// Parse `h1,h2,h3,h4,p1,p2` from a 227 reply body.
pub fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_REPLY
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

/// Where to connect for a 227 reply, applying the fixed port and
/// unspecified-address fallbacks.
pub fn resolve_pasv(text: &str, peer: SocketAddr, pasv_port: Option<u16>) -> FtpResult<SocketAddr> {
    match parse_pasv_reply(text) {
        Ok(addr) => {
            let ip = if addr.ip().is_unspecified() { peer.ip() } else { addr.ip() };
            Ok(SocketAddr::new(ip, pasv_port.unwrap_or(addr.port())))
        }
        Err(e) => match pasv_port {
            Some(port) => {
                log::warn!("{}; using control peer port {}", e, port);
                Ok(SocketAddr::new(peer.ip(), port))
            }
            None => Err(e),
        },
    }
}
