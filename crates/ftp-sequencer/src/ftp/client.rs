//! FTP client handle: owns one control connection and everything built on it.
//!
//! Lifecycle: `connect()` → banner → session driver → USER/PASS →
//! SYST/PWD probing → optional CWD into `base_dir`.
//!
//! The handle is cheap to clone; clones share the same session. Dropping the
//! last clone shuts the session down.

use crate::ftp::command_queue::{CommandSender, Pending};
use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::hooks::HookRegistry;
use crate::ftp::queue::TransferQueue;
use crate::ftp::session::{self, TransferVerbs};
use crate::ftp::transfer::{DataChannelConfig, DataChannelManager};
use crate::ftp::types::*;
use crate::ftp::upload::UploadQueue;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    base_dir: String,
    cwd: String,
    banner: String,
    system_type: Option<String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

pub(crate) struct ClientInner {
    id: String,
    config: FtpConnectionConfig,
    peer: SocketAddr,
    pub(crate) commands: CommandSender,
    pub(crate) data: DataChannelManager,
    hooks: HookRegistry,
    transfer_verbs: TransferVerbs,
    pub(crate) retr: TransferQueue,
    pub(crate) list: TransferQueue,
    pub(crate) nlst: TransferQueue,
    pub(crate) mdtm: TransferQueue,
    pub(crate) size: TransferQueue,
    pub(crate) uploads: UploadQueue,
    state: Mutex<SessionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.commands.shutdown();
    }
}

/// A connected FTP session.
#[derive(Clone)]
pub struct FtpClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for FtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpClient")
            .field("id", &self.inner.id)
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .finish()
    }
}

impl FtpClient {
    /// Establish a new FTP session with the standard payload hooks.
    pub async fn connect(config: FtpConnectionConfig) -> FtpResult<Self> {
        Self::connect_with_hooks(config, HookRegistry::standard()).await
    }

    /// Establish a new FTP session using `hooks` for transfer payloads.
    pub async fn connect_with_hooks(config: FtpConnectionConfig, hooks: HookRegistry) -> FtpResult<Self> {
        config.validate()?;

        let session_id = Uuid::new_v4().to_string();
        let (channel, parser, banner) = connection::connect(&config).await?;
        let peer = channel.peer_addr();
        log::info!(
            "[{}] connected to {}:{}: {} {}",
            session_id,
            config.host,
            config.port,
            banner.code,
            banner.body
        );

        let transfer_verbs: TransferVerbs = Arc::new(RwLock::new(HashSet::new()));
        let (commands, driver) = session::start(session_id.clone(), channel, parser, transfer_verbs.clone());
        let data = DataChannelManager::new(DataChannelConfig::from(&config));

        let queue = |verb: &str| {
            TransferQueue::create(verb, commands.clone(), data.clone(), peer, &hooks, &transfer_verbs)
        };
        let (retr, list, nlst, mdtm, size) = (
            queue("RETR"),
            queue("LIST"),
            queue("NLST"),
            queue("MDTM"),
            queue("SIZE"),
        );
        let uploads = UploadQueue::new(commands.clone(), data.clone(), peer);

        let now = Utc::now();
        let client = Self {
            inner: Arc::new(ClientInner {
                id: session_id.clone(),
                config,
                peer,
                commands,
                data,
                hooks,
                transfer_verbs,
                retr,
                list,
                nlst,
                mdtm,
                size,
                uploads,
                state: Mutex::new(SessionState {
                    base_dir: "/".into(),
                    cwd: "/".into(),
                    banner: banner.body,
                    system_type: None,
                    connected_at: now,
                    last_activity: now,
                }),
                driver: Mutex::new(Some(driver)),
            }),
        };

        client.login().await.map_err(|e| e.with_session(&session_id))?;

        // ── SYST ─────────────────────────────────────────────────
        match client.info().await {
            Ok(system) => client.state().system_type = Some(system),
            Err(e) => log::debug!("[{}] SYST failed: {}", session_id, e),
        }

        // ── PWD ──────────────────────────────────────────────────
        let home = client.getcwd().await.unwrap_or_else(|_| "/".into());
        client.state().base_dir = home;

        // ── Initial CWD ──────────────────────────────────────────
        if let Some(dir) = client.inner.config.base_dir.clone() {
            client.chdir(&dir).await?;
            let cwd = client.state().cwd.clone();
            client.state().base_dir = cwd;
        }

        Ok(client)
    }

    async fn login(&self) -> FtpResult<()> {
        let cfg = &self.inner.config;
        let user = self.user(&cfg.user).await?;
        match user.code {
            331 => {
                let pass = self.pass(&cfg.pass).await?;
                if !pass.is_completion() {
                    return Err(FtpError::auth_failed(format!("Login failed: {} {}", pass.code, pass.text))
                        .with_code(pass.code));
                }
            }
            c if (200..300).contains(&c) => {}
            c => {
                return Err(FtpError::auth_failed(format!("USER rejected: {} {}", c, user.text)).with_code(c));
            }
        }
        log::info!("[{}] logged in as {}", self.inner.id, cfg.user);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.inner.config
    }

    /// Server end of the control connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn commands(&self) -> &CommandSender {
        &self.inner.commands
    }

    pub fn data_channel(&self) -> &DataChannelManager {
        &self.inner.data
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn uploads(&self) -> &UploadQueue {
        &self.inner.uploads
    }

    /// The built-in queue for a download-style verb.
    pub fn queue(&self, verb: &str) -> Option<&TransferQueue> {
        let inner = &self.inner;
        match verb.to_ascii_uppercase().as_str() {
            "RETR" => Some(&inner.retr),
            "LIST" => Some(&inner.list),
            "NLST" => Some(&inner.nlst),
            "MDTM" => Some(&inner.mdtm),
            "SIZE" => Some(&inner.size),
            _ => None,
        }
    }

    /// Build an extra queue for another download-style verb on this session.
    pub fn create_queue(&self, verb: &str) -> TransferQueue {
        TransferQueue::create(
            verb,
            self.inner.commands.clone(),
            self.inner.data.clone(),
            self.inner.peer,
            &self.inner.hooks,
            &self.inner.transfer_verbs,
        )
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    pub fn session_info(&self) -> FtpSessionInfo {
        let st = self.state().clone();
        let cfg = &self.inner.config;
        FtpSessionInfo {
            id: self.inner.id.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            connected: self.is_connected(),
            base_dir: st.base_dir,
            current_directory: st.cwd,
            server_banner: Some(st.banner),
            system_type: st.system_type,
            connected_at: st.connected_at,
            last_activity: st.last_activity,
            label: cfg.label.clone(),
        }
    }

    /// Directory recorded at login, after any configured `base_dir`.
    pub fn base_dir(&self) -> String {
        self.state().base_dir.clone()
    }

    /// Last directory reported by PWD or CWD.
    pub fn cwd(&self) -> String {
        self.state().cwd.clone()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_cwd(&self, cwd: &str) {
        self.state().cwd = cwd.to_string();
    }

    pub(crate) fn touch(&self) {
        self.state().last_activity = Utc::now();
    }

    /// Queue a command and wait for its reply.
    pub(crate) async fn exec(&self, cmd: impl Into<String>) -> FtpResult<Reply> {
        let reply = self.inner.commands.submit(cmd).await;
        self.touch();
        reply
    }

    // ─── Pass-through commands ───────────────────────────────────

    pub async fn user(&self, user: &str) -> FtpResult<Reply> {
        self.exec(format!("USER {}", user)).await
    }

    pub async fn pass(&self, pass: &str) -> FtpResult<Reply> {
        self.exec(format!("PASS {}", pass)).await
    }

    /// `NOOP`.
    pub async fn ping(&self) -> FtpResult<Reply> {
        self.exec("NOOP").await
    }

    pub async fn stat(&self) -> FtpResult<Reply> {
        self.exec("STAT").await
    }

    /// `SYST`, returning the system type text.
    pub async fn info(&self) -> FtpResult<String> {
        Ok(self.exec("SYST").await?.text)
    }

    /// Queue an arbitrary command line.
    pub fn run(&self, command: impl Into<String>) -> Pending<Reply> {
        self.inner.commands.submit(command)
    }

    /// Write an arbitrary command line immediately, ahead of the queue.
    pub fn raw(&self, command: impl Into<String>) -> Pending<Reply> {
        self.inner.commands.run_now(command)
    }

    /// Send `ABOR` and force the data channel closed.
    ///
    /// Returns whether a data transfer was interrupted.
    pub async fn abort(&self) -> FtpResult<bool> {
        let interrupted = self.inner.data.abort();
        let reply = self.raw("ABOR").await?;
        log::info!("[{}] ABOR: {} {}", self.inner.id, reply.code, reply.text);
        Ok(interrupted)
    }

    /// Send `QUIT` and close the session.
    pub async fn quit(&self) -> FtpResult<Reply> {
        let reply = self.exec("QUIT").await;
        self.inner.commands.shutdown();
        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        reply
    }
}
