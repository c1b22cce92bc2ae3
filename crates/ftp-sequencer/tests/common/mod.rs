//! In-process FTP server for integration tests.
//!
//! Serves an in-memory filesystem over a real TCP control connection with
//! passive data connections, and records every command line it receives.

#![allow(dead_code)]

use ftp_sequencer::FtpConnectionConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const USER: &str = "bob";
pub const PASS: &str = "secret";
pub const HOME: &str = "/home/bob";
pub const MDTM_STAMP: &str = "20140615091813";

#[derive(Debug, Default)]
pub struct MockFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub log: Vec<String>,
}

impl MockFs {
    fn children(&self, dir: &str) -> (Vec<String>, Vec<(String, usize)>) {
        let dirs = self
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && parent(d) == dir)
            .map(|d| basename(d).to_string())
            .collect();
        let files = self
            .files
            .iter()
            .filter(|(f, _)| parent(f) == dir)
            .map(|(f, data)| (basename(f).to_string(), data.len()))
            .collect();
        (dirs, files)
    }

    fn is_empty_dir(&self, dir: &str) -> bool {
        let (dirs, files) = self.children(dir);
        dirs.is_empty() && files.is_empty()
    }
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((p, _)) => p,
        None => "/",
    }
}

fn basename(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, b)| b)
}

fn resolve(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else if cwd == "/" {
        format!("/{}", arg)
    } else {
        format!("{}/{}", cwd, arg)
    };
    let trimmed = joined.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub fs: Arc<Mutex<MockFs>>,
    task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut fs = MockFs::default();
        for d in ["/", "/home", HOME, "/pub"] {
            fs.dirs.insert(d.to_string());
        }
        let fs = Arc::new(Mutex::new(fs));

        let shared = fs.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { addr, fs, task }
    }

    pub fn config(&self) -> FtpConnectionConfig {
        let mut cfg = FtpConnectionConfig::new("127.0.0.1", self.addr.port());
        cfg.user = USER.into();
        cfg.pass = PASS.into();
        cfg.connect_timeout_sec = 5;
        cfg.data_timeout_sec = 5;
        cfg
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.fs.lock().unwrap().files.insert(path.to_string(), data.to_vec());
    }

    pub fn add_dir(&self, path: &str) {
        self.fs.lock().unwrap().dirs.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.fs.lock().unwrap().dirs.contains(path)
    }

    /// Every command line received so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.fs.lock().unwrap().log.clone()
    }

    /// Position of the first logged line equal to `line`.
    pub fn position(&self, line: &str) -> Option<usize> {
        self.log().iter().position(|l| l == line)
    }

    /// Positions of every logged line starting with `prefix`.
    pub fn positions(&self, prefix: &str) -> Vec<usize> {
        self.log()
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with(prefix))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Fail the test instead of hanging when `fut` stalls.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("operation timed out")
}

async fn reply(wr: &mut OwnedWriteHalf, line: &str) {
    let _ = wr.write_all(format!("{}\r\n", line).as_bytes()).await;
}

async fn take_data(data: &mut Option<JoinHandle<std::io::Result<TcpStream>>>) -> Option<TcpStream> {
    match data.take() {
        Some(handle) => handle.await.ok().and_then(|r| r.ok()),
        None => None,
    }
}

async fn serve(stream: TcpStream, fs: Arc<Mutex<MockFs>>) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut cwd = HOME.to_string();
    let mut data: Option<JoinHandle<std::io::Result<TcpStream>>> = None;
    let mut rename_from: Option<String> = None;

    reply(&mut wr, "220 mock FTP ready").await;

    while let Ok(Some(line)) = lines.next_line().await {
        fs.lock().unwrap().log.push(line.clone());
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };
        let path = resolve(&cwd, &arg);

        match verb.as_str() {
            "USER" => reply(&mut wr, "331 Please specify the password.").await,
            "PASS" if arg == PASS => reply(&mut wr, "230 Login successful.").await,
            "PASS" => reply(&mut wr, "530 Login incorrect.").await,
            "SYST" => reply(&mut wr, "215 UNIX Type: L8").await,
            "NOOP" => reply(&mut wr, "200 NOOP ok.").await,
            "STAT" => {
                reply(&mut wr, "211-FTP server status:").await;
                reply(&mut wr, "     Logged in as bob").await;
                reply(&mut wr, "211 End of status").await;
            }
            "PWD" => reply(&mut wr, &format!("257 \"{}\" is the current directory", cwd)).await,
            "CWD" => {
                if fs.lock().unwrap().dirs.contains(&path) {
                    cwd = path;
                    reply(&mut wr, &format!("250 OK. Current directory is {}", cwd)).await;
                } else {
                    reply(&mut wr, "550 Failed to change directory.").await;
                }
            }
            "MKD" => {
                fs.lock().unwrap().dirs.insert(path.clone());
                reply(&mut wr, &format!("257 \"{}\" created", path)).await;
            }
            "RMD" => {
                let res = {
                    let mut fs = fs.lock().unwrap();
                    if !fs.dirs.contains(&path) {
                        "550 No such directory."
                    } else if !fs.is_empty_dir(&path) {
                        "550 Directory not empty."
                    } else {
                        fs.dirs.remove(&path);
                        "250 Remove directory operation successful."
                    }
                };
                reply(&mut wr, res).await;
            }
            "DELE" => {
                let removed = fs.lock().unwrap().files.remove(&path).is_some();
                if removed {
                    reply(&mut wr, &format!("250 Deleted {}", arg)).await;
                } else {
                    reply(&mut wr, "550 No such file.").await;
                }
            }
            "RNFR" => {
                let exists = {
                    let fs = fs.lock().unwrap();
                    fs.files.contains_key(&path) || fs.dirs.contains(&path)
                };
                if exists {
                    rename_from = Some(path);
                    reply(&mut wr, "350 Ready for RNTO.").await;
                } else {
                    reply(&mut wr, "550 RNFR command failed.").await;
                }
            }
            "RNTO" => match rename_from.take() {
                Some(from) => {
                    {
                        let mut fs = fs.lock().unwrap();
                        if let Some(bytes) = fs.files.remove(&from) {
                            fs.files.insert(path, bytes);
                        } else if fs.dirs.remove(&from) {
                            fs.dirs.insert(path);
                        }
                    }
                    reply(&mut wr, "250 Rename successful.").await;
                }
                None => reply(&mut wr, "503 RNFR required first.").await,
            },
            "SIZE" => {
                let size = fs.lock().unwrap().files.get(&path).map(Vec::len);
                match size {
                    Some(n) => reply(&mut wr, &format!("213 {}", n)).await,
                    None => reply(&mut wr, "550 Could not get file size.").await,
                }
            }
            "MDTM" => {
                let exists = fs.lock().unwrap().files.contains_key(&path);
                if exists {
                    reply(&mut wr, &format!("213 {}", MDTM_STAMP)).await;
                } else {
                    reply(&mut wr, "550 Could not get file modification time.").await;
                }
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data = Some(tokio::spawn(async move {
                    listener.accept().await.map(|(s, _)| s)
                }));
                reply(
                    &mut wr,
                    &format!("227 Entering Passive Mode (127,0,0,1,{},{})", port / 256, port % 256),
                )
                .await;
            }
            "RETR" => {
                let bytes = fs.lock().unwrap().files.get(&path).cloned();
                let Some(bytes) = bytes else {
                    data.take();
                    reply(&mut wr, "550 Failed to open file.").await;
                    continue;
                };
                let Some(mut stream) = take_data(&mut data).await else {
                    reply(&mut wr, "425 Use PASV first.").await;
                    continue;
                };
                reply(&mut wr, "150 Opening BINARY mode data connection.").await;
                let sent = stream.write_all(&bytes).await.and(stream.shutdown().await);
                drop(stream);
                match sent {
                    Ok(()) => reply(&mut wr, "226 Transfer complete.").await,
                    Err(_) => reply(&mut wr, "426 Connection closed; transfer aborted.").await,
                }
            }
            "LIST" | "NLST" => {
                let dir = if arg.is_empty() { cwd.clone() } else { path };
                let listing = {
                    let fs = fs.lock().unwrap();
                    if !fs.dirs.contains(&dir) {
                        None
                    } else {
                        let (dirs, files) = fs.children(&dir);
                        let mut out = String::new();
                        if verb == "LIST" {
                            out.push_str(&format!("total {}\r\n", dirs.len() + files.len()));
                            for d in &dirs {
                                out.push_str(&format!("drwxr-xr-x 2 bob staff 4096 Jun 12 12:43 {}\r\n", d));
                            }
                            for (f, len) in &files {
                                out.push_str(&format!("-rw-r--r-- 1 bob staff {} Jun 12 12:43 {}\r\n", len, f));
                            }
                        } else {
                            out.push_str(".\r\n..\r\n");
                            for d in &dirs {
                                out.push_str(&format!("{}\r\n", d));
                            }
                            for (f, _) in &files {
                                out.push_str(&format!("{}\r\n", f));
                            }
                        }
                        Some(out)
                    }
                };
                let Some(listing) = listing else {
                    data.take();
                    reply(&mut wr, "550 No such directory.").await;
                    continue;
                };
                let Some(mut stream) = take_data(&mut data).await else {
                    reply(&mut wr, "425 Use PASV first.").await;
                    continue;
                };
                reply(&mut wr, "150 Here comes the directory listing.").await;
                let _ = stream.write_all(listing.as_bytes()).await;
                let _ = stream.shutdown().await;
                drop(stream);
                reply(&mut wr, "226 Directory send OK.").await;
            }
            "STOR" => {
                let Some(mut stream) = take_data(&mut data).await else {
                    reply(&mut wr, "425 Use PASV first.").await;
                    continue;
                };
                reply(&mut wr, "150 Ok to send data.").await;
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                fs.lock().unwrap().files.insert(path, buf);
                reply(&mut wr, "226 Transfer complete.").await;
            }
            "ABOR" => {
                data.take();
                reply(&mut wr, "226 ABOR command successful.").await;
            }
            "QUIT" => {
                reply(&mut wr, "221 Goodbye.").await;
                break;
            }
            // drops the control connection without answering
            "KILL" => break,
            _ => reply(&mut wr, "502 Command not implemented.").await,
        }
    }
}
