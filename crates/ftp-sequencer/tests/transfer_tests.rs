mod common;

use common::{within, MockServer, HOME};
use ftp_sequencer::{DataConnectionState, FtpClient, FtpErrorKind, HookRegistry, QueueState, TransferOutput};

async fn connected(server: &MockServer) -> FtpClient {
    within(FtpClient::connect(server.config())).await.unwrap()
}

#[tokio::test]
async fn test_get_downloads_file() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", b"hello world\n");
    let client = connected(&server).await;

    let bytes = within(client.get("a.txt")).await.unwrap();
    assert_eq!(bytes, b"hello world\n");

    let log = server.log();
    let retr = server.position("RETR a.txt").unwrap();
    assert!(log[retr - 1].starts_with("PASV"));
}

#[tokio::test]
async fn test_get_missing_file_fails_and_queue_continues() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", b"abc");
    let client = connected(&server).await;

    let (missing, present) = within(async { tokio::join!(client.get("nope.txt"), client.get("a.txt")) }).await;
    assert_eq!(missing.unwrap_err().code, Some(550));
    assert_eq!(present.unwrap(), b"abc");
}

#[tokio::test]
async fn test_save_writes_local_file() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/report.csv", b"a,b\n1,2\n");
    let client = connected(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("report.csv");
    let local_str = local.to_str().unwrap();

    let saved = within(client.save(("report.csv", local_str))).await.unwrap();
    assert_eq!(saved, local_str);
    assert_eq!(std::fs::read(&local).unwrap(), b"a,b\n1,2\n");
}

#[tokio::test]
async fn test_ls_parses_listing() {
    let server = MockServer::start().await;
    server.add_dir("/home/bob/docs");
    server.add_file("/home/bob/a.txt", b"12345");
    let client = connected(&server).await;

    let entries = within(client.ls("")).await.unwrap();
    assert_eq!(entries.len(), 2);

    let docs = entries.iter().find(|e| e.filename == "docs").unwrap();
    assert!(docs.is_directory);
    assert_eq!(docs.permissions, 755);

    let file = entries.iter().find(|e| e.filename == "a.txt").unwrap();
    assert!(file.is_file);
    assert_eq!(file.size, 5);
    assert_eq!(file.owner, "bob");
    assert_eq!(file.group, "staff");

    assert!(server.position("LIST").is_some());
}

#[tokio::test]
async fn test_lsnames_skips_dot_entries() {
    let server = MockServer::start().await;
    server.add_dir("/pub/sub");
    server.add_file("/pub/x.bin", b"x");
    let client = connected(&server).await;

    let mut names = within(client.lsnames("/pub")).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["sub", "x.bin"]);
}

#[tokio::test]
async fn test_filemtime_and_size() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", &[0u8; 4096]);
    let client = connected(&server).await;

    assert_eq!(within(client.filemtime("a.txt")).await.unwrap(), 1_402_823_893_000);
    assert_eq!(within(client.size("a.txt")).await.unwrap(), 4096);

    let err = within(client.size("missing")).await.unwrap_err();
    assert_eq!(err.code, Some(550));
}

#[tokio::test]
async fn test_transfers_on_different_queues_never_overlap() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", b"abc");
    let client = connected(&server).await;

    let (get, ls, size, mtime, names) = within(async {
        tokio::join!(
            client.get("a.txt"),
            client.ls(""),
            client.size("a.txt"),
            client.filemtime("a.txt"),
            client.lsnames("")
        )
    })
    .await;
    assert_eq!(get.unwrap(), b"abc");
    assert_eq!(ls.unwrap().len(), 1);
    assert_eq!(size.unwrap(), 3);
    assert_eq!(mtime.unwrap(), 1_402_823_893_000);
    assert_eq!(names.unwrap(), vec!["a.txt"]);

    // every transfer verb directly follows its own PASV
    let log = server.log();
    let transfers: Vec<usize> = ["RETR", "LIST", "SIZE", "MDTM", "NLST"]
        .iter()
        .flat_map(|v| server.positions(v))
        .collect();
    assert_eq!(transfers.len(), 5);
    for idx in transfers {
        assert!(log[idx - 1].starts_with("PASV"), "{} not preceded by PASV", log[idx]);
    }
    assert_eq!(server.positions("PASV").len(), 5);
}

#[tokio::test]
async fn test_queue_returns_to_idle() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", b"abc");
    let client = connected(&server).await;

    let queue = client.queue("retr").unwrap();
    assert_eq!(queue.verb(), "RETR");
    let mut state = queue.subscribe();

    within(client.get("a.txt")).await.unwrap();
    within(async {
        while *state.borrow_and_update() != QueueState::Idle {
            state.changed().await.unwrap();
        }
    })
    .await;
    assert!(queue.is_empty());
    assert!(client.queue("STOR").is_none());
}

#[tokio::test]
async fn test_custom_hook_transforms_payload() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", b"shout");

    let mut hooks = HookRegistry::standard();
    hooks
        .register("RETR", |bytes: &[u8]| Ok(TransferOutput::Raw(bytes.to_ascii_uppercase())))
        .unwrap();
    let dup = hooks.register("list", |_: &[u8]| Ok(TransferOutput::Raw(Vec::new())));
    assert_eq!(dup.unwrap_err().kind, FtpErrorKind::InvalidConfig);

    let client = within(FtpClient::connect_with_hooks(server.config(), hooks))
        .await
        .unwrap();
    assert_eq!(within(client.get("a.txt")).await.unwrap(), b"SHOUT");
}

#[tokio::test]
async fn test_extra_queue_for_unhooked_verb_passes_bytes_through() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/a.txt", b"raw bytes");
    let client = connected(&server).await;

    let queue = client.create_queue("retr");
    let out = within(queue.enqueue(&format!("{}/a.txt", HOME))).await.unwrap();
    assert_eq!(out, TransferOutput::Raw(b"raw bytes".to_vec()));
}

#[tokio::test]
async fn test_abort_interrupts_download_and_queue_recovers() {
    let server = MockServer::start().await;
    server.add_file("/home/bob/big.bin", &vec![0x5a; 32 * 1024 * 1024]);
    server.add_file("/home/bob/small.txt", b"after abort");
    let client = connected(&server).await;

    let mut data_state = client.data_channel().subscribe();
    let download = tokio::spawn({
        let client = client.clone();
        async move { client.get("big.bin").await }
    });

    within(async {
        while *data_state.borrow_and_update() != DataConnectionState::Open {
            data_state.changed().await.unwrap();
        }
    })
    .await;
    assert!(within(client.abort()).await.unwrap());

    let err = within(download).await.unwrap().unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::Aborted);
    assert!(server.position("ABOR").is_some());

    assert_eq!(within(client.get("small.txt")).await.unwrap(), b"after abort");
    within(async {
        while *data_state.borrow_and_update() != DataConnectionState::Closed {
            data_state.changed().await.unwrap();
        }
    })
    .await;
    let retr = client.queue("RETR").unwrap();
    within(async {
        let mut state = retr.subscribe();
        while *state.borrow_and_update() != QueueState::Idle {
            state.changed().await.unwrap();
        }
    })
    .await;
}
