//! Integration tests for the TFTP server and client
//!
//! These start a real server on an ephemeral loopback port and run whole
//! transfers against it, both through the client driver and with hand-built
//! packets on raw sockets.

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use tftp::{
    DataMode, ErrorCode, OptionMap, Packet, Request, RequestKind, ServerConfig, ShutdownFlag,
    TftpClient, TftpServer,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn start_server(root: &Path) -> (SocketAddr, ShutdownFlag) {
    let stop = ShutdownFlag::new();
    let mut server = TftpServer::new(
        ServerConfig {
            port: 0,
            root_dir: root.to_path_buf(),
        },
        stop.clone(),
    );
    server.bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    (addr, stop)
}

fn client_for(addr: SocketAddr) -> TftpClient {
    TftpClient::new("127.0.0.1", addr.port(), ShutdownFlag::new())
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 65507];
    let (len, src) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
    (Packet::parse(&buf[..len]).unwrap(), src)
}

#[tokio::test]
async fn test_download_octet() {
    let root = tempdir().unwrap();
    let content: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.path().join("data.bin"), &content).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("data.bin");
    client_for(addr).download("data.bin", &dest).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn test_download_exact_block_multiple() {
    let root = tempdir().unwrap();
    let content = vec![0xa5u8; 1024];
    std::fs::write(root.path().join("even.bin"), &content).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("even.bin");
    client_for(addr).download("even.bin", &dest).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn test_download_with_negotiated_options() {
    let root = tempdir().unwrap();
    let content: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(root.path().join("big.bin"), &content).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("big.bin");
    client_for(addr)
        .option("blksize", 1024)
        .option("tsize", 0)
        .download("big.bin", &dest)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn test_download_missing_file_cleans_up() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("missing.bin");
    let result = client_for(addr).download("missing.bin", &dest).await;

    assert!(result.is_err());
    // the partially created destination must be gone
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_download_rejects_traversal() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("passwd");
    let result = client_for(addr).download("../../../etc/passwd", &dest).await;

    assert!(result.is_err());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_upload_octet() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let content: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();
    client_for(addr)
        .upload_from(Cursor::new(content.clone()), "upload.bin")
        .await
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("upload.bin")).unwrap(), content);
}

#[tokio::test]
async fn test_upload_empty_file() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    client_for(addr)
        .upload_from(Cursor::new(Vec::new()), "empty.bin")
        .await
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("empty.bin")).unwrap(), b"");
}

#[tokio::test]
async fn test_upload_exact_block_multiple() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let content = vec![0x5au8; 1024];
    client_for(addr)
        .upload_from(Cursor::new(content.clone()), "even.bin")
        .await
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("even.bin")).unwrap(), content);
}

#[tokio::test]
async fn test_upload_existing_file_is_refused() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("taken.bin"), b"already here").unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let result = client_for(addr)
        .upload_from(Cursor::new(b"new data".to_vec()), "taken.bin")
        .await;

    assert!(result.is_err());
    // the original file is untouched
    assert_eq!(std::fs::read(root.path().join("taken.bin")).unwrap(), b"already here");
}

#[tokio::test]
async fn test_netascii_download_round_trip() {
    let root = tempdir().unwrap();
    let text = b"line one\nline two\ncarriage\rreturn\n";
    std::fs::write(root.path().join("text.txt"), text).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("text.txt");
    client_for(addr)
        .mode(DataMode::Netascii)
        .download("text.txt", &dest)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), text);
}

#[tokio::test]
async fn test_netascii_upload_round_trip() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let text = b"alpha\nbeta\n".to_vec();
    client_for(addr)
        .mode(DataMode::Netascii)
        .upload_from(Cursor::new(text.clone()), "notes.txt")
        .await
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("notes.txt")).unwrap(), text);
}

#[tokio::test]
async fn test_stray_tid_gets_error_5_without_disturbing_transfer() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("small.bin"), vec![1u8; 100]).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    // legitimate transfer started by hand
    let legit = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rrq = Packet::Request(Request {
        kind: RequestKind::Read,
        filename: "small.bin".to_string(),
        mode: DataMode::Octet,
        options: OptionMap::new(),
    });
    legit.send_to(&rrq.serialize(), addr).await.unwrap();

    let (packet, transfer_addr) = recv_packet(&legit).await;
    match &packet {
        Packet::Data { block, data } => {
            assert_eq!(*block, 1);
            assert_eq!(data.len(), 100);
        }
        other => panic!("expected DATA, got {:?}", other),
    }
    // the reply must come from an ephemeral endpoint, not the listener
    assert_ne!(transfer_addr.port(), addr.port());

    // an intruder acks from a different port
    let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    intruder
        .send_to(&Packet::Ack { block: 1 }.serialize(), transfer_addr)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&intruder).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTid),
        other => panic!("expected ERROR(5), got {:?}", other),
    }

    // the legitimate client can still finish the transfer
    legit
        .send_to(&Packet::Ack { block: 1 }.serialize(), transfer_addr)
        .await
        .unwrap();
    // no further packet should arrive: the session ended cleanly
    let mut buf = [0u8; 64];
    let extra = timeout(Duration::from_millis(300), legit.recv_from(&mut buf)).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn test_negotiated_timeout_drives_retransmission() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("slow.bin"), vec![2u8; 64]).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let mut options = OptionMap::new();
    options.insert("timeout".to_string(), 1);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rrq = Packet::Request(Request {
        kind: RequestKind::Read,
        filename: "slow.bin".to_string(),
        mode: DataMode::Octet,
        options,
    });
    socket.send_to(&rrq.serialize(), addr).await.unwrap();

    let (oack, transfer_addr) = recv_packet(&socket).await;
    match &oack {
        Packet::Oack { options } => assert_eq!(options.get("timeout"), Some(&1)),
        other => panic!("expected OACK, got {:?}", other),
    }

    // accepting the OACK applies the one-second timeout on the server
    socket
        .send_to(&Packet::Ack { block: 0 }.serialize(), transfer_addr)
        .await
        .unwrap();
    let started = std::time::Instant::now();
    let (first, _) = recv_packet(&socket).await;
    match &first {
        Packet::Data { block, data } => {
            assert_eq!(*block, 1);
            assert_eq!(data.len(), 64);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    // do not acknowledge: the same DATA must be retransmitted after about
    // one second rather than the five-second default
    let (second, _) = recv_packet(&socket).await;
    assert_eq!(second, first);
    assert!(started.elapsed() < Duration::from_secs(4));

    // finish cleanly
    socket
        .send_to(&Packet::Ack { block: 1 }.serialize(), transfer_addr)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_client_recovers_from_lost_ack_after_oack() {
    // hand-rolled server so the client's ACK(0) can be "lost": the OACK is
    // simply sent twice, as a real server's retransmission timer would
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("out.bin");
    let client = TftpClient::new("127.0.0.1", addr.port(), ShutdownFlag::new()).option("blksize", 1024);
    let dest_path = dest.clone();
    let transfer_task = tokio::spawn(async move { client.download("file.bin", &dest_path).await });

    let mut buf = vec![0u8; 65507];
    let (len, client_addr) = timeout(Duration::from_secs(5), listener.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    match Packet::parse(&buf[..len]).unwrap() {
        Packet::Request(req) => assert_eq!(req.options.get("blksize"), Some(&1024)),
        other => panic!("expected RRQ, got {:?}", other),
    }

    // reply from a fresh ephemeral endpoint, as a real server would
    let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut options = OptionMap::new();
    options.insert("blksize".to_string(), 1024);
    let oack = Packet::Oack { options };
    transfer.send_to(&oack.serialize(), client_addr).await.unwrap();

    let (packet, _) = recv_packet(&transfer).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    // the retransmitted OACK must be re-acknowledged, not treated as fatal
    transfer.send_to(&oack.serialize(), client_addr).await.unwrap();
    let (packet, _) = recv_packet(&transfer).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    // the single short block finishes the download
    let content = vec![9u8; 100];
    let data = Packet::Data {
        block: 1,
        data: content.clone(),
    };
    transfer.send_to(&data.serialize(), client_addr).await.unwrap();
    let (packet, _) = recv_packet(&transfer).await;
    assert_eq!(packet, Packet::Ack { block: 1 });

    timeout(Duration::from_secs(5), transfer_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn test_listener_answers_junk_with_wire_error() {
    let root = tempdir().unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // a valid packet that is not a request
    socket
        .send_to(&Packet::Ack { block: 1 }.serialize(), addr)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOperation),
        other => panic!("expected ERROR(4), got {:?}", other),
    }

    // a malformed datagram
    socket.send_to(&[0u8, 1, b'x'], addr).await.unwrap();
    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::IllegalOperation),
        other => panic!("expected ERROR(4), got {:?}", other),
    }
}

#[tokio::test]
async fn test_oack_echoes_tsize() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("sized.bin"), vec![3u8; 3000]).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    let mut options = OptionMap::new();
    options.insert("tsize".to_string(), 0);
    options.insert("blksize".to_string(), 1024);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rrq = Packet::Request(Request {
        kind: RequestKind::Read,
        filename: "sized.bin".to_string(),
        mode: DataMode::Octet,
        options,
    });
    socket.send_to(&rrq.serialize(), addr).await.unwrap();

    let (packet, transfer_addr) = recv_packet(&socket).await;
    match packet {
        Packet::Oack { options } => {
            assert_eq!(options.get("tsize"), Some(&3000));
            assert_eq!(options.get("blksize"), Some(&1024));
        }
        other => panic!("expected OACK, got {:?}", other),
    }

    // accept the options and pull the first block at the bigger size
    socket
        .send_to(&Packet::Ack { block: 0 }.serialize(), transfer_addr)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&socket).await;
    match packet {
        Packet::Data { block, data } => {
            assert_eq!(block, 1);
            assert_eq!(data.len(), 1024);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    let bye = Packet::error(ErrorCode::NotDefined, "test over");
    socket.send_to(&bye.serialize(), transfer_addr).await.unwrap();
}

#[tokio::test]
async fn test_blksize_below_minimum_falls_back_to_default() {
    let root = tempdir().unwrap();
    let content = vec![4u8; 600];
    std::fs::write(root.path().join("fallback.bin"), &content).unwrap();
    let (addr, _stop) = start_server(root.path()).await;

    // blksize 4 is below the RFC 2348 minimum and is dropped at parse time,
    // so the server answers with plain DATA at the default block size
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut options = OptionMap::new();
    options.insert("blksize".to_string(), 4);
    let rrq = Packet::Request(Request {
        kind: RequestKind::Read,
        filename: "fallback.bin".to_string(),
        mode: DataMode::Octet,
        options,
    });
    socket.send_to(&rrq.serialize(), addr).await.unwrap();

    let (packet, transfer_addr) = recv_packet(&socket).await;
    match packet {
        Packet::Data { block, data } => {
            assert_eq!(block, 1);
            assert_eq!(data.len(), 512);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    let bye = Packet::error(ErrorCode::NotDefined, "test over");
    socket.send_to(&bye.serialize(), transfer_addr).await.unwrap();
}
