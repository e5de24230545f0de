//! Tests for the socket wrapper: range contract, lookahead splicing, close.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tcplink::{ServiceProvider, TcpConnection, TcpError, TcpServer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Provider that captures accepted connections without draining them.
#[derive(Default)]
struct Capture {
    connections: Mutex<Vec<Arc<TcpConnection>>>,
    data_seen: AtomicBool,
}

#[async_trait]
impl ServiceProvider for Capture {
    async fn connected(&self, conn: &Arc<TcpConnection>) {
        self.connections.lock().push(conn.clone());
    }

    async fn data_ready(&self, _conn: &Arc<TcpConnection>) {
        self.data_seen.store(true, Ordering::SeqCst);
    }
}

/// Provider that reads the spliced lookahead byte alone, then the rest of
/// the message through the same `(buffer, offset, count)` contract.
#[derive(Default)]
struct SpliceReader {
    bytes: Mutex<Vec<u8>>,
}

#[async_trait]
impl ServiceProvider for SpliceReader {
    async fn data_ready(&self, conn: &Arc<TcpConnection>) {
        let mut buf = [0u8; 12];
        let len = buf.len();
        let mut total = conn.read(&mut buf, 0, 1).unwrap();
        assert_eq!(total, 1, "the lookahead byte must be immediately readable");
        for _ in 0..100 {
            if total == len {
                break;
            }
            match conn.read(&mut buf, total, len - total).unwrap() {
                0 => tokio::time::sleep(Duration::from_millis(5)).await,
                n => total += n,
            }
        }
        self.bytes.lock().extend_from_slice(&buf[..total]);
    }
}

/// Start a server with the given provider and return it with its port.
async fn start_server(provider: Arc<dyn ServiceProvider>) -> (TcpServer, u16) {
    let server = TcpServer::new(provider, 0);
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

/// Accept one connection from a raw peer and return both ends.
async fn accepted_pair(capture: &Capture, port: u16) -> (TcpStream, Arc<TcpConnection>) {
    let peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    for _ in 0..100 {
        if !capture.connections.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let conn = capture.connections.lock()[0].clone();
    (peer, conn)
}

#[tokio::test]
async fn test_read_range_contract() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;
    let (_peer, conn) = accepted_pair(&capture, port).await;

    let mut empty: [u8; 0] = [];
    assert!(matches!(
        conn.read(&mut empty, 0, 0),
        Err(TcpError::EmptyBuffer)
    ));

    let mut buf = [0u8; 10];
    assert!(matches!(
        conn.read(&mut buf, 10, 0),
        Err(TcpError::OutOfRange { .. })
    ));
    assert!(matches!(
        conn.read(&mut buf, 12, 1),
        Err(TcpError::OutOfRange { .. })
    ));
    assert!(matches!(
        conn.read(&mut buf, 5, 6),
        Err(TcpError::OutOfRange { .. })
    ));
    assert!(matches!(
        conn.read(&mut buf, 0, 11),
        Err(TcpError::OutOfRange { .. })
    ));

    // Valid regions with nothing queued read zero bytes.
    assert_eq!(conn.read(&mut buf, 0, 0).unwrap(), 0);
    assert_eq!(conn.read(&mut buf, 5, 5).unwrap(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_write_range_contract() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;
    let (_peer, conn) = accepted_pair(&capture, port).await;

    let empty: [u8; 0] = [];
    assert!(matches!(
        conn.write(&empty, 0, 0).await,
        Err(TcpError::EmptyBuffer)
    ));

    let buf = [0u8; 10];
    assert!(matches!(
        conn.write(&buf, 10, 0).await,
        Err(TcpError::OutOfRange { .. })
    ));
    assert!(matches!(
        conn.write(&buf, 5, 6).await,
        Err(TcpError::OutOfRange { .. })
    ));
    assert!(matches!(
        conn.write(&buf, 0, 11).await,
        Err(TcpError::OutOfRange { .. })
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_read_write_after_close() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;
    let (_peer, conn) = accepted_pair(&capture, port).await;

    assert!(conn.is_connected());
    conn.close();
    assert!(!conn.is_connected());

    let mut buf = [0u8; 10];
    assert!(matches!(conn.read(&mut buf, 0, 10), Err(TcpError::Closed)));
    assert!(matches!(
        conn.write(&buf, 0, 10).await,
        Err(TcpError::Closed)
    ));

    // Close is idempotent.
    conn.close();
    assert!(matches!(conn.read(&mut buf, 0, 10), Err(TcpError::Closed)));

    server.stop().await;
}

#[tokio::test]
async fn test_lookahead_byte_is_spliced_back() {
    let splice = Arc::new(SpliceReader::default());
    let (server, port) = start_server(splice.clone()).await;

    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    peer.write_all(b"Hello World!").await.unwrap();

    for _ in 0..100 {
        if splice.bytes.lock().len() >= 12 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(&*splice.bytes.lock(), b"Hello World!");

    server.stop().await;
}

#[tokio::test]
async fn test_available_data_counts_lookahead() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;
    let (mut peer, conn) = accepted_pair(&capture, port).await;

    assert_eq!(conn.available_data(), 0);

    // One byte lands in the lookahead slot; the provider does not drain.
    peer.write_all(b"x").await.unwrap();
    for _ in 0..100 {
        if capture.data_seen.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(capture.data_seen.load(Ordering::SeqCst));
    assert_eq!(conn.available_data(), 1);

    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf, 0, 1).unwrap(), 1);
    assert_eq!(buf[0], b'x');
    assert_eq!(conn.available_data(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_write_delivers_exact_bytes() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;
    let (peer, conn) = accepted_pair(&capture, port).await;

    let message = b"0123456789";
    // Write a sub-range: bytes 2..7.
    assert_eq!(conn.write(message, 2, 5).await.unwrap(), 5);

    let mut received = Vec::new();
    for _ in 0..100 {
        peer.readable().await.unwrap();
        let mut buf = [0u8; 16];
        match peer.try_read(&mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => panic!("read failed: {err}"),
        }
        if received.len() >= 5 {
            break;
        }
    }
    assert_eq!(received, b"23456");

    server.stop().await;
}

#[tokio::test]
async fn test_endpoint_addresses() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;
    let (peer, conn) = accepted_pair(&capture, port).await;

    assert_eq!(conn.peer_addr(), peer.local_addr().unwrap());
    assert_eq!(conn.local_addr().port(), port);

    server.stop().await;
}

#[tokio::test]
async fn test_connection_ids_follow_accept_order() {
    let capture = Arc::new(Capture::default());
    let (server, port) = start_server(capture.clone()).await;

    let _peer1 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let _peer2 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    for _ in 0..100 {
        if server.connection_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let ids = server.connections();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
    assert_eq!(ids[0].to_string(), format!("conn-{}", ids[0].as_u64()));

    server.stop().await;
}
