//! A tiny HTTP/1.1 server that stalls the first response mid-body.
//!
//! wiremock writes whole bodies at once, so a transfer can never be caught
//! in flight. This server sends the first `split` bytes of `body`, then
//! holds the connection open. Later connections get the rest of the body
//! (honouring `Range`) or, in [`ResumeMode::Changed`], a different payload
//! under a new validator.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Answer `Range` requests with `206` and the remaining bytes.
    Honour,
    /// Pretend the source changed: `200`, new `ETag`, `replacement` body.
    Changed,
}

pub struct StallServer {
    pub url: String,
    /// `Range` header of every request after the first, in arrival order.
    pub ranges: Arc<Mutex<Vec<Option<String>>>>,
    /// Fires once the first `split` bytes have been written.
    pub stalled: Option<oneshot::Receiver<()>>,
    release: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StallServer {
    pub async fn start(
        body: Vec<u8>,
        split: usize,
        mode: ResumeMode,
        replacement: Vec<u8>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/unit.mp3", listener.local_addr().unwrap());
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let release = Arc::new(Notify::new());
        let (stalled_tx, stalled_rx) = oneshot::channel();

        let task = {
            let ranges = Arc::clone(&ranges);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                let mut stalled_tx = Some(stalled_tx);
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    if let Some(tx) = stalled_tx.take() {
                        let body = body.clone();
                        let release = Arc::clone(&release);
                        tokio::spawn(async move {
                            serve_stalled(socket, &body, split, tx, release).await;
                        });
                        continue;
                    }
                    let ranges = Arc::clone(&ranges);
                    let body = body.clone();
                    let replacement = replacement.clone();
                    tokio::spawn(async move {
                        serve_follow_up(socket, &body, mode, &replacement, &ranges).await;
                    });
                }
            })
        };

        Self {
            url,
            ranges,
            stalled: Some(stalled_rx),
            release,
            task,
        }
    }

    /// Waits until the first response has stalled.
    pub async fn wait_stalled(&mut self) {
        if let Some(rx) = self.stalled.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for StallServer {
    fn drop(&mut self) {
        self.release.notify_waiters();
        self.task.abort();
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn range_header(request: &str) -> Option<String> {
    request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    })
}

async fn serve_stalled(
    mut socket: TcpStream,
    body: &[u8],
    split: usize,
    stalled: oneshot::Sender<()>,
    release: Arc<Notify>,
) {
    let _ = read_request(&mut socket).await;
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"v1\"\r\nAccept-Ranges: bytes\r\n\r\n",
        body.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(&body[..split]).await;
    let _ = socket.flush().await;
    let _ = stalled.send(());
    release.notified().await;
}

async fn serve_follow_up(
    mut socket: TcpStream,
    body: &[u8],
    mode: ResumeMode,
    replacement: &[u8],
    ranges: &Mutex<Vec<Option<String>>>,
) {
    let request = read_request(&mut socket).await;
    let range = range_header(&request);
    ranges.lock().unwrap().push(range.clone());

    let offset = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());

    let (head, payload) = match (mode, offset) {
        (ResumeMode::Honour, Some(offset)) if offset < body.len() => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nETag: \"v1\"\r\n\r\n",
                body.len() - offset,
                offset,
                body.len() - 1,
                body.len()
            ),
            &body[offset..],
        ),
        (ResumeMode::Changed, _) => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"v2\"\r\nAccept-Ranges: bytes\r\n\r\n",
                replacement.len()
            ),
            replacement,
        ),
        _ => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"v1\"\r\nAccept-Ranges: bytes\r\n\r\n",
                body.len()
            ),
            body,
        ),
    };
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(payload).await;
    let _ = socket.flush().await;
}
