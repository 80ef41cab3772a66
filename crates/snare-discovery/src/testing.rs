//! Loopback stand-in for an interception proxy
//!
//! Serves the bootstrap exchange with scripted behaviour so the prober,
//! the race and the connection state machine can be exercised without a
//! real proxy. Enabled with the `test-support` feature.

use crate::fingerprint::{Certificate, Fingerprint};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A generated certificate and its PEM text
#[derive(Clone)]
pub struct TestCertificate {
    pub pem: String,
    pub certificate: Certificate,
}

impl TestCertificate {
    /// Generate a fresh self-signed certificate
    pub fn generate(name: &str) -> Self {
        let generated = rcgen::generate_simple_self_signed(vec![name.to_string()])
            .expect("certificate generation");
        let pem = generated.cert.pem();
        let certificate = Certificate::from_pem(&pem).expect("generated certificate parses");
        Self { pem, certificate }
    }

    /// Fingerprint of the generated key
    pub fn fingerprint(&self) -> Fingerprint {
        self.certificate.fingerprint()
    }
}

/// How the fake proxy answers
#[derive(Clone, Debug)]
pub enum Behavior {
    /// 200 with `{"certificate": <pem>}`
    Serve(String),
    /// Same as `Serve`, after a delay
    ServeAfter(Duration, String),
    /// Given status with an empty JSON body
    Status(u16),
    /// 200 with the given raw body
    Body(String),
    /// Read the request, never answer
    Stall,
}

/// Fake proxy listening on a loopback address
pub struct FakeProxy {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeProxy {
    /// Listen on `ip:port` (port 0 picks a free one)
    pub async fn spawn(ip: &str, port: u16, behavior: Behavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind((ip, port)).await?;
        let addr = listener.local_addr()?;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let requests = requests.clone();
            let accepted = accepted.clone();
            let closed = closed.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let behavior = behavior.clone();
                    let requests = requests.clone();
                    let closed = closed.clone();
                    tokio::spawn(async move {
                        serve(stream, behavior, requests).await;
                        closed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            accepted,
            closed,
            task,
        })
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening IP as a candidate address string
    pub fn ip(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Request heads received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections the client has closed so far
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until `count` connections have been closed by the client
    pub async fn wait_closed(&self, count: usize, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while self.closed() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A local port with nothing listening on it
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

async fn serve(mut stream: TcpStream, behavior: Behavior, requests: Arc<Mutex<Vec<String>>>) {
    let Some(head) = read_head(&mut stream).await else {
        return;
    };
    if let Ok(mut r) = requests.lock() {
        r.push(head);
    }

    let (status, body) = match behavior {
        Behavior::Serve(pem) => (200, serde_json::json!({ "certificate": pem }).to_string()),
        Behavior::ServeAfter(delay, pem) => {
            tokio::time::sleep(delay).await;
            (200, serde_json::json!({ "certificate": pem }).to_string())
        }
        Behavior::Status(code) => (code, "{}".to_string()),
        Behavior::Body(body) => (200, body),
        Behavior::Stall => {
            // Hold the socket until the client gives up
            let mut buf = [0u8; 64];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            return;
        }
    };

    let response = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    // Wait for the client to hang up
    let mut buf = [0u8; 64];
    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}
