//! In-process HTTP registry double for registry and pull tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    content_type: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    pub fn json(body: &str) -> Self {
        Self::with_type("application/json", body.to_string())
    }

    pub fn with_type(content_type: &str, body: String) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            headers: Vec::new(),
            body: body.into_bytes(),
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some("application/octet-stream".to_string()),
            headers: Vec::new(),
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: String,
    headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
    }
}

type Routes = Arc<Mutex<HashMap<String, MockResponse>>>;
type Requests = Arc<Mutex<Vec<RecordedRequest>>>;

pub struct MockRegistry {
    addr: SocketAddr,
    routes: Routes,
    requests: Requests,
    server: JoinHandle<()>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::default();
        let requests: Requests = Arc::default();

        let server = {
            let routes = routes.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, routes, requests).await;
                    });
                }
            })
        };

        Self {
            addr,
            routes,
            requests,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn route(&self, path: &str, response: MockResponse) {
        self.routes.lock().insert(path.to_string(), response);
    }

    /// Most recent request to `path`.
    pub fn request_for(&self, path: &str) -> Option<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.path == path)
            .cloned()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(mut stream: TcpStream, routes: Routes, requests: Requests) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf).to_string();
    let mut lines = head.split("\r\n");
    let target = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    let headers = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    requests.lock().push(RecordedRequest {
        path: path.clone(),
        query,
        headers,
    });

    let response = routes
        .lock()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| MockResponse::status(404));

    let mut out = format!(
        "HTTP/1.1 {} Mock\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    if let Some(ct) = &response.content_type {
        out.push_str(&format!("Content-Type: {}\r\n", ct));
    }
    for (k, v) in &response.headers {
        out.push_str(&format!("{}: {}\r\n", k, v));
    }
    out.push_str("\r\n");

    stream.write_all(out.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.shutdown().await
}
