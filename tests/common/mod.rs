use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

use regatta::{Algorithm, Digest};

/// Expected request half of a mock exchange,
///
#[derive(Debug, Default, Clone)]
pub struct ReqEntry {
    pub name: &'static str,
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub absent_headers: Vec<String>,
    pub body: Option<Vec<u8>>,
    pub del_on_use: bool,
}

/// Scripted response half of a mock exchange,
///
/// `declared_length` lets an entry advertise more bytes than it sends, the
/// connection then closes mid-body like a flaky upstream.
///
#[derive(Debug, Default, Clone)]
pub struct RespEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub declared_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReqResp {
    pub req: ReqEntry,
    pub resp: RespEntry,
}

struct MockState {
    entries: Vec<ReqResp>,
    hits: HashMap<&'static str, usize>,
    misses: Vec<String>,
}

/// Table-driven registry double, serves scripted request/response pairs,
///
pub struct MockRegistry {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockRegistry {
    /// Binds a server on an ephemeral port and serves the table,
    ///
    pub async fn serve(entries: Vec<ReqResp>) -> Self {
        let state = Arc::new(Mutex::new(MockState {
            entries,
            hits: HashMap::new(),
            misses: vec![],
        }));

        let shared = state.clone();
        let make_svc = make_service_fn(move |_| {
            let state = shared.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req)))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);

        MockRegistry { addr, state }
    }

    /// Returns `host:port` for reference strings and host configs,
    ///
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Appends entries after bind, for tables that reference the bound address,
    ///
    pub fn add(&self, entries: Vec<ReqResp>) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .entries
            .extend(entries);
    }

    /// Times the named entry was served,
    ///
    pub fn hits(&self, name: &'static str) -> usize {
        self.state
            .lock()
            .expect("mock state poisoned")
            .hits
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Requests that matched no entry, every test should end with none,
    ///
    pub fn misses(&self) -> Vec<String> {
        self.state.lock().expect("mock state poisoned").misses.clone()
    }
}

async fn handle(
    state: Arc<Mutex<MockState>>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query: Vec<(String, String)> = req
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_ascii_lowercase(),
                v.to_str().unwrap_or("").to_string(),
            )
        })
        .collect();
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .unwrap_or_default()
        .to_vec();

    let resp = {
        let mut state = state.lock().expect("mock state poisoned");
        let pos = state.entries.iter().position(|entry| {
            let e = &entry.req;
            e.method == method
                && e.path == path
                && e.query
                    .iter()
                    .all(|(k, v)| query.iter().any(|(qk, qv)| qk == k && qv == v))
                && e.headers.iter().all(|(k, v)| {
                    headers
                        .iter()
                        .any(|(hk, hv)| hk == &k.to_ascii_lowercase() && hv == v)
                })
                && e.absent_headers
                    .iter()
                    .all(|k| !headers.iter().any(|(hk, _)| hk == &k.to_ascii_lowercase()))
                && e.body.as_ref().map(|b| b == &body).unwrap_or(true)
        });

        match pos {
            Some(pos) => {
                let entry = state.entries[pos].clone();
                *state.hits.entry(entry.req.name).or_insert(0) += 1;
                if entry.req.del_on_use {
                    state.entries.remove(pos);
                }
                entry.resp
            }
            None => {
                state.misses.push(format!("{method} {path}?{query:?}"));
                RespEntry {
                    status: 500,
                    ..RespEntry::default()
                }
            }
        }
    };

    let mut builder = Response::builder().status(resp.status);
    for (name, value) in resp.resp_headers() {
        builder = builder.header(name, value);
    }
    Ok(builder
        .body(Body::from(resp.body.clone()))
        .expect("mock response should build"))
}

impl RespEntry {
    fn resp_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        if let Some(declared) = self.declared_length {
            headers.push(("Content-Length".to_string(), declared.to_string()));
        }
        headers
    }
}

/// Deterministic pseudo-random blob, seeded so failures reproduce,
///
pub fn random_blob(len: usize, seed: u64) -> (Digest, Vec<u8>) {
    let mut data = Vec::with_capacity(len);
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for _ in 0..len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        data.push((state >> 33) as u8);
    }
    (Digest::from_bytes(Algorithm::Sha256, &data), data)
}

/// Shorthand for a plain response with a body,
///
pub fn ok_blob(body: &[u8], digest: &Digest) -> RespEntry {
    RespEntry {
        status: 200,
        headers: vec![
            ("Content-Type".to_string(), "application/octet-stream".to_string()),
            ("Docker-Content-Digest".to_string(), digest.to_string()),
        ],
        body: body.to_vec(),
        declared_length: Some(body.len() as u64),
    }
}
