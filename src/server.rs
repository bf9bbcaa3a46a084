//! Manifest server: serves the published manifest and individual files.
//!
//! `GET /` returns the cache file verbatim (optionally gzip-encoded) and
//! `GET /file/{path}` streams one file from the served root, after the path
//! has been checked lexically and against the canonical root. File transfers
//! pass through an [`AdmissionGate`] that caps how many run at once.

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::ManifestBuilder;
use crate::config::{AdmissionPolicy, ServerConfig};
use crate::error::ServeError;
use crate::fs_enum::check_relative_name;
use crate::manifest::read_cache;
use crate::protocol::{CONTENT_TYPE_JSON, CONTENT_TYPE_OCTETS, FILE_ROUTE_PREFIX, MANIFEST_ROUTE};
use crate::url::decode_request_path;

pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Bounded-capacity gate for in-flight file transfers
pub struct AdmissionGate {
    slots: Option<Arc<Semaphore>>,
    policy: AdmissionPolicy,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

/// Held for the lifetime of one transfer
pub struct TransferPermit {
    _slot: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    /// `capacity` 0 means unlimited
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        Self {
            slots: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            policy,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    pub async fn acquire(&self) -> Result<TransferPermit, ServeError> {
        let slot = match &self.slots {
            None => None,
            Some(sem) => Some(match self.policy {
                AdmissionPolicy::Wait => Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .map_err(|_| ServeError::Overloaded)?,
                AdmissionPolicy::Reject => Arc::clone(sem)
                    .try_acquire_owned()
                    .map_err(|_| ServeError::Overloaded)?,
            }),
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(TransferPermit {
            _slot: slot,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent transfer count observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ServerState {
    config: ServerConfig,
    canonical_root: PathBuf,
    gate: AdmissionGate,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        let canonical_root = std::fs::canonicalize(&config.root)?;
        if !canonical_root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root is not a directory: {}", canonical_root.display()),
            ));
        }
        let gate = AdmissionGate::new(config.max_concurrent_transfers, config.admission);
        Ok(Self {
            config,
            canonical_root,
            gate,
        })
    }

    pub fn root(&self) -> &Path {
        &self.canonical_root
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody> {
        let path = req.uri().path();
        if path == MANIFEST_ROUTE {
            if req.method() != Method::GET {
                return status_response(StatusCode::METHOD_NOT_ALLOWED);
            }
            return self.manifest_response(req.headers()).await;
        }
        if let Some(raw) = path.strip_prefix(FILE_ROUTE_PREFIX) {
            if req.method() != Method::GET {
                return status_response(StatusCode::METHOD_NOT_ALLOWED);
            }
            return match self.file_response(raw).await {
                Ok(resp) => resp,
                Err(e) => {
                    match &e {
                        ServeError::PathTraversal(p) => warn!(path = %p, "path traversal rejected"),
                        ServeError::Io(err) => warn!(path = %raw, error = %err, "file read failed"),
                        other => debug!(path = %raw, error = %other, "file request refused"),
                    }
                    status_response(e.status())
                }
            };
        }
        status_response(StatusCode::NOT_FOUND)
    }

    async fn manifest_response(&self, headers: &HeaderMap) -> Response<ResponseBody> {
        let cache = self.config.cache_path.clone();
        let data = match tokio::task::spawn_blocking(move || read_cache(&cache)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                warn!(error = %e, "cannot read manifest cache");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            Err(_) => return status_response(StatusCode::INTERNAL_SERVER_ERROR),
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON)
            .header(header::VARY, "accept-encoding");
        let body = if self.config.compression && accepts_gzip(headers) {
            match gzip(&data) {
                Ok(packed) => {
                    builder = builder.header(header::CONTENT_ENCODING, "gzip");
                    packed
                }
                Err(e) => {
                    warn!(error = %e, "gzip failed; sending manifest uncompressed");
                    data
                }
            }
        } else {
            data
        };
        builder
            .header(header::CONTENT_LENGTH, body.len())
            .body(full(body))
            .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
    }

    /// Map a request path onto a file under the root, or say why not
    pub async fn resolve(&self, raw: &str) -> Result<(PathBuf, u64), ServeError> {
        let name = decode_request_path(raw).ok_or_else(|| ServeError::NotFound(raw.to_string()))?;
        let protect = self.config.path_traversal_protection;

        if protect {
            check_relative_name(&name).map_err(|_| ServeError::PathTraversal(name.clone()))?;
        }

        let joined = self.canonical_root.join(name.trim_start_matches(['/', '\\']));
        let canonical = match tokio::fs::canonicalize(&joined).await {
            Ok(p) => p,
            Err(_) => return Err(ServeError::NotFound(name)),
        };
        if protect && !canonical.starts_with(&self.canonical_root) {
            return Err(ServeError::PathTraversal(name));
        }

        let meta = match tokio::fs::metadata(&canonical).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(ServeError::NotFound(name)),
        };
        let limit = self.config.max_file_size;
        if limit > 0 && meta.len() > limit {
            return Err(ServeError::SizeLimitExceeded {
                path: name,
                size: meta.len(),
                limit,
            });
        }
        Ok((canonical, meta.len()))
    }

    async fn file_response(&self, raw: &str) -> Result<Response<ResponseBody>, ServeError> {
        let (path, size) = self.resolve(raw).await?;
        let permit = self.gate.acquire().await?;
        let file = tokio::fs::File::open(&path).await?;

        // The permit rides along with the body, so the slot frees when the
        // transfer ends or the client goes away.
        let stream = ReaderStream::with_capacity(file, self.config.transfer_buffer_size)
            .map(move |chunk| {
                let _slot = &permit;
                chunk.map(Frame::data)
            });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, CONTENT_TYPE_OCTETS)
            .header(header::CONTENT_LENGTH, size)
            .body(StreamBody::new(stream).boxed_unsync())
            .map_err(|e| ServeError::Io(io::Error::new(io::ErrorKind::Other, e)))
    }
}

fn full(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut resp = Response::new(full(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| {
            let mut parts = token.split(';').map(str::trim);
            let coding = parts.next().unwrap_or("");
            let refused = parts.any(|p| p.replace(' ', "") == "q=0");
            coding.eq_ignore_ascii_case("gzip") && !refused
        })
}

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Accept loop; one task per connection. Returns once `cancel` fires, after
/// asking open connections to finish gracefully.
pub async fn serve(state: Arc<ServerState>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        debug!(%peer, "connection");

        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(state.handle(req).await) }
            });
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
            tokio::pin!(conn);
            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }
    debug!("accept loop stopped");
}

/// Bind, start the periodic manifest builder and serve until cancelled
pub async fn run(config: ServerConfig, cancel: CancellationToken) -> io::Result<()> {
    let state = Arc::new(ServerState::new(config.clone())?);
    if !config.path_traversal_protection {
        warn!("path traversal protection is DISABLED; any readable path may be served");
    }

    let builder = Arc::new(ManifestBuilder::new(
        state.root().to_path_buf(),
        config.cache_path.clone(),
        config.transfer_buffer_size,
    ));
    let rebuild_task = tokio::spawn(builder.run_periodic(config.rebuild_interval(), cancel.clone()));

    let listener = TcpListener::bind(&config.bind).await?;
    info!(
        bind = %listener.local_addr()?,
        root = %state.root().display(),
        ceiling = config.max_concurrent_transfers,
        "manifest server listening"
    );
    serve(state, listener, cancel).await;
    let _ = rebuild_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn served_tree() -> (tempfile::TempDir, ServerConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("sub/b.bin"), vec![7u8; 4096]).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), b"top secret").unwrap();
        let cfg = ServerConfig {
            root,
            cache_path: tmp.path().join("manifest.json"),
            ..ServerConfig::default()
        };
        (tmp, cfg)
    }

    async fn get(state: &ServerState, uri: &str) -> (StatusCode, Bytes) {
        let req = Request::builder().uri(uri).body(()).unwrap();
        let resp = state.handle(req).await;
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    #[tokio::test]
    async fn manifest_route_defaults_to_empty_array() {
        let (_tmp, cfg) = served_tree();
        let state = ServerState::new(cfg).unwrap();
        let (status, body) = get(&state, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn manifest_route_serves_cache_verbatim() {
        let (_tmp, cfg) = served_tree();
        std::fs::write(&cfg.cache_path, br#"[{"name":"a.txt","md5":"x"}]"#).unwrap();
        let state = ServerState::new(cfg).unwrap();
        let (status, body) = get(&state, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], br#"[{"name":"a.txt","md5":"x"}]"#);
    }

    #[tokio::test]
    async fn manifest_is_gzipped_on_request() {
        let (_tmp, cfg) = served_tree();
        std::fs::write(&cfg.cache_path, b"[]").unwrap();
        let state = ServerState::new(cfg).unwrap();
        let req = Request::builder()
            .uri("/")
            .header(header::ACCEPT_ENCODING, "br, gzip;q=0.8")
            .body(())
            .unwrap();
        let resp = state.handle(req).await;
        assert_eq!(resp.headers()[header::CONTENT_ENCODING], "gzip");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let mut out = String::new();
        std::io::Read::read_to_string(&mut flate2::read::GzDecoder::new(&body[..]), &mut out).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn gzip_refusal_is_honored() {
        let mut h = HeaderMap::new();
        h.insert(header::ACCEPT_ENCODING, "gzip;q=0".parse().unwrap());
        assert!(!accepts_gzip(&h));
        h.insert(header::ACCEPT_ENCODING, "deflate, GZIP".parse().unwrap());
        assert!(accepts_gzip(&h));
    }

    #[tokio::test]
    async fn files_stream_as_octets() {
        let (_tmp, cfg) = served_tree();
        let state = ServerState::new(cfg).unwrap();
        let (status, body) = get(&state, "/file/sub/b.bin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 4096);
        let (status, body) = get(&state, "/file/a.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"alpha");
        assert_eq!(state.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn traversal_and_missing_files_are_404() {
        let (_tmp, cfg) = served_tree();
        let state = ServerState::new(cfg).unwrap();
        for uri in [
            "/file/../secret.txt",
            "/file/%2e%2e/secret.txt",
            "/file/sub/..%5c..%5csecret.txt",
            "/file//etc/passwd",
            "/file/missing.txt",
            "/file/sub",
            "/nope",
        ] {
            let (status, _) = get(&state, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
        assert!(matches!(
            state.resolve("../secret.txt").await,
            Err(ServeError::PathTraversal(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_caught_by_canonical_check() {
        let (tmp, cfg) = served_tree();
        std::os::unix::fs::symlink(tmp.path().join("secret.txt"), cfg.root.join("link.txt")).unwrap();
        let state = ServerState::new(cfg).unwrap();
        assert!(matches!(
            state.resolve("link.txt").await,
            Err(ServeError::PathTraversal(_))
        ));
        let (status, _) = get(&state, "/file/link.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversize_files_are_413() {
        let (_tmp, mut cfg) = served_tree();
        cfg.max_file_size = 100;
        let state = ServerState::new(cfg).unwrap();
        let (status, _) = get(&state, "/file/sub/b.bin").await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let (status, _) = get(&state, "/file/a.txt").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn non_get_is_405() {
        let (_tmp, cfg) = served_tree();
        let state = ServerState::new(cfg).unwrap();
        let req = Request::builder().method(Method::POST).uri("/").body(()).unwrap();
        assert_eq!(state.handle(req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiting_gate_never_exceeds_ceiling() {
        let gate = Arc::new(AdmissionGate::new(2, AdmissionPolicy::Wait));
        let mut tasks = Vec::new();
        for _ in 0..12 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                let permit = gate.acquire().await.unwrap();
                assert!(gate.in_flight() <= 2);
                tokio::time::sleep(Duration::from_millis(15)).await;
                drop(permit);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(gate.peak(), 2);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiting_gate_queues_instead_of_failing() {
        let gate = Arc::new(AdmissionGate::new(1, AdmissionPolicy::Wait));
        let first = gate.acquire().await.unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let started = Instant::now();
                let _p = gate.acquire().await.unwrap();
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn rejecting_gate_answers_503_when_full() {
        let (_tmp, mut cfg) = served_tree();
        cfg.max_concurrent_transfers = 1;
        cfg.admission = AdmissionPolicy::Reject;
        let state = ServerState::new(cfg).unwrap();

        let held = state.gate().acquire().await.unwrap();
        let (status, _) = get(&state, "/file/a.txt").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        drop(held);
        let (status, _) = get(&state, "/file/a.txt").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unlimited_gate_admits_everything() {
        let gate = AdmissionGate::new(0, AdmissionPolicy::Reject);
        let permits: Vec<_> = futures::future::join_all((0..50).map(|_| gate.acquire()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(gate.in_flight(), 50);
        drop(permits);
        assert_eq!(gate.in_flight(), 0);
    }
}
