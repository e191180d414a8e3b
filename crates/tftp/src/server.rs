//! TFTP server dispatcher
//!
//! The dispatcher owns the well-known endpoint. It classifies each incoming
//! datagram, answers junk with a wire ERROR directly from the listening
//! socket, and spawns one task per accepted request. Every task binds its
//! own ephemeral socket, performs the filesystem checks for the request, and
//! hands the rest to the session state machine.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::File;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::protocol::{ErrorCode, Packet, Request, RequestKind, MAX_DATAGRAM};
use crate::session::{free_space, Session, ShutdownFlag};

/// How often the dispatcher wakes from its receive to observe the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// TFTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP port of the well-known endpoint.
    pub port: u16,
    /// Directory all request paths are resolved under.
    pub root_dir: PathBuf,
}

/// The server dispatch loop.
pub struct TftpServer {
    config: ServerConfig,
    stop: ShutdownFlag,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    pub fn new(config: ServerConfig, stop: ShutdownFlag) -> Self {
        Self {
            config,
            stop,
            socket: None,
        }
    }

    /// Bind the well-known endpoint without entering the loop, so callers
    /// (and tests) can learn the actual port first.
    pub async fn bind(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("failed to bind UDP port {}", self.config.port))?;
        tracing::info!(
            "listening on {}, serving {}",
            socket.local_addr().context("no local address")?,
            self.config.root_dir.display()
        );
        self.socket = Some(socket);
        Ok(())
    }

    /// The bound endpoint, once [`bind`](Self::bind) has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind if necessary, then accept requests until the stop flag is set.
    /// In-flight transfers are awaited before returning.
    pub async fn run(&mut self) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        let socket = self.socket.as_ref().expect("server must be bound before serving");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut transfers: Vec<JoinHandle<()>> = Vec::new();

        while !self.stop.is_set() {
            let (len, peer) = match timeout(STOP_POLL_INTERVAL, socket.recv_from(&mut buf)).await {
                Err(_) => {
                    transfers.retain(|task| !task.is_finished());
                    continue;
                }
                Ok(Err(err)) => {
                    tracing::warn!("receive failed on listening socket: {}", err);
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            match Packet::parse(&buf[..len]) {
                Ok(Packet::Request(request)) => {
                    tracing::info!(
                        "{} '{}' in {} mode from {} (options: {:?})",
                        request.kind.opcode(),
                        request.filename,
                        request.mode,
                        peer,
                        request.options
                    );
                    let root = self.config.root_dir.clone();
                    let stop = self.stop.clone();
                    transfers.push(tokio::spawn(async move {
                        if let Err(err) = run_transfer(request, peer, root, stop).await {
                            tracing::warn!("transfer with {} failed: {:#}", peer, err);
                        }
                    }));
                }
                Ok(other) => {
                    // A valid packet that is not a request has no session to
                    // belong to on this endpoint.
                    tracing::debug!("unexpected {} on listening socket from {}", other.opcode(), peer);
                    let reply = Packet::error(ErrorCode::IllegalOperation, "Illegal TFTP operation");
                    let _ = socket.send_to(&reply.serialize(), peer).await;
                }
                Err(err) => {
                    tracing::warn!("malformed datagram from {}: {}", peer, err);
                    let reply = Packet::error(err.wire_code(), err.to_string());
                    let _ = socket.send_to(&reply.serialize(), peer).await;
                }
            }
            transfers.retain(|task| !task.is_finished());
        }

        if !transfers.is_empty() {
            tracing::info!("waiting for {} active transfers to finish", transfers.len());
        }
        for task in transfers {
            let _ = task.await;
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

/// Bind an ephemeral socket matching the client's address family.
async fn bind_transfer_socket(peer: SocketAddr) -> Result<UdpSocket> {
    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind ephemeral transfer socket")?;
    tracing::debug!("transfer socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Send a refusal from the transfer socket and fail the task.
async fn refuse(socket: &UdpSocket, peer: SocketAddr, code: ErrorCode, detail: String) -> Result<()> {
    let reply = Packet::error(code, code.default_message());
    let _ = socket.send_to(&reply.serialize(), peer).await;
    bail!("refused {}: {}", peer, detail)
}

/// A refused path, carrying the wire error the requester should see.
#[derive(Debug)]
struct PathRefusal {
    code: ErrorCode,
    detail: String,
}

impl PathRefusal {
    fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Resolve a requested filename under the root, rejecting anything that
/// escapes it. For reads the full path must exist; for writes its parent
/// directory must.
fn resolve_path(root: &Path, filename: &str, must_exist: bool) -> Result<PathBuf, PathRefusal> {
    let relative = filename.trim_start_matches('/');
    let requested = root.join(relative);
    let root = root.canonicalize().map_err(|err| {
        PathRefusal::new(
            ErrorCode::AccessViolation,
            format!("failed to canonicalize root {}: {}", root.display(), err),
        )
    })?;

    if must_exist {
        let resolved = requested.canonicalize().map_err(|err| {
            PathRefusal::new(
                ErrorCode::FileNotFound,
                format!("cannot resolve {}: {}", requested.display(), err),
            )
        })?;
        if !resolved.starts_with(&root) {
            return Err(PathRefusal::new(
                ErrorCode::AccessViolation,
                format!("path {} escapes the served root", filename),
            ));
        }
        Ok(resolved)
    } else {
        let name = requested.file_name().map(ToOwned::to_owned).ok_or_else(|| {
            PathRefusal::new(
                ErrorCode::AccessViolation,
                format!("path {} has no file name", filename),
            )
        })?;
        let parent = requested.parent().unwrap_or(&root);
        let parent = parent.canonicalize().map_err(|err| {
            PathRefusal::new(
                ErrorCode::AccessViolation,
                format!("cannot resolve directory of {}: {}", filename, err),
            )
        })?;
        if !parent.starts_with(&root) {
            return Err(PathRefusal::new(
                ErrorCode::AccessViolation,
                format!("path {} escapes the served root", filename),
            ));
        }
        Ok(parent.join(name))
    }
}

/// One accepted request, run to completion on its own socket.
async fn run_transfer(request: Request, peer: SocketAddr, root: PathBuf, stop: ShutdownFlag) -> Result<()> {
    let socket = bind_transfer_socket(peer).await?;
    match request.kind {
        RequestKind::Read => serve_read(socket, peer, request, &root, stop).await,
        RequestKind::Write => serve_write(socket, peer, request, &root, stop).await,
    }
}

async fn serve_read(
    socket: UdpSocket,
    peer: SocketAddr,
    mut request: Request,
    root: &Path,
    stop: ShutdownFlag,
) -> Result<()> {
    let path = match resolve_path(root, &request.filename, true) {
        Ok(path) if path.is_file() => path,
        Ok(path) => {
            return refuse(&socket, peer, ErrorCode::AccessViolation, format!("{} is not a file", path.display())).await;
        }
        Err(refusal) => {
            return refuse(&socket, peer, refusal.code, refusal.detail).await;
        }
    };

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            return refuse(&socket, peer, ErrorCode::AccessViolation, format!("cannot open {}: {}", path.display(), err)).await;
        }
    };

    // A tsize=0 request asks for the real size.
    if request.options.contains_key("tsize") {
        let len = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        request.options.insert("tsize".to_string(), len);
    }

    let mut session = Session::server(socket, peer, RequestKind::Read, request.mode, request.options, stop);
    session.set_source(file);
    session.begin_read().await?;
    session.run().await
}

async fn serve_write(
    socket: UdpSocket,
    peer: SocketAddr,
    request: Request,
    root: &Path,
    stop: ShutdownFlag,
) -> Result<()> {
    let path = match resolve_path(root, &request.filename, false) {
        Ok(path) => path,
        Err(refusal) => {
            return refuse(&socket, peer, refusal.code, refusal.detail).await;
        }
    };

    if let Some(&tsize) = request.options.get("tsize") {
        match free_space(root) {
            Ok(avail) if avail < tsize => {
                return refuse(&socket, peer, ErrorCode::DiskFull, format!("{} bytes requested, {} available", tsize, avail)).await;
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("free-space probe failed: {:#}", err),
        }
    }

    // Exclusive create: existence check and open are one atomic step.
    let file = match File::create_new(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return refuse(&socket, peer, ErrorCode::FileExists, format!("{} already exists", path.display())).await;
        }
        Err(err) => {
            return refuse(&socket, peer, ErrorCode::AccessViolation, format!("cannot create {}: {}", path.display(), err)).await;
        }
    };

    let mut session = Session::server(socket, peer, RequestKind::Write, request.mode, request.options, stop);
    session.set_sink(file, path);
    session.begin_write().await?;
    session.run().await
}
