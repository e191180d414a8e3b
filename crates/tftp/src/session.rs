//! Per-transfer session state machine
//!
//! One [`Session`] owns everything a single transfer needs: the ephemeral
//! UDP socket, the peer and its locked transfer ID, the block counter, the
//! negotiated options, the source or sink for file data, and the one-slot
//! retransmission buffer. The receive loop in [`Session::run`] is a timed
//! receive -> classify -> transition -> send cycle; all protocol decisions
//! live in [`Session::handle_packet`], which never touches the network and
//! can be driven directly in tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::netascii::{NetasciiDecoder, NetasciiEncoder};
use crate::protocol::{
    DataMode, ErrorCode, OptionMap, Packet, Request, RequestKind, DEFAULT_BLOCK_SIZE, MAX_DATAGRAM,
};

/// Receive timeout before the first retransmission, unless the `timeout`
/// option negotiated another value.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How many retransmissions to attempt before giving up on the peer.
pub const MAX_RETRIES: u32 = 3;

/// Timeout multiplier applied after every retransmission.
const BACKOFF_FACTOR: u32 = 2;

/// Process-wide stop flag.
///
/// Created once at process start, set by the signal handler, and observed by
/// the dispatcher and every session at the top of their receive loops. A
/// clone is handed to each constructor rather than reaching for a global.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Called from the signal handler task.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Free space in bytes on the filesystem holding `path`.
///
/// Used for `tsize`-driven checks before accepting an inbound file.
pub fn free_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("statvfs failed for {}", path.display()))?;
    Ok(stat.block_size() as u64 * stat.blocks_available() as u64)
}

/// Which end of the transfer this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Session states.
///
/// `RrqEnd` and `WrqEnd` are the clean terminal states of read and write
/// transfers; `Error` is the failed terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    WaitingOack,
    WaitingAfterOack,
    WaitingAck,
    WaitingLastAck,
    WaitingData,
    RrqEnd,
    WrqEnd,
    Error,
}

/// Result of comparing a received block number against the expected one,
/// modulo 2^16. Numbers in the half-range behind the expected value are
/// retransmitted duplicates; the half-range ahead is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOrder {
    Expected,
    Stale,
    Ahead,
}

fn compare_block(expected: u16, received: u16) -> BlockOrder {
    match expected.wrapping_sub(received) {
        0 => BlockOrder::Expected,
        d if d < 0x8000 => BlockOrder::Stale,
        _ => BlockOrder::Ahead,
    }
}

/// Byte source for the sending side of a transfer.
///
/// Wraps the file (or stdin) and, in netascii mode, the expansion queue so
/// every block except the last is filled to the negotiated size.
struct BlockSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    encoder: Option<NetasciiEncoder>,
    eof: bool,
}

impl BlockSource {
    async fn next_block(&mut self, size: usize) -> std::io::Result<Vec<u8>> {
        match &mut self.encoder {
            None => {
                let mut buf = vec![0u8; size];
                let mut filled = 0;
                while filled < size {
                    let n = self.reader.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            Some(encoder) => {
                let mut raw = vec![0u8; size];
                while encoder.len() < size && !self.eof {
                    let n = self.reader.read(&mut raw).await?;
                    if n == 0 {
                        self.eof = true;
                        break;
                    }
                    encoder.push(&raw[..n]);
                }
                Ok(encoder.take(size))
            }
        }
    }
}

/// Byte sink for the receiving side of a transfer.
struct BlockSink {
    writer: tokio::fs::File,
    decoder: Option<NetasciiDecoder>,
}

impl BlockSink {
    async fn write_block(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.decoder {
            None => self.writer.write_all(data).await,
            Some(decoder) => {
                let local = decoder.push(data);
                self.writer.write_all(&local).await
            }
        }
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        if let Some(decoder) = &mut self.decoder {
            let tail = decoder.flush();
            if !tail.is_empty() {
                self.writer.write_all(&tail).await?;
            }
        }
        self.writer.flush().await
    }
}

/// One transfer, from first packet to terminal state.
pub struct Session {
    socket: UdpSocket,
    /// Where replies go. For a client this starts as the server's well-known
    /// endpoint and is replaced by the ephemeral endpoint of the first reply.
    peer: SocketAddr,
    /// The endpoint the initial request was (or would be) sent to.
    home: SocketAddr,
    /// Locked peer transfer ID. `None` until the client hears back.
    tid: Option<u16>,
    side: Side,
    kind: RequestKind,
    mode: DataMode,
    state: SessionState,
    /// The block number expected in the next ACK/DATA from the peer.
    block: u16,
    block_size: u16,
    timeout: Duration,
    initial_timeout: Duration,
    tsize: Option<u64>,
    /// Requested (client) or accepted-but-unapplied (server) options.
    options: OptionMap,
    retries: u32,
    /// Serialized bytes of the last non-ERROR packet sent.
    last_sent: Option<Vec<u8>>,
    /// The initial request, kept so a client can retry it without options.
    request: Option<Request>,
    source: Option<BlockSource>,
    sink: Option<BlockSink>,
    /// Destination file to delete if the transfer fails.
    dest_path: Option<PathBuf>,
    stop: ShutdownFlag,
}

impl Session {
    /// Session for a client-originated transfer. The peer TID is unknown
    /// until the server's first reply arrives from its ephemeral endpoint.
    pub fn client(
        socket: UdpSocket,
        server: SocketAddr,
        kind: RequestKind,
        mode: DataMode,
        options: OptionMap,
        stop: ShutdownFlag,
    ) -> Self {
        Self::new(socket, server, None, Side::Client, kind, mode, options, stop)
    }

    /// Session for a server-side transfer. The peer TID is the source port
    /// of the initial request.
    pub fn server(
        socket: UdpSocket,
        peer: SocketAddr,
        kind: RequestKind,
        mode: DataMode,
        options: OptionMap,
        stop: ShutdownFlag,
    ) -> Self {
        Self::new(socket, peer, Some(peer.port()), Side::Server, kind, mode, options, stop)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        tid: Option<u16>,
        side: Side,
        kind: RequestKind,
        mode: DataMode,
        options: OptionMap,
        stop: ShutdownFlag,
    ) -> Self {
        Self {
            socket,
            peer,
            home: peer,
            tid,
            side,
            kind,
            mode,
            state: SessionState::Initial,
            block: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: INITIAL_TIMEOUT,
            initial_timeout: INITIAL_TIMEOUT,
            tsize: None,
            options,
            retries: 0,
            last_sent: None,
            request: None,
            source: None,
            sink: None,
            dest_path: None,
            stop,
        }
    }

    /// Attach the byte source the sending side reads blocks from.
    pub fn set_source(&mut self, reader: impl AsyncRead + Send + Unpin + 'static) {
        let encoder = matches!(self.mode, DataMode::Netascii).then(NetasciiEncoder::new);
        self.source = Some(BlockSource {
            reader: Box::new(reader),
            encoder,
            eof: false,
        });
    }

    /// Attach the destination file the receiving side writes blocks to.
    /// The file is removed again if the transfer does not complete.
    pub fn set_sink(&mut self, file: tokio::fs::File, path: PathBuf) {
        let decoder = matches!(self.mode, DataMode::Netascii).then(NetasciiDecoder::new);
        self.sink = Some(BlockSink {
            writer: file,
            decoder,
        });
        self.dest_path = Some(path);
    }

    /// Expected total transfer size, when a `tsize` option announced one.
    pub fn tsize(&self) -> Option<u64> {
        self.tsize
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Send the initial RRQ/WRQ and arm the state machine. With options the
    /// session waits for an OACK; without, for the first DATA or ACK(0).
    pub async fn begin_request(&mut self, remote_path: &str) -> Result<()> {
        let request = Request {
            kind: self.kind,
            filename: remote_path.to_string(),
            mode: self.mode,
            options: self.options.clone(),
        };
        self.request = Some(request.clone());
        if self.kind == RequestKind::Read {
            self.block = 1;
        }
        self.state = if self.options.is_empty() {
            SessionState::Initial
        } else {
            SessionState::WaitingOack
        };
        self.send(&Packet::Request(request)).await
    }

    /// Server-side start of a read transfer: send the OACK, or the first
    /// DATA block when no options survived.
    pub async fn begin_read(&mut self) -> Result<()> {
        if self.options.is_empty() {
            match self.send_next_block().await {
                Some(packet) => self.send(&packet).await?,
                None => bail!("no source attached"),
            }
            if self.state == SessionState::Error {
                bail!("failed to read the first block");
            }
        } else {
            let oack = Packet::Oack {
                options: self.options.clone(),
            };
            self.send(&oack).await?;
            self.state = SessionState::WaitingAfterOack;
        }
        Ok(())
    }

    /// Server-side start of a write transfer: send ACK(0), or the OACK when
    /// options survived.
    pub async fn begin_write(&mut self) -> Result<()> {
        self.block = 1;
        if self.options.is_empty() {
            self.send(&Packet::Ack { block: 0 }).await?;
            self.state = SessionState::WaitingData;
        } else {
            let oack = Packet::Oack {
                options: self.options.clone(),
            };
            self.send(&oack).await?;
            self.state = SessionState::WaitingAfterOack;
        }
        Ok(())
    }

    /// Drive the transfer to a terminal state.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.drive().await;
        self.cleanup(result.is_err()).await;
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if self.stop.is_set() {
                if self.side == Side::Server {
                    let shutdown = Packet::error(ErrorCode::NotDefined, "Server shutdown");
                    let _ = self.socket.send_to(&shutdown.serialize(), self.peer).await;
                }
                self.state = SessionState::Error;
                bail!("transfer interrupted by shutdown");
            }

            let (len, src) = match timeout(self.timeout, self.socket.recv_from(&mut buf)).await {
                Err(_) => {
                    self.retries += 1;
                    if self.retries > MAX_RETRIES {
                        self.state = SessionState::Error;
                        bail!("no response from {} after {} retries", self.peer, MAX_RETRIES);
                    }
                    if let Some(last) = &self.last_sent {
                        tracing::debug!(
                            "timeout, retransmitting to {} (attempt {})",
                            self.peer,
                            self.retries
                        );
                        self.socket
                            .send_to(last, self.peer)
                            .await
                            .context("retransmission failed")?;
                    }
                    self.timeout *= BACKOFF_FACTOR;
                    continue;
                }
                Ok(received) => received.context("receive failed")?,
            };

            match self.tid {
                // First reply to a client request locks the peer TID.
                None => {
                    self.peer = src;
                    self.tid = Some(src.port());
                }
                Some(tid) if src.port() != tid => {
                    // A stray sender gets its ERROR(5) and nothing else: the
                    // retry counter and backoff keep running for the real peer.
                    tracing::warn!("datagram from unknown TID {} during transfer with {}", src, self.peer);
                    let stray = Packet::error(ErrorCode::UnknownTid, "Unknown transfer ID");
                    let _ = self.socket.send_to(&stray.serialize(), src).await;
                    continue;
                }
                Some(_) => {}
            }
            self.retries = 0;
            self.timeout = self.initial_timeout;

            let packet = match Packet::parse(&buf[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    let reply = Packet::error(err.wire_code(), err.to_string());
                    let _ = self.socket.send_to(&reply.serialize(), self.peer).await;
                    self.state = SessionState::Error;
                    bail!("unparseable datagram from {}: {}", self.peer, err);
                }
            };
            tracing::debug!("<- {} from {}", packet, self.peer);

            if let Some(reply) = self.handle_packet(packet).await {
                self.send(&reply).await?;
            }

            match self.state {
                SessionState::RrqEnd | SessionState::WrqEnd => {
                    tracing::info!("transfer with {} complete", self.peer);
                    return Ok(());
                }
                SessionState::Error => bail!("transfer with {} failed", self.peer),
                _ => {}
            }
        }
    }

    /// Serialize and send, recording every non-ERROR packet for
    /// retransmission. ERROR packets are fire-and-forget.
    pub(crate) async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.serialize();
        self.socket
            .send_to(&bytes, self.peer)
            .await
            .with_context(|| format!("failed to send {} to {}", packet.opcode(), self.peer))?;
        tracing::debug!("-> {} to {}", packet, self.peer);
        if !matches!(packet, Packet::Error { .. }) {
            self.last_sent = Some(bytes);
        }
        Ok(())
    }

    /// Apply one packet to the state machine, returning the reply to send.
    ///
    /// `None` means nothing goes out: either a silently ignored duplicate or
    /// a terminal transition that needs no reply. Callers check
    /// [`SessionState`] afterwards for terminal states.
    pub(crate) async fn handle_packet(&mut self, packet: Packet) -> Option<Packet> {
        match packet {
            Packet::Data { block, data } => self.on_data(block, data).await,
            Packet::Ack { block } => self.on_ack(block).await,
            Packet::Oack { options } => self.on_oack(options).await,
            Packet::Error { code, message } => self.on_error(code, message).await,
            Packet::Request(_) => self.reject(ErrorCode::IllegalOperation, "request during transfer"),
        }
    }

    /// Fail the session with a wire error.
    fn reject(&mut self, code: ErrorCode, message: &str) -> Option<Packet> {
        tracing::warn!("rejecting peer {}: {}", self.peer, message);
        self.state = SessionState::Error;
        Some(Packet::error(code, code.default_message()))
    }

    async fn on_data(&mut self, block: u16, data: Vec<u8>) -> Option<Packet> {
        let expected_here = match (self.side, self.state) {
            (Side::Client, SessionState::Initial | SessionState::WaitingData)
                if self.kind == RequestKind::Read =>
            {
                true
            }
            // The server ignored our options and answered the RRQ directly.
            (Side::Client, SessionState::WaitingOack) if self.kind == RequestKind::Read => true,
            (Side::Server, SessionState::WaitingData) => true,
            (Side::Server, SessionState::WaitingAfterOack) if self.kind == RequestKind::Write => {
                self.apply_options(&self.options.clone());
                true
            }
            _ => false,
        };
        if !expected_here {
            return self.reject(ErrorCode::IllegalOperation, "unexpected DATA packet");
        }

        if data.len() > self.block_size as usize {
            return self.reject(ErrorCode::IllegalOperation, "payload exceeds negotiated block size");
        }

        match compare_block(self.block, block) {
            BlockOrder::Expected => {}
            BlockOrder::Stale => {
                tracing::debug!("ignoring duplicate DATA {} from {}", block, self.peer);
                return None;
            }
            BlockOrder::Ahead => {
                return self.reject(ErrorCode::IllegalOperation, "DATA block ahead of expected");
            }
        }

        let last = data.len() < self.block_size as usize;
        if self.write_block(&data).await.is_err() {
            return self.reject(ErrorCode::DiskFull, "failed to write block");
        }
        if last {
            if self.finish_sink().await.is_err() {
                return self.reject(ErrorCode::DiskFull, "failed to flush destination");
            }
            self.state = match self.kind {
                RequestKind::Read => SessionState::RrqEnd,
                RequestKind::Write => SessionState::WrqEnd,
            };
        } else {
            self.state = SessionState::WaitingData;
        }

        let ack = Packet::Ack { block: self.block };
        self.block = self.block.wrapping_add(1);
        Some(ack)
    }

    async fn on_ack(&mut self, block: u16) -> Option<Packet> {
        let expected_here = match (self.side, self.state) {
            (Side::Client, SessionState::Initial) if self.kind == RequestKind::Write => true,
            // The server ignored our options and acknowledged the bare WRQ.
            (Side::Client, SessionState::WaitingOack) if self.kind == RequestKind::Write => true,
            (Side::Client, SessionState::WaitingAck) if self.kind == RequestKind::Write => true,
            (Side::Server, SessionState::WaitingAck) if self.kind == RequestKind::Read => true,
            (Side::Server, SessionState::WaitingAfterOack) if self.kind == RequestKind::Read => {
                self.apply_options(&self.options.clone());
                true
            }
            (_, SessionState::WaitingLastAck) => true,
            _ => false,
        };
        if !expected_here {
            return self.reject(ErrorCode::IllegalOperation, "unexpected ACK packet");
        }

        match compare_block(self.block, block) {
            BlockOrder::Expected => {}
            BlockOrder::Stale => {
                tracing::debug!("ignoring duplicate ACK {} from {}", block, self.peer);
                return None;
            }
            BlockOrder::Ahead => {
                return self.reject(ErrorCode::IllegalOperation, "ACK for a block never sent");
            }
        }

        if self.state == SessionState::WaitingLastAck {
            self.state = match self.kind {
                RequestKind::Read => SessionState::RrqEnd,
                RequestKind::Write => SessionState::WrqEnd,
            };
            return None;
        }

        self.send_next_block().await
    }

    async fn on_oack(&mut self, options: OptionMap) -> Option<Packet> {
        if self.side == Side::Server {
            return self.reject(ErrorCode::IllegalOperation, "unexpected OACK packet");
        }

        if self.state != SessionState::WaitingOack {
            // A retransmitted OACK means the packet that accepted it was
            // lost. Acknowledge a read's OACK again; a write's DATA(1) is
            // covered by the retransmission timer.
            let negotiated = !self.options.is_empty();
            return match (self.kind, self.state) {
                (RequestKind::Read, SessionState::WaitingData) if negotiated => {
                    tracing::debug!("duplicate OACK from {}, re-acknowledging", self.peer);
                    Some(Packet::Ack { block: 0 })
                }
                (RequestKind::Write, SessionState::WaitingAck | SessionState::WaitingLastAck)
                    if negotiated =>
                {
                    tracing::debug!("ignoring duplicate OACK from {}", self.peer);
                    None
                }
                _ => self.reject(ErrorCode::IllegalOperation, "unexpected OACK packet"),
            };
        }

        // The server may only acknowledge options we asked for.
        for name in options.keys() {
            if !self.options.contains_key(name) {
                return self.reject(ErrorCode::InvalidOptions, "OACK names an option we never requested");
            }
        }
        self.apply_options(&options);

        match self.kind {
            RequestKind::Read => {
                if let Some(tsize) = self.tsize {
                    let dir = self
                        .dest_path
                        .as_deref()
                        .and_then(Path::parent)
                        .filter(|p| !p.as_os_str().is_empty())
                        .unwrap_or(Path::new("."));
                    match free_space(dir) {
                        Ok(avail) if avail < tsize => {
                            return self.reject(ErrorCode::DiskFull, "not enough space for advertised tsize");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!("free-space probe failed: {:#}", err);
                        }
                    }
                }
                self.state = SessionState::WaitingData;
                Some(Packet::Ack { block: 0 })
            }
            RequestKind::Write => self.send_next_block().await,
        }
    }

    async fn on_error(&mut self, code: ErrorCode, message: String) -> Option<Packet> {
        // A server that rejects our options gets one plain retry without
        // them. Its next reply will come from a fresh TID.
        if self.state == SessionState::WaitingOack && code == ErrorCode::InvalidOptions {
            tracing::info!("peer rejected options, retrying without: {}", message);
            let mut request = self.request.clone()?;
            request.options.clear();
            self.options.clear();
            self.peer = self.home;
            self.tid = None;
            self.state = match self.kind {
                RequestKind::Read => SessionState::WaitingData,
                RequestKind::Write => SessionState::WaitingAck,
            };
            return Some(Packet::Request(request));
        }

        tracing::warn!("peer {} reported {}: {}", self.peer, code, message);
        self.state = SessionState::Error;
        None
    }

    /// Advance the block counter, read the next block from the source, and
    /// build its DATA packet. A short (or empty) block moves the session to
    /// `WaitingLastAck`.
    async fn send_next_block(&mut self) -> Option<Packet> {
        self.block = self.block.wrapping_add(1);
        let size = self.block_size as usize;
        let data = match self.source.as_mut() {
            Some(source) => match source.next_block(size).await {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!("failed to read source block {}: {}", self.block, err);
                    return self.reject(ErrorCode::DiskFull, "failed to read source");
                }
            },
            None => return self.reject(ErrorCode::NotDefined, "no source attached"),
        };
        self.state = if data.len() < size {
            SessionState::WaitingLastAck
        } else {
            SessionState::WaitingAck
        };
        Some(Packet::Data {
            block: self.block,
            data,
        })
    }

    async fn write_block(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.write_block(data).await,
            None => Err(std::io::Error::other("no sink attached")),
        }
    }

    async fn finish_sink(&mut self) -> std::io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.finish().await,
            None => Ok(()),
        }
    }

    /// Apply negotiated options: `blksize` caps the payload, `timeout`
    /// replaces both the current and the post-receive timeout, `tsize` is
    /// recorded for space checks and reporting.
    fn apply_options(&mut self, options: &OptionMap) {
        if let Some(&blksize) = options.get("blksize") {
            tracing::debug!("setting block size to {}", blksize);
            self.block_size = blksize as u16;
        }
        if let Some(&secs) = options.get("timeout") {
            tracing::debug!("setting timeout to {}s", secs);
            self.initial_timeout = Duration::from_secs(secs);
            self.timeout = self.initial_timeout;
        }
        if let Some(&tsize) = options.get("tsize") {
            tracing::debug!("peer advertised tsize {}", tsize);
            self.tsize = Some(tsize);
        }
    }

    /// Release every resource the session holds. A failed receiving session
    /// must not leave a half-written destination file behind.
    async fn cleanup(&mut self, failed: bool) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.writer.flush().await;
        }
        if failed {
            if let Some(path) = self.dest_path.take() {
                tracing::warn!("removing partially written file {}", path.display());
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("failed to remove {}: {}", path.display(), err);
                }
            }
        }
    }
}
