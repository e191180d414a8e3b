//! TFTP client driver
//!
//! Binds an ephemeral endpoint, resolves the server, builds the initial
//! RRQ/WRQ with whatever options the caller asked for, and hands control to
//! the session state machine. Downloads write to a local file; uploads read
//! from any byte stream (standard input in the CLI).

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::net::{lookup_host, UdpSocket};

use crate::protocol::{DataMode, OptionMap, RequestKind};
use crate::session::{Session, ShutdownFlag};

/// TFTP client configuration and entry points.
#[derive(Debug, Clone)]
pub struct TftpClient {
    hostname: String,
    port: u16,
    mode: DataMode,
    options: OptionMap,
    stop: ShutdownFlag,
}

impl TftpClient {
    pub fn new(hostname: impl Into<String>, port: u16, stop: ShutdownFlag) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            mode: DataMode::Octet,
            options: OptionMap::new(),
            stop,
        }
    }

    /// Select the transfer mode. The default is octet.
    pub fn mode(mut self, mode: DataMode) -> Self {
        self.mode = mode;
        self
    }

    /// Request an option (`blksize`, `timeout` or `tsize`) on the initial
    /// request. Whether it applies is up to the server's OACK.
    pub fn option(mut self, name: impl Into<String>, value: u64) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    async fn connect(&self) -> Result<(UdpSocket, SocketAddr)> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind client socket")?;
        let server = lookup_host((self.hostname.as_str(), self.port))
            .await
            .with_context(|| format!("could not resolve hostname {}", self.hostname))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| anyhow!("no IPv4 address found for {}", self.hostname))?;
        tracing::debug!("resolved {} to {}", self.hostname, server);
        Ok((socket, server))
    }

    /// Download `remote` into the local file `dest`.
    ///
    /// The destination is created up front and removed again if the
    /// transfer does not complete.
    pub async fn download(&self, remote: &str, dest: &Path) -> Result<()> {
        tracing::info!(
            "downloading {} from {}:{} to {}",
            remote,
            self.hostname,
            self.port,
            dest.display()
        );
        let (socket, server) = self.connect().await?;
        let file = File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let mut session = Session::client(
            socket,
            server,
            RequestKind::Read,
            self.mode,
            self.options.clone(),
            self.stop.clone(),
        );
        session.set_sink(file, dest.to_path_buf());
        session.begin_request(remote).await?;
        session.run().await
    }

    /// Upload standard input to `remote` on the server.
    pub async fn upload(&self, remote: &str) -> Result<()> {
        self.upload_from(tokio::io::stdin(), remote).await
    }

    /// Upload an arbitrary byte stream to `remote` on the server.
    pub async fn upload_from(
        &self,
        source: impl AsyncRead + Send + Unpin + 'static,
        remote: &str,
    ) -> Result<()> {
        tracing::info!("uploading to {} on {}:{}", remote, self.hostname, self.port);
        let (socket, server) = self.connect().await?;

        let mut session = Session::client(
            socket,
            server,
            RequestKind::Write,
            self.mode,
            self.options.clone(),
            self.stop.clone(),
        );
        session.set_source(source);
        session.begin_request(remote).await?;
        session.run().await
    }
}
