//! TFTP (Trivial File Transfer Protocol) Implementation
//!
//! A symmetric client/server TFTP library implementing RFC 1350 with option
//! negotiation (RFC 2347) and the `blksize`, `timeout` and `tsize` options
//! (RFC 2348/2349).
//!
//! - Binary (octet) and text (netascii) transfer modes
//! - Block size, timeout and transfer size negotiation
//! - Lockstep DATA/ACK exchange with retransmission and exponential backoff
//! - Transfer ID validation with out-of-band ERROR(5) replies
//! - Path traversal protection and atomic exclusive creates on the server
//! - Concurrent transfers, one task and one ephemeral socket each
//!
//! # Protocol Organization
//!
//! - [`Packet`], [`Opcode`], [`ErrorCode`], [`DataMode`] - the pure wire codec
//! - [`NetasciiEncoder`], [`NetasciiDecoder`] - streaming line-ending translation
//! - [`Session`] - the per-transfer state machine and receive loop
//! - [`TftpServer`] - the dispatch loop on the well-known endpoint
//! - [`TftpClient`] - download/upload entry points
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use tftp::{ServerConfig, ShutdownFlag, TftpServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stop = ShutdownFlag::new();
//!     let config = ServerConfig {
//!         port: 69,
//!         root_dir: PathBuf::from("./tftp_root"),
//!     };
//!     TftpServer::new(config, stop).run().await
//! }
//! ```
//!
//! # Basic Client Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use tftp::{ShutdownFlag, TftpClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = TftpClient::new("192.0.2.1", 69, ShutdownFlag::new())
//!         .option("blksize", 1024)
//!         .option("tsize", 0);
//!     client.download("boot.img", Path::new("boot.img")).await
//! }
//! ```

mod client;
mod netascii;
mod protocol;
mod server;
mod session;

pub use client::*;
pub use netascii::*;
pub use protocol::*;
pub use server::*;
pub use session::*;
