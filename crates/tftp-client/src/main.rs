//! TFTP client - main executable
//!
//! With `--file` the named remote file is downloaded to the destination
//! path; without it, standard input is uploaded to the destination path on
//! the server.

use std::path::Path;

use anyhow::{bail, Result};
use argh::FromArgs;
use tftp::{DataMode, ShutdownFlag, TftpClient};

const DEFAULT_PORT: u16 = 69;

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client - download a file or upload standard input",
    example = "Download boot.img:\n  {command_name} --hostname 10.0.0.1 --file boot.img --dest ./boot.img",
    example = "Upload stdin:\n  cat notes.txt | {command_name} --hostname 10.0.0.1 --dest notes.txt",
    example = "Negotiate a bigger block size:\n  {command_name} -h 10.0.0.1 -f big.iso -t big.iso --blksize 8192 --tsize"
)]
struct ClientCli {
    #[argh(option, short = 'h', description = "server hostname or address")]
    hostname: String,

    #[argh(
        option,
        short = 'p',
        default = "DEFAULT_PORT",
        description = "server udp port (default 69)"
    )]
    port: u16,

    #[argh(
        option,
        short = 'f',
        description = "remote file to download; stdin is uploaded when omitted"
    )]
    file: Option<String>,

    #[argh(
        option,
        short = 't',
        description = "destination path: local file for downloads, remote path for uploads"
    )]
    dest: String,

    #[argh(
        option,
        short = 'm',
        default = "DataMode::Octet",
        description = "transfer mode, octet or netascii (default octet)"
    )]
    mode: DataMode,

    #[argh(option, description = "request a block size between 8 and 65464")]
    blksize: Option<u64>,

    #[argh(option, description = "request a retransmission timeout in seconds, 1 to 255")]
    timeout: Option<u64>,

    #[argh(switch, description = "ask the server to report the transfer size before a download")]
    tsize: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: ClientCli = argh::from_env();
    if cli.port == 0 {
        bail!("invalid port number, must be between 1 and 65535");
    }

    let stop = ShutdownFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                stop.trigger();
            }
        });
    }

    let mut client = TftpClient::new(cli.hostname, cli.port, stop).mode(cli.mode);
    if let Some(blksize) = cli.blksize {
        client = client.option("blksize", blksize);
    }
    if let Some(timeout) = cli.timeout {
        client = client.option("timeout", timeout);
    }

    match cli.file {
        Some(remote) => {
            if cli.tsize {
                // tsize=0 on an RRQ asks the server to fill in the size.
                client = client.option("tsize", 0);
            }
            client.download(&remote, Path::new(&cli.dest)).await
        }
        None => {
            if cli.tsize {
                tracing::warn!("tsize is not available for stdin uploads, ignoring");
            }
            client.upload(&cli.dest).await
        }
    }
}
