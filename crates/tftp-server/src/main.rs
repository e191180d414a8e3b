//! TFTP server - main executable
//!
//! Serves one root directory over TFTP. SIGINT sets the process-wide stop
//! flag; the dispatcher and all in-flight transfers wind down before exit.

use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use tftp::{ServerConfig, ShutdownFlag, TftpServer};

const DEFAULT_PORT: u16 = 69;

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server - serves a directory over RFC 1350 TFTP with option negotiation",
    example = "Serve ./tftp_root on the default port:\n  {command_name} ./tftp_root",
    example = "Serve on an unprivileged port:\n  {command_name} --port 6969 /srv/tftp"
)]
struct ServerCli {
    #[argh(
        option,
        short = 'p',
        default = "DEFAULT_PORT",
        description = "udp port to listen on (default 69)"
    )]
    port: u16,

    #[argh(positional, description = "root directory served to clients, created if missing")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: ServerCli = argh::from_env();
    if cli.port == 0 {
        bail!("invalid port number, must be between 1 and 65535");
    }

    if !cli.root.exists() {
        std::fs::DirBuilder::new()
            .mode(0o700)
            .create(&cli.root)
            .with_context(|| format!("failed to create root directory {}", cli.root.display()))?;
        tracing::info!("created root directory {}", cli.root.display());
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

    let config = ServerConfig {
        port: cli.port,
        root_dir: cli.root,
    };
    TftpServer::new(config, stop).run().await
}
