//! peerfs CLI - publish a directory or reach a published one
//!
//! Usage:
//!   peerfs publish            Export the configured directory
//!   peerfs pairing            Exchange credentials with a new device
//!   peerfs shell              Interactive shell on the remote share
//!   peerfs ls/cat/rm/mkdir    One-shot remote operations
//!   peerfs pull/push          Copy files to/from the remote share

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use peerfs_core::{Config, FsError};
use peerfs_daemon::local::LocalFs;
use peerfs_daemon::thumbnail::init_thumbnailers;
use peerfs_daemon::vfs::Vfs;
use peerfs_daemon::{connect, pairing, publish, shell, transport, ReadOnlyVfs};

#[derive(Parser)]
#[command(name = "peerfs")]
#[command(about = "Filesystem export over peer-to-peer data channels", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.toml")]
    conf: PathBuf,

    /// Room name override
    #[arg(long)]
    room: Option<String>,

    /// Password override
    #[arg(long)]
    password: Option<String>,

    /// Local path override (publish)
    #[arg(long)]
    path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the configured directory
    Publish,
    /// Exchange credentials with a new device
    Pairing,
    /// Interactive shell on the remote share
    Shell,
    /// Copy a remote file into the working directory
    Pull { remote: String },
    /// Copy a local file to the remote share
    Push {
        local: String,
        remote: Option<String>,
    },
    /// List a remote directory
    Ls { path: Option<String> },
    /// Print a remote file
    Cat { path: String },
    /// Remove a remote file or empty directory
    Rm { path: String },
    /// Create a remote directory
    Mkdir { path: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("logging init");

    let mut config = match Config::load_from(&cli.conf) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    if let Some(room) = cli.room {
        config.room_name = room;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if let Some(path) = cli.path {
        config.local_path = path;
    }

    init_thumbnailers(&config);

    if let Err(err) = run(cli.command, &config).await {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: &Config) -> Result<(), FsError> {
    match command {
        Commands::Publish => run_publish(config).await,
        Commands::Pairing => {
            let connector = transport::connector()?;
            pairing::pairing(config, &connector).await
        }
        Commands::Shell => {
            let session = open_client(config).await?;
            let result = shell::run_shell(session.client.clone()).await;
            session.close();
            result
        }
        Commands::Pull { remote } => {
            let session = open_client(config).await?;
            let result = pull(&session.client, &remote).await;
            session.close();
            result
        }
        Commands::Push { local, remote } => {
            let session = open_client(config).await?;
            let result = push(&session.client, &local, remote.as_deref()).await;
            session.close();
            result
        }
        Commands::Ls { path } => {
            let session = open_client(config).await?;
            let result = ls(&session.client, path.as_deref().unwrap_or("/")).await;
            session.close();
            result
        }
        Commands::Cat { path } => {
            let session = open_client(config).await?;
            let result = session.client.read_file(&path).await.map(|data| {
                use std::io::Write as _;
                let _ = std::io::stdout().write_all(&data);
            });
            session.close();
            result
        }
        Commands::Rm { path } => {
            let session = open_client(config).await?;
            let result = session.client.remove(&path).await;
            session.close();
            result
        }
        Commands::Mkdir { path } => {
            let session = open_client(config).await?;
            let result = session.client.mkdir(&path).await;
            session.close();
            result
        }
    }
}

/// Publish forever: the redirector hands each client its own room, and
/// recoverable failures retry after a short sleep.
async fn run_publish(config: &Config) -> Result<(), FsError> {
    let connector = transport::connector()?;
    let fsys: Arc<dyn Vfs> = if config.writable {
        Arc::new(LocalFs::new(&config.local_path))
    } else {
        Arc::new(ReadOnlyVfs::new(LocalFs::new(&config.local_path)))
    };

    info!("publishing {} (writable: {})", config.local_path, config.writable);
    loop {
        if let Err(err) = publish::run_redirector(config, &connector, fsys.clone()).await {
            error!("publish failed: {}", err);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn open_client(config: &Config) -> Result<connect::ClientSession, FsError> {
    let connector = transport::connector()?;
    connect::connect_client(config, &connector).await
}

async fn pull(client: &peerfs_daemon::FsClient, remote: &str) -> Result<(), FsError> {
    let entry = client.stat(remote).await?;
    info!("size: {}", entry.size);
    let data = client.read_file(remote).await?;
    let local = Path::new(remote).file_name().and_then(|n| n.to_str()).unwrap_or("out");
    std::fs::write(local, data)?;
    info!("saved {}", local);
    Ok(())
}

async fn push(
    client: &peerfs_daemon::FsClient,
    local: &str,
    remote: Option<&str>,
) -> Result<(), FsError> {
    let data = std::fs::read(local)?;
    let name = Path::new(local).file_name().and_then(|n| n.to_str()).unwrap_or(local);
    let remote = remote.map(str::to_string).unwrap_or_else(|| format!("/{}", name));
    client.write_file(&remote, &data).await?;
    info!("wrote {}", remote);
    Ok(())
}

async fn ls(client: &peerfs_daemon::FsClient, path: &str) -> Result<(), FsError> {
    for entry in client.read_dir(path).await? {
        let marker = if entry.is_dir() { "d" } else { "-" };
        println!("{}\t{}\t{}\t{}", marker, entry.size, entry.kind, entry.name);
    }
    Ok(())
}
