//! lindex: line-protocol search server

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lindex::{
    client::Client,
    config::{Config, LogFormat},
    daemon::{Daemon, Status},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lindex")]
#[command(about = "Line-protocol search server with multi-endpoint fan-out")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "lindex.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Send protocol lines to a running server and print the replies.
    /// Reads lines from stdin when none are given.
    Send {
        /// Server address (defaults to the configured listen address)
        #[arg(short, long)]
        server: Option<String>,

        /// Request lines, e.g. "USING books" "SEARCH dune"
        lines: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    if let Some(data_dir) = cli.data_dir {
        config.server.data_dir = data_dir;
    }

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Start { listen } => start_server(config, listen).await,
        Commands::Init { path } => init_config(path),
        Commands::Send { server, lines } => {
            let addr = server.unwrap_or_else(|| config.server.listen_addr.clone());
            send_lines(&addr, lines, config.server.connect_timeout()).await
        }
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &Config, verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter_directive(verbose)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn start_server(mut config: Config, listen: Option<String>) -> Result<()> {
    if let Some(addr) = listen {
        config.server.listen_addr = addr;
    }
    config.validate()?;

    let daemon = Daemon::start(config).await?;
    info!("Accepting connections on {}", daemon.local_addr()?);
    daemon.run().await
}

fn init_config(path: PathBuf) -> Result<()> {
    let config_path = path.join("lindex.toml");
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }

    Config::default().save(&config_path)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

async fn send_lines(addr: &str, lines: Vec<String>, timeout: Duration) -> Result<()> {
    let mut client = Client::connect_timeout(addr, timeout)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    if let Some(banner) = client.banner() {
        eprintln!("{}", banner);
    }

    if !lines.is_empty() {
        for line in lines {
            if !send_one(&mut client, &line).await? {
                break;
            }
        }
        return Ok(());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if !send_one(&mut client, &line).await? {
            break;
        }
    }
    Ok(())
}

/// Print one reply. Returns false once the server said goodbye.
async fn send_one(client: &mut Client, line: &str) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }
    let reply = client.send(line).await?;
    for comment in &reply.comments {
        println!("# {}", comment);
    }
    for payload in &reply.lines {
        println!("{}", payload);
    }
    println!("{}", reply.status.encode());
    Ok(!matches!(reply.status, Status::Bye))
}
