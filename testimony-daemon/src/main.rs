use clap::Parser;
use testimony_daemon::{config, listener};
use tracing_subscriber::EnvFilter;

/// Testimony: a local multiplexer for a shared packet capture ring.
#[derive(Parser, Debug)]
#[command(name = "testimonyd", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: std::path::PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

fn init_tracing(verbose: u8, quiet: u8) {
    let default_level = match verbose as i16 - quiet as i16 {
        i16::MIN..=-1 => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    let cfg = config::Config::load(&args.config)?;
    if cfg.sockets.is_empty() {
        anyhow::bail!("configuration has no [[socket]] tables");
    }

    let mut listeners = Vec::with_capacity(cfg.sockets.len());
    for socket_cfg in cfg.sockets {
        let path = socket_cfg.path.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(err) = listener::serve(socket_cfg).await {
                tracing::error!(path = %path.display(), error = %err, "listener exited");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");
    for handle in listeners {
        handle.abort();
    }
    Ok(())
}
