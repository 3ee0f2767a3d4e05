//! corerpc - RPC server and client
//!
//! Serves the built-in `Arith` service, or calls one of its methods on a
//! running server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use corerpc::arith::{Arith, Args};
use corerpc::codec::CodecType;
use corerpc::config::{self, Config};
use corerpc::network::{Client, Server};

/// corerpc - asynchronous RPC over TCP
#[derive(Parser)]
#[command(name = "corerpc")]
#[command(version = "0.1.0")]
#[command(about = "Serve or call RPC methods over TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server exposing the Arith service
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Call an Arith method on a server
    Call {
        /// Server address (host or host:port)
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Method to invoke, e.g. Arith.Sum
        #[arg(short, long, default_value = "Arith.Sum")]
        method: String,

        /// First operand
        #[arg(allow_negative_numbers = true)]
        a: i64,

        /// Second operand
        #[arg(allow_negative_numbers = true)]
        b: i64,

        /// Codec to negotiate (bincode or json)
        #[arg(long)]
        codec: Option<CodecType>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            run_server(config, port, bind).await?;
        }
        Commands::Call {
            server,
            method,
            a,
            b,
            codec,
        } => {
            run_call(config, server, method, Args::new(a, b), codec).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Serve the Arith service until Ctrl+C
async fn run_server(config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.server.port);
    let bind = bind.unwrap_or_else(|| config.server.bind_address.clone());

    let server = Server::new(config.network_config());
    server.register(Arith)?;

    tracing::info!("Starting corerpc server on {}:{}", bind, port);

    tokio::select! {
        result = server.serve((bind.as_str(), port)) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Dial a server, make one call and print the reply
async fn run_call(
    config: Config,
    server: String,
    method: String,
    args: Args,
    codec: Option<CodecType>,
) -> anyhow::Result<()> {
    let addr = if server.contains(':') {
        server
    } else {
        format!("{}:{}", server, config.server.port)
    };

    let mut option = config.handshake_option();
    if let Some(codec) = codec {
        option = option.with_codec_type(codec);
    }

    tracing::debug!("Connecting to {} using {}", addr, option.codec_type);
    let client = Client::dial_timeout(
        addr.as_str(),
        option,
        std::time::Duration::from_millis(config.client.connect_timeout_ms),
    )
    .await?;

    let reply: i64 = client.call(&method, args).await?;
    println!("{}({}, {}) = {}", method, args.a, args.b, reply);

    client.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["corerpc", "call", "-m", "Arith.Mul", "6", "-7"]).unwrap();
        match cli.command {
            Commands::Call { method, a, b, codec, .. } => {
                assert_eq!(method, "Arith.Mul");
                assert_eq!((a, b), (6, -7));
                assert!(codec.is_none());
            }
            _ => panic!("expected call subcommand"),
        }

        let cli = Cli::try_parse_from(["corerpc", "serve", "--port", "7000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { port: Some(7000), .. }));
    }

    #[test]
    fn test_codec_argument() {
        let cli = Cli::try_parse_from(["corerpc", "call", "--codec", "json", "1", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Call { codec: Some(CodecType::Json), .. }
        ));
    }
}
