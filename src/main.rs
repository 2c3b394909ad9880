//! CodePipe - Remote code execution over a TCP control pipe
//!
//! Drives code execution, object manipulation, and ad-hoc byte streams
//! inside a long-running remote process over a single TCP channel.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use codepipe::config::{self, Config};
use codepipe::executor::{ExecContext, NativeExecutor};
use codepipe::network::{PipeClient, PipeServer};

/// CodePipe - remote code execution and object proxying
#[derive(Parser)]
#[command(name = "codepipe")]
#[command(author = "CodePipe Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Drive code execution in a remote process over TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pipe address (overrides config and environment)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Pipe port (overrides config and environment)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipe server
    Serve,

    /// Execute source text on the server
    Exec {
        /// Source text to execute
        code: String,

        /// Capture output and print it after the call instead of
        /// relaying it live
        #[arg(long)]
        capture: bool,

        /// Do not forward remote output to this terminal
        #[arg(long)]
        no_forward: bool,
    },

    /// Print the server banner
    Banner,

    /// Ask the server to shut down
    Shutdown,

    /// Fetch a remote file
    Fetch {
        /// Remote source path
        remote: String,

        /// Local destination path
        local: PathBuf,
    },

    /// Push a local file to the server
    Push {
        /// Local source path
        local: PathBuf,

        /// Remote destination path
        remote: String,
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

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration; environment beats file, flags beat both.
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    config.apply_env();
    if let Some(address) = cli.address {
        config.pipe.address = address;
    }
    if let Some(port) = cli.port {
        config.pipe.port = port;
    }

    match cli.command {
        Commands::Serve => run_server(config).await?,
        Commands::Exec {
            code,
            capture,
            no_forward,
        } => {
            let client = PipeClient::new(config.endpoint()).with_forward(!no_forward);
            if capture {
                let output = client.exec_capture(&code).await?;
                print!("{}", output);
            } else {
                client.exec(&code).await?;
            }
        }
        Commands::Banner => {
            let client = PipeClient::new(config.endpoint());
            println!("{}", client.banner().await?);
        }
        Commands::Shutdown => {
            let client = PipeClient::new(config.endpoint());
            client.remote_shutdown().await?;
            tracing::info!("server at {} asked to shut down", config.endpoint());
        }
        Commands::Fetch { remote, local } => {
            let client = PipeClient::new(config.endpoint());
            let count = client.fetch_file(&remote, &local).await?;
            println!("{} bytes -> {}", count, local.display());
        }
        Commands::Push { local, remote } => {
            let client = PipeClient::new(config.endpoint());
            client.push_file(&local, &remote).await?;
            println!("{} -> {}", local.display(), remote);
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config();
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

/// Run the pipe server until a remote shutdown request arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let endpoint = config.endpoint();
    tracing::info!("starting pipe server on {}", endpoint);

    let server = PipeServer::bind(&endpoint, NativeExecutor::new(), ExecContext::new()).await?;

    println!("codepipe server listening on {}", server.local_addr());
    println!("Press Ctrl+C to stop, or send a remote_shutdown request.");

    tokio::select! {
        result = server.serve() => {
            result?;
            println!("codepipe server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    Ok(())
}
