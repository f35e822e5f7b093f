use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use ptyshare::{client, server};

#[derive(Parser, Debug)]
#[command(author, version, about = "Share long-running shell sessions with many viewers.")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session broker.
    Serve(server::Args),
    /// List the sessions of a running broker.
    Sessions(client::SessionsArgs),
    /// Attach this terminal to a session.
    Attach(client::AttachArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Create ~/.ptyshare directory if it doesn't exist
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let ptyshare_dir = format!("{home_dir}/.ptyshare");
    std::fs::create_dir_all(&ptyshare_dir)?;

    // Only the broker logs to the console; the clients own the terminal
    let (log_path, console_output) = match &args.command {
        Commands::Serve(_) => (format!("{ptyshare_dir}/ptyshare.log"), true),
        Commands::Sessions(_) => (format!("{ptyshare_dir}/ptyshare-sessions.log"), false),
        Commands::Attach(_) => (format!("{ptyshare_dir}/ptyshare-attach.log"), false),
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;

    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    if console_output {
        use tracing_subscriber::fmt::writer::MakeWriterExt;
        let writer = std::io::stdout.and(log_file);

        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }

    match args.command {
        Commands::Serve(serve_args) => {
            info!("Starting ptyshare broker");
            server::run_server(serve_args).await
        }
        Commands::Sessions(sessions_args) => client::run_sessions(sessions_args).await,
        Commands::Attach(attach_args) => {
            info!("Starting ptyshare attach");
            client::run_attach(attach_args).await
        }
    }
}
