use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use confwatch::{GrpcStore, KeySpace, StoreConfig, DEFAULT_ENDPOINT};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "confwatch", version, about = "Write configuration values and follow them live")]
struct Cli {
    /// Comma separated store endpoints
    #[arg(long, env = "EX_ENDPOINTS", default_value = DEFAULT_ENDPOINT)]
    endpoints: String,

    /// Username for the store
    #[arg(long, env = "EX_USER", requires = "pass")]
    user: Option<String>,

    /// Password for --user
    #[arg(long, env = "EX_PASS", requires = "user", hide_env_values = true)]
    pass: Option<String>,

    /// Seconds to wait for the connection and credential check
    #[arg(long, default_value_t = 5)]
    dial_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set a configuration variable of a server
    Config {
        server: String,
        variable: String,
        value: String,
    },
    /// Remove a configuration variable of a server
    Unset { server: String, variable: String },
    /// Print a server's configuration now and after every change
    Server { server: String },
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::from_endpoint_list(&self.endpoints)
            .dial_timeout(Duration::from_secs(self.dial_timeout));
        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            config = config.credentials(user, pass);
        }
        config
    }
}

async fn run(cli: Cli) -> Result<(), confwatch_cli::Error> {
    let store = GrpcStore::connect(&cli.store_config()).await?;
    let keys = KeySpace::default();
    let mut out = io::stdout().lock();

    match cli.command {
        Command::Config {
            server,
            variable,
            value,
        } => {
            confwatch_cli::config(store, &keys, &server, &variable, &value, &mut out).await?;
        }
        Command::Unset { server, variable } => {
            confwatch_cli::unset(store, &keys, &server, &variable, &mut out).await?;
        }
        Command::Server { server } => {
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            info!("interrupted");
                            cancel.cancel();
                        }
                        Err(e) => error!(error = %e, "cannot listen for ctrl-c"),
                    }
                }
            });

            confwatch_cli::server(store, &keys, &server, cancel, &mut out).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confwatch=info,confwatch_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "confwatch failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
