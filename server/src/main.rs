use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use confwatch_server::{db, grpc, storage, Authenticator};

#[derive(Parser)]
#[command(
    name = "confwatch-server",
    version,
    about = "Revisioned key-value store with prefix watches"
)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:2379")]
    listen: SocketAddr,

    /// SQLite database URL
    #[arg(long, default_value = "sqlite::memory:")]
    database: String,

    /// Require this username on every request
    #[arg(long, env = "CONFWATCH_USER", requires = "pass")]
    user: Option<String>,

    /// Password for --user
    #[arg(long, env = "CONFWATCH_PASS", requires = "user", hide_env_values = true)]
    pass: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confwatch_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let pool = db::init_pool(&args.database).await?;
    let storage = Arc::new(storage::Storage::open(pool).await?);

    let authenticator = match (args.user, args.pass) {
        (Some(user), Some(pass)) => Authenticator::with_credentials(user, pass),
        _ => Authenticator::open(),
    };
    let server = grpc::create_server(storage, authenticator);

    info!(addr = %args.listen, database = %args.database, "serving");
    Server::builder()
        .add_service(server)
        .serve_with_shutdown(args.listen, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
