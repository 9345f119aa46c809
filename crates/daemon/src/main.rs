use anyhow::Context;
use clap::Parser;
use gatekeeper::api::{self, AppState};
use gatekeeper::config::Args;
use gatekeeper::{db, reconcile};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = args.pool_config()?;

    let db_path = args.db_path();
    info!("Using database: {}", db_path.display());
    let mut conn = db::init_db(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    if args.seed_pool {
        reconcile::seed_pool(&mut conn, &config)?;
    }

    info!(
        start = config.range.start(),
        end = config.range.end(),
        ports = config.range.size(),
        release_ownership = ?config.release_ownership,
        "port pool configured"
    );

    let app = api::router(AppState::new(conn, config));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Listening on {}", args.listen);
    axum::serve(listener, app).await?;
    Ok(())
}
