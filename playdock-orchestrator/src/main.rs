use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use playdock_orchestrator::command_listener;
use playdock_orchestrator::provider_manager::ProviderManager;
use playdock_orchestrator::registry::{MemoryRegistry, PgRegistry, RegistryStore};
use playdock_orchestrator::{LifecycleService, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();

    let registry: Arc<dyn RegistryStore> = match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let pg = PgRegistry::new(pool);
            pg.run_migrations().await.context("failed to run migrations")?;
            info!("connected to Postgres registry");
            Arc::new(pg)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory registry");
            Arc::new(MemoryRegistry::new())
        }
    };

    let backends = ProviderManager::get_backends(&settings.provider, &settings)
        .with_context(|| format!("unsupported or unconfigured provider '{}'", settings.provider))?;
    info!(provider = %settings.provider, "backends ready");

    let service = Arc::new(LifecycleService::assemble(&settings, registry, backends));

    match &settings.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
            let svc = service.clone();
            tokio::spawn(async move {
                if let Err(e) = command_listener::run(client, svc).await {
                    error!("[bus] listener stopped: {}", e);
                }
            });
        }
        None => info!("REDIS_URL not set, command bus disabled"),
    }

    let app = Router::new().route("/", get(root));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.listen_port));
    info!("orchestrator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}

async fn root() -> &'static str {
    "ok"
}
