use anyhow::Context;
use pixmeter_api::{create_router, AppState, Config};
use pixmeter_billing::BillingService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pixmeter_shared::init_tracing("info,pixmeter_api=debug,pixmeter_billing=debug,tower_http=info");

    let config = Config::from_env().context("invalid configuration")?;

    let pool = pixmeter_shared::create_pool(&config.database_url, &config.pool_settings())
        .await
        .context("failed to connect to database")?;

    if config.run_migrations {
        let migration_pool = pixmeter_shared::create_migration_pool(&config.database_url)
            .await
            .context("failed to connect for migrations")?;
        pixmeter_shared::run_migrations(&migration_pool)
            .await
            .context("failed to run migrations")?;
        migration_pool.close().await;
        tracing::info!("Database migrations applied");
    }

    let billing = BillingService::from_env(pool.clone()).context("invalid billing configuration")?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool.clone(), billing);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Pixmeter API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    pool.close().await;
    tracing::info!("Pixmeter API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
