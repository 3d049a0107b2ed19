use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use titan_gateway_rs::api;
use titan_gateway_rs::config::Settings;
use titan_gateway_rs::context::GatewayContext;
use titan_gateway_rs::exchange::adapter::BackendAdapter;
use titan_gateway_rs::exchange::simulated::SimulatedAdapter;
use titan_gateway_rs::gateway::Gateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load environment variables
    dotenv::dotenv().ok();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if settings.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               TITAN GATEWAY RS                                ║");
    info!("║               Multi-Broker Request Gateway                    ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    // No live broker clients ship with this binary; every configured account
    // is backed by a paper adapter.
    let gateway = match Gateway::from_settings(&settings, GatewayContext::new_system(), |backend, account| {
        warn!(
            backend = %backend,
            adapter_id = %account.adapter_id,
            "⚠️ Using simulated adapter"
        );
        let client: Arc<dyn BackendAdapter> =
            Arc::new(SimulatedAdapter::new(backend.clone(), account.account_id.clone()));
        client
    }) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!("❌ Failed to build gateway: {}", e);
            std::process::exit(1);
        }
    };

    gateway.start();
    for pool in gateway.pool_health() {
        info!(
            backend = %pool.backend,
            status = ?pool.status,
            adapters = pool.adapters.len(),
            "✅ Pool ready"
        );
    }

    // --- API Server ---
    let bind_address = format!("0.0.0.0:{}", settings.server.port);
    info!("🚀 Starting API Server on {}", bind_address);

    let gateway_for_api = gateway.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(gateway_for_api.clone()))
            .configure(api::config)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    info!("API server stopped, draining gateway");
    gateway.shutdown().await;

    Ok(())
}
