use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use leadai::api::{AppState, app_routes};
use leadai::compose::TemplateComposer;
use leadai::config::AppConfig;
use leadai::pipeline::{
    CampaignEngine, CampaignRunner, Dispatcher, Governor, MetricsHub, Route, SuppressionList,
    spawn_ticker,
};
use leadai::store::{Database, LibSqlBackend};
use leadai::transport::SmtpMailer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "leadai.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📨 LeadAI v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Transport routes ─────────────────────────────────────────────────
    let profiles = config.load_profiles().context("Invalid transport profiles")?;
    let mut routes = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let profile = Arc::new(profile);
        let mailer = SmtpMailer::new(Arc::clone(&profile))
            .with_context(|| format!("Failed to build SMTP transport for {}", profile.id))?;
        let mut route = Route::from_profile(&profile, Arc::new(Dispatcher::new(Arc::new(mailer))));
        if route.rate_limit.is_none()
            && let Some(limit) = config.rate_limit
        {
            route = route.with_rate_limit(limit);
        }
        eprintln!("   Profile: {} ({}:{})", profile.id, profile.host, profile.port);
        routes.push(route);
    }
    if routes.is_empty() {
        eprintln!("   Transport: none configured, campaigns are simulated");
    }

    // ── Pipeline ─────────────────────────────────────────────────────────
    let suppressions = Arc::new(SuppressionList::new());
    let metrics = MetricsHub::new();
    let runner = CampaignRunner::new(
        Arc::clone(&db),
        Arc::clone(&suppressions),
        Arc::new(Governor::new()),
        Arc::clone(&metrics),
    )
    .with_workers(config.workers)
    .with_retry_policy(config.retry)
    .with_tracking_base_url(config.tracking_base_url.clone());
    let engine = Arc::new(CampaignEngine::new(runner, routes));

    let loaded = engine.load_suppressions().await?;
    let recovered = engine.recover().await?;
    eprintln!("   Suppressions: {loaded} loaded");
    if recovered > 0 {
        eprintln!("   Recovered {recovered} interrupted campaigns");
    }

    let _ticker = spawn_ticker(Arc::clone(&engine), config.tick_interval);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let state = AppState {
        db,
        engine,
        metrics,
        suppressions,
        composer: Arc::new(TemplateComposer::default()),
        default_tenant: config.default_tenant.clone(),
    };
    let app = app_routes(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);
    eprintln!("   Metrics WS: ws://0.0.0.0:{}/ws/metrics\n", config.http_port);
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
