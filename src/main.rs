use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use petdispatch::admin::AdminService;
use petdispatch::auth::TokenAuthority;
use petdispatch::config::Config;
use petdispatch::dispatch::{Dispatcher, Mailer, StaticBaseUrl};
use petdispatch::engine::{Engine, EngineDeps, SystemClock};
use petdispatch::http::{self, AppState};
use petdispatch::mailer::{LogMailer, WebhookMailer};
use petdispatch::notify::InboxHub;
use petdispatch::seed::SeedFile;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    petdispatch::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;

    let seed = config.seed_file.as_deref().map(SeedFile::load).transpose()?;
    let regions = seed.as_ref().map(SeedFile::directory).unwrap_or_default();
    if regions.is_empty() {
        warn!("no postal areas loaded; eligibility falls back to region names only");
    }

    let mailer: Arc<dyn Mailer> = match &config.mail_webhook_url {
        Some(url) => Arc::new(WebhookMailer::new(url.clone(), config.dispatch_timeout)?),
        None => Arc::new(LogMailer),
    };
    let dispatcher = Dispatcher::new(
        mailer,
        Arc::new(InboxHub::new()),
        Arc::new(StaticBaseUrl(config.public_base_url.clone())),
        config.dispatcher_settings(),
    );

    let engine = Arc::new(Engine::open(
        config.wal_path(),
        config.engine_settings(),
        EngineDeps {
            clock: Arc::new(SystemClock),
            regions: Arc::new(regions),
            dispatcher: Arc::new(dispatcher),
        },
    )?);

    if let Some(seed) = seed {
        seed.apply(&engine).await?;
    }

    tokio::spawn(petdispatch::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let tokens = TokenAuthority::new(config.admin_tokens.iter().cloned());
    if tokens.is_empty() {
        warn!("no admin tokens configured; every admin request will be rejected");
    }
    let app = http::router(AppState {
        admin: Arc::new(AdminService::new(engine)),
        tokens: Arc::new(tokens),
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("petdispatch listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  dispatch: {:?}", config.dispatch_mode);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("petdispatch stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
