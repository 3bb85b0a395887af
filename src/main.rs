use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;

use tajwid_bot::channels::{CourseChannelRegistry, LogSink, MessageSink, TelegramClient};
use tajwid_bot::config::AppConfig;
use tajwid_bot::flow::FlowEngine;
use tajwid_bot::public::public_routes;
use tajwid_bot::scheduler::{self, AutomationScheduler};
use tajwid_bot::store::{Database, LibSqlBackend};
use tajwid_bot::subscription::{MembershipStatus, StaticOracle, SubscriptionOracle, TelegramOracle};
use tajwid_bot::webhook::{WebhookState, bot_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let port = config.server.http_port;

    eprintln!("📖 Tajwid Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Bot: @{}", config.bot.bot_username);
    eprintln!("   Webhook: http://0.0.0.0:{}/telegram/webhook", port);
    eprintln!("   Event API: http://0.0.0.0:{}/api/bot/updates", port);
    eprintln!("   Public API: http://0.0.0.0:{}/api/public/children", port);
    eprintln!("   Database: {}", config.server.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.server.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.server.db_path.display())
            })?,
    );

    // ── Transport and oracle ─────────────────────────────────────────────
    let registry = Arc::new(CourseChannelRegistry::new(
        config.bot.course_channel_id.clone(),
        config.bot.school_channel_id.clone(),
    ));

    let telegram = config.telegram.as_ref().map(|tg| {
        Arc::new(TelegramClient::new(tg.bot_token.clone(), tg.api_base_url.clone()))
    });

    let (oracle, sink): (Arc<dyn SubscriptionOracle>, Arc<dyn MessageSink>) = match &telegram {
        Some(client) => (
            Arc::new(TelegramOracle::new(
                Arc::clone(client),
                config.bot.school_channel_id.clone(),
                Arc::clone(&registry),
            )),
            Arc::clone(client) as Arc<dyn MessageSink>,
        ),
        None => {
            eprintln!("   Telegram: disabled (no TELEGRAM_BOT_TOKEN), messages go to the log");
            (
                Arc::new(StaticOracle::new(MembershipStatus::Subscribed)),
                Arc::new(LogSink),
            )
        }
    };

    // ── Engine and scheduler ─────────────────────────────────────────────
    let engine = Arc::new(FlowEngine::new(
        Arc::clone(&db),
        oracle,
        config.bot.clone(),
    ));

    let automation = Arc::new(AutomationScheduler::new(Arc::clone(&engine), Arc::clone(&db)));
    let _ticker = scheduler::spawn_ticker(
        automation,
        Arc::clone(&sink),
        config.bot.fallback_retry_interval(),
    );
    eprintln!(
        "   Automation: every {}s",
        config.bot.fallback_retry_interval().as_secs()
    );

    // ── Webhook registration ─────────────────────────────────────────────
    let webhook_secret = config
        .telegram
        .as_ref()
        .and_then(|tg| tg.webhook_secret.clone());
    if let (Some(client), Some(tg)) = (&telegram, &config.telegram) {
        if let Some(url) = &tg.webhook_url {
            if let Err(e) = client.set_webhook(url, webhook_secret.as_ref()).await {
                tracing::error!("Failed to register Telegram webhook: {}", e);
            }
        }
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = WebhookState {
        engine,
        sink,
        registry,
        telegram,
        secret: webhook_secret.map(Arc::new),
    };
    let app = bot_routes(state)
        .merge(public_routes(db))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!("HTTP server listening on port {}", port);
    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}
