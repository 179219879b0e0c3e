use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use livestylist::config::Config;
use livestylist::entitlement::RevenueCat;
use livestylist::gateway::{self, AppState, GatewayRateLimiter};
use livestylist::gemini::preview::GeminiPreview;
use livestylist::gemini::summary::GeminiSummary;
use livestylist::gemini::vision::GeminiVision;
use livestylist::gemini::GeminiClient;
use livestylist::live::gemini::GeminiLiveConnector;
use livestylist::session::SessionRegistry;
use livestylist::store::SqliteStore;

/// Real-time AI stylist backend.
#[derive(Debug, Parser)]
#[command(name = "livestylist", version, about)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path (overrides DATABASE_PATH).
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livestylist=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    let config = Arc::new(config);

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    tracing::info!(path = %config.database_path, "database ready");

    let http = reqwest::Client::new();
    let gemini = GeminiClient::new(http.clone(), config.gemini_api_key.clone());

    let registry = SessionRegistry::new(
        store.clone(),
        config.session_duration_secs,
        config.session_warning_secs,
    );

    let state = AppState {
        config: Arc::clone(&config),
        registry,
        store,
        entitlement: Arc::new(RevenueCat::new(http, config.revenuecat_api_key.clone())),
        connector: Arc::new(GeminiLiveConnector::new(
            config.gemini_api_key.clone(),
            config.gemini_model.clone(),
        )),
        vision: Arc::new(GeminiVision::new(gemini.clone())),
        previewer: Arc::new(GeminiPreview::new(gemini.clone())),
        summarizer: Arc::new(GeminiSummary::new(gemini)),
        rate_limiter: Arc::new(GatewayRateLimiter::new()),
    };

    gateway::run_server(&cli.host, state).await
}
