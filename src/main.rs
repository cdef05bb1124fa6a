use anyhow::Context;
use backend_skeleton::{app, config::Settings, error, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("load settings")?;
    init_tracing(&settings);
    error::install_panic_hook();

    let app_state = AppState::init(settings.clone()).await?;

    // Run migrations if present
    let pool = app_state.db.pool().await?;
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::warn!(error = %e, "migration failed; continuing");
    }

    let served = app::serve(app::build_app(app_state.clone()), &settings).await;

    if app_state.db.is_initialized().await {
        app_state.db.close().await?;
    }

    served
}

fn init_tracing(settings: &Settings) {
    let mut default_filter = String::from("backend_skeleton=debug,axum=info,tower_http=info");
    if settings.db_echo {
        default_filter.push_str(",sqlx::query=debug");
    }
    let env_filter = std::env::var("RUST_LOG").unwrap_or(default_filter);
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}
