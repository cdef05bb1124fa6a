use std::sync::Arc;

use anyhow::Context;

use crate::{config::Settings, db::SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SessionManager>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub async fn init(settings: Settings) -> anyhow::Result<Self> {
        let db = SessionManager::connect_with(&settings)
            .await
            .context("connect to database")?;
        Ok(Self::from_parts(db, settings))
    }

    pub fn from_parts(db: SessionManager, settings: Settings) -> Self {
        Self {
            db: Arc::new(db),
            settings: Arc::new(settings),
        }
    }

    /// State whose pool never connects until first used.
    #[cfg(test)]
    pub(crate) fn fake() -> Self {
        let settings = test_settings();
        let pool = crate::db::pool_options(&settings)
            .connect_lazy_with(crate::db::connect_options(&settings));
        Self::from_parts(SessionManager::from_pool(pool), settings)
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings::from_lookup(|key| {
        let value = match key {
            "DB_HOST" => "127.0.0.1",
            "DB_PORT" => "3306",
            "DB_USER" => "test",
            "DB_DATABASE" => "test",
            "APP_KEY" => "test-key",
            "FRONTEND_URL" => "https://app.example.com",
            "CORS_ORIGINS" => "https://admin.example.com",
            _ => return None,
        };
        Some(value.to_string())
    })
    .expect("test settings are valid")
}
