//! API server configuration

use findco_billing::{BillingConfig, EmailConfig};

use crate::error::{ApiError, ApiResult};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Apply pending migrations from `migrations/` at startup
    pub run_migrations: bool,
    pub billing: BillingConfig,
    pub email: EmailConfig,
}

impl Config {
    pub fn from_env() -> ApiResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ApiError::Configuration("DATABASE_URL must be set".to_string()))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            bind_address,
            run_migrations,
            billing: BillingConfig::from_env(),
            email: EmailConfig::from_env(),
        })
    }
}
