use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub accounts_file: String,
    pub port: u16,
    pub master_user_id: String,
    pub poll_interval_secs: u64,
    pub dry_run: bool,
    pub index_lot_size: i64,
    pub entry_margin_threshold: f64,
    pub entry_grace_secs: u64,
    pub kite_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./mirrorbot.db".to_string());

        let accounts_file =
            std::env::var("ACCOUNTS_FILE").unwrap_or_else(|_| "./accounts.json".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .unwrap_or(8000);

        let master_user_id =
            std::env::var("MASTER_USER_ID").unwrap_or_else(|_| "MASTER123".to_string());

        let poll_interval_secs = std::env::var("POLL_INTERVAL")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        // Real order placement must be opted into explicitly.
        let dry_run = std::env::var("DRY_RUN")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let index_lot_size = std::env::var("INDEX_LOT_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(65);

        let entry_margin_threshold = std::env::var("ENTRY_MARGIN_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|&v| v >= 0.0)
            .unwrap_or(500.0);

        let entry_grace_secs = std::env::var("ENTRY_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);

        let kite_base_url = std::env::var("KITE_BASE_URL")
            .unwrap_or_else(|_| crate::broker::kite::DEFAULT_API_BASE.to_string());

        Ok(Self {
            database_path,
            accounts_file,
            port,
            master_user_id,
            poll_interval_secs,
            dry_run,
            index_lot_size,
            entry_margin_threshold,
            entry_grace_secs,
            kite_base_url,
        })
    }
}

/// One configured account, as listed in the accounts file.
///
/// `capital` seeds the stored equity until the broker login callback
/// refreshes it with a live figure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default)]
    pub capital: f64,
    #[serde(default)]
    pub max_capital_usage: f64,
}

/// Load the configured accounts from a JSON file.
pub fn load_account_configs(path: &Path) -> Result<Vec<AccountConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read accounts file {}", path.display()))?;
    let configs: Vec<AccountConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse accounts file {}", path.display()))?;
    Ok(configs)
}
