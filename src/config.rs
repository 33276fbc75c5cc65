//! Runtime configuration loaded once at startup.
//!
//! All knobs come from environment variables with safe defaults (paper
//! trading, live disabled). Handlers and nodes receive `Settings` through
//! the shared `Deps` context; nothing re-reads the environment in hot paths.

use std::env;

pub const DEV_SECRET_KEY: &str = "dev-secret-key-change-in-production";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    /// Master kill for LIVE confirmations (default true: fail closed).
    pub trading_disable_live: bool,
    pub enable_live_trading: bool,
    pub execution_mode_default: String,
    pub execution_timeout_seconds: u64,
    pub max_notional_per_order_usd: f64,
    pub max_trades_per_run: i64,
    pub symbol_allowlist: Vec<String>,
    pub min_citations_required: usize,
    pub live_max_notional_usd: f64,
    pub force_paper_mode: bool,
    pub kill_switch_enabled: bool,
    pub api_secret_key: String,
    /// When true, dev header/query auth fallbacks are rejected.
    pub enable_strict_auth: bool,
    pub confirmation_ttl_seconds: i64,
    pub coinbase_api_base: String,
    pub coinbase_api_key: String,
    pub coinbase_api_secret: String,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,
    pub port: u16,
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let allowlist = env::var("SYMBOL_ALLOWLIST")
            .unwrap_or_else(|_| "BTC,ETH,SOL,AVAX,MATIC,DOGE,LTC".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:///execdesk.db".to_string()),
            trading_disable_live: env_bool("TRADING_DISABLE_LIVE", true),
            enable_live_trading: env_bool("ENABLE_LIVE_TRADING", false),
            execution_mode_default: env::var("EXECUTION_MODE_DEFAULT")
                .unwrap_or_else(|_| "PAPER".to_string()),
            execution_timeout_seconds: env_parse("EXECUTION_TIMEOUT_SECONDS", 600),
            max_notional_per_order_usd: env_parse("MAX_NOTIONAL_PER_ORDER_USD", 100.0),
            max_trades_per_run: env_parse("MAX_TRADES_PER_RUN", 1),
            symbol_allowlist: allowlist,
            min_citations_required: env_parse("MIN_CITATIONS_REQUIRED", 0),
            live_max_notional_usd: env_parse("LIVE_MAX_NOTIONAL_USD", 10.0),
            force_paper_mode: env_bool("FORCE_PAPER_MODE", false),
            kill_switch_enabled: env_bool("KILL_SWITCH_ENABLED", false),
            api_secret_key: env::var("API_SECRET_KEY")
                .unwrap_or_else(|_| DEV_SECRET_KEY.to_string()),
            enable_strict_auth: env_bool("ENABLE_STRICT_AUTH", false),
            confirmation_ttl_seconds: env_parse("CONFIRMATION_TTL_SECONDS", 300),
            coinbase_api_base: env::var("COINBASE_API_BASE")
                .unwrap_or_else(|_| "https://api.coinbase.com".to_string()),
            coinbase_api_key: env::var("COINBASE_API_KEY").unwrap_or_default(),
            coinbase_api_secret: env::var("COINBASE_API_SECRET").unwrap_or_default(),
            rate_limit_max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 120),
            rate_limit_window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", 60),
            port: env_parse("PORT", 8000),
        }
    }

    /// Resolve `DATABASE_URL` into a filesystem path.
    pub fn db_path(&self) -> String {
        let url = &self.database_url;
        if let Some(rest) = url.strip_prefix("sqlite:///") {
            rest.to_string()
        } else if let Some(rest) = url.strip_prefix("sqlite://") {
            rest.to_string()
        } else {
            url.clone()
        }
    }

    /// True when the dev auth fallbacks (X-Dev-Tenant header, ?tenant=
    /// query) are acceptable: strict auth off and the secret is still the
    /// development default.
    pub fn dev_auth_allowed(&self) -> bool {
        !self.enable_strict_auth && self.api_secret_key == DEV_SECRET_KEY
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path_strips_sqlite_scheme() {
        let mut s = Settings::from_env();
        s.database_url = "sqlite:///tmp/x.db".to_string();
        assert_eq!(s.db_path(), "tmp/x.db");
        s.database_url = "plain.db".to_string();
        assert_eq!(s.db_path(), "plain.db");
    }

    #[test]
    fn test_live_disabled_by_default() {
        let s = Settings::from_env();
        assert!(s.trading_disable_live || std::env::var("TRADING_DISABLE_LIVE").is_ok());
    }
}
