//! Configuration management for the pool bot

use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Bot configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite account/proxy directory
    pub database_path: String,

    /// Exchange REST base URL (trailing slash expected)
    pub base_url: String,

    /// IP-info endpoint used to verify proxy egress
    pub ip_info_url: String,

    /// Transport retry settings
    pub retry: RetryConfig,

    /// Sub-account strategy settings
    pub strategy: StrategyConfig,

    /// Seconds between pool daemon cycles
    pub pool_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per request, rotation between them
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Perp symbols each sub-account should hold a position in
    pub symbols: Vec<String>,
    /// Leverage limit applied before opening positions
    pub leverage: u32,
    /// Top-up trigger: total USD value below this gets a deposit
    pub min_deposit_usd: Decimal,
    /// Sub-accounts holding at least this many open positions are
    /// balanced and skipped for the tick
    pub target_open_positions: usize,
    /// Descending notional fractions tried until an order is accepted
    pub notional_ladder: Vec<Decimal>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["ETH_USDC_PERP".to_string(), "SOL_USDC_PERP".to_string()],
            leverage: 50,
            min_deposit_usd: Decimal::from_str("0.1").unwrap(),
            target_open_positions: 2,
            notional_ladder: ["0.9", "0.8", "0.7", "0.6", "0.5"]
                .iter()
                .map(|s| Decimal::from_str(s).unwrap())
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "pool-bot.db".to_string());

        let base_url = env::var("BACKPACK_BASE_URL")
            .unwrap_or_else(|_| "https://api.backpack.exchange/".to_string());

        let ip_info_url =
            env::var("IP_INFO_URL").unwrap_or_else(|_| "https://ipinfo.io/json".to_string());

        let max_attempts = env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let delay_ms = env::var("RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let symbols: Vec<String> = env::var("POOL_SYMBOLS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| StrategyConfig::default().symbols);

        let leverage = env::var("POOL_LEVERAGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let min_deposit_usd = env::var("MIN_DEPOSIT_USD")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or_else(|| StrategyConfig::default().min_deposit_usd);

        let target_open_positions = env::var("TARGET_OPEN_POSITIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let pool_interval_seconds = env::var("POOL_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(45 * 60);

        // Validate configuration
        if symbols.is_empty() {
            anyhow::bail!("POOL_SYMBOLS must name at least one symbol");
        }
        if target_open_positions == 0 {
            anyhow::bail!("TARGET_OPEN_POSITIONS must be at least 1");
        }
        if max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_path,
            base_url,
            ip_info_url,
            retry: RetryConfig {
                max_attempts,
                delay_ms,
            },
            strategy: StrategyConfig {
                symbols,
                leverage,
                min_deposit_usd,
                target_open_positions,
                notional_ladder: StrategyConfig::default().notional_ladder,
            },
            pool_interval_seconds,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "pool-bot.db".to_string(),
            base_url: "https://api.backpack.exchange/".to_string(),
            ip_info_url: "https://ipinfo.io/json".to_string(),
            retry: RetryConfig::default(),
            strategy: StrategyConfig::default(),
            pool_interval_seconds: 45 * 60,
        }
    }
}
