//! Backpack Pool Bot Library
//!
//! Drives pools of Backpack exchange sub-accounts through an automated
//! rebalancing strategy:
//!
//! 1. **Exchange client**: Ed25519-signed REST operations, tunnelled
//!    through per-account SOCKS5 proxies with bounded retry and proxy
//!    rotation on transport failure.
//! 2. **Valuation & sizing**: USD-equivalent balances from live
//!    tickers, order quantities truncated to the precision the order
//!    book implies.
//! 3. **Pool strategy**: one tick per sub-account per cycle — skip
//!    when balanced, reset partial positions, top up thin accounts,
//!    open randomized-side positions with a descending notional ladder.

pub mod config;
pub mod db;
pub mod exchange;
pub mod sizing;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use db::{AccountDirectory, SqliteDirectory};
pub use exchange::{BackpackClient, ExchangeError};
pub use strategy::{PoolRunner, SubAccountStrategy};
pub use types::{OrderDraft, Side};
