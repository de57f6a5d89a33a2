//! Core types for the Backpack pool bot

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side. `Bid` buys (increases exposure), `Ask` sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Bid => "Bid",
            Side::Ask => "Ask",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Market => "Market",
            OrderKind::Limit => "Limit",
        }
    }
}

/// An order about to be submitted. The auto-leverage flags are
/// per-order policy: plain orders leave all four off, the strategy's
/// perp orders turn all four on.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub auto_borrow: bool,
    pub auto_borrow_repay: bool,
    pub auto_lend: bool,
    pub auto_lend_redeem: bool,
}

impl OrderDraft {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: None,
            auto_borrow: false,
            auto_borrow_repay: false,
            auto_lend: false,
            auto_lend_redeem: false,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
            auto_borrow: false,
            auto_borrow_repay: false,
            auto_lend: false,
            auto_lend_redeem: false,
        }
    }

    /// Turn on all four auto-borrow/auto-lend flags, for perp orders
    /// that may exceed the spot balance.
    pub fn auto_leveraged(mut self) -> Self {
        self.auto_borrow = true;
        self.auto_borrow_repay = true;
        self.auto_lend = true;
        self.auto_lend_redeem = true;
        self
    }
}

/// Spot balance of one token. The sum of the three is the quantity held.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBalance {
    pub available: Decimal,
    pub locked: Decimal,
    pub staked: Decimal,
}

impl TokenBalance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked + self.staked
    }
}

/// Token → balance map as returned by the capital endpoint.
pub type Balances = HashMap<String, TokenBalance>;

/// Net lending/borrowing exposure for one symbol. Quantities are
/// negative when borrowed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowLendPosition {
    pub symbol: String,
    pub net_exposure_quantity: Decimal,
    pub net_exposure_notional: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
}

/// One price level: `[price, quantity]` as decimal strings. The
/// quantity string is kept raw because its written exponent is the
/// market's required precision for the symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel(pub String, pub String);

impl BookLevel {
    pub fn price(&self) -> Option<Decimal> {
        self.0.parse().ok()
    }

    pub fn quantity_str(&self) -> &str {
        &self.1
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderBookDepth {
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    #[serde(default)]
    pub bids: Vec<BookLevel>,
}

impl OrderBookDepth {
    /// Best ask is the lowest; Backpack sorts asks ascending.
    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// Best bid is the highest; Backpack sorts bids ascending too.
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.last()
    }

    pub fn best_level(&self, side: Side) -> Option<&BookLevel> {
        match side {
            Side::Bid => self.best_bid(),
            Side::Ask => self.best_ask(),
        }
    }
}

/// Order-placement response. Only the fields the bot branches on are
/// typed; acceptance is signalled by the presence of `createdAt`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl OrderResponse {
    pub fn is_accepted(&self) -> bool {
        self.created_at.is_some()
    }
}

/// Open order record from the order query endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Open perpetual position. `net_quantity` is signed: negative = short.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpPosition {
    pub symbol: String,
    pub net_quantity: Decimal,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    #[serde(default)]
    pub pnl_unrealized: Option<Decimal>,
}

impl PerpPosition {
    /// Side of a market order that flattens this position.
    pub fn closing_side(&self) -> Side {
        if self.net_quantity < Decimal::ZERO {
            Side::Bid
        } else {
            Side::Ask
        }
    }
}

/// Withdrawal request parameters.
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub address: String,
    pub blockchain: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub two_factor_token: Option<String>,
    pub client_id: Option<String>,
    pub auto_borrow: bool,
    pub auto_lend_redeem: bool,
}

impl WithdrawalRequest {
    pub fn new(
        address: impl Into<String>,
        blockchain: impl Into<String>,
        symbol: impl Into<String>,
        quantity: Decimal,
    ) -> Self {
        Self {
            address: address.into(),
            blockchain: blockchain.into(),
            symbol: symbol.into(),
            quantity,
            two_factor_token: None,
            client_id: None,
            auto_borrow: false,
            auto_lend_redeem: false,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalResponse {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub blockchain: Option<String>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<serde_json::Value>,
}

/// Account settings, as read back from the account endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default)]
    pub leverage_limit: Option<Decimal>,
    #[serde(default)]
    pub auto_lend: Option<bool>,
    #[serde(default)]
    pub auto_borrow_settlements: Option<bool>,
    #[serde(default)]
    pub auto_repay_borrows: Option<bool>,
    #[serde(default)]
    pub futures_maker_fee: Option<Decimal>,
    #[serde(default)]
    pub futures_taker_fee: Option<Decimal>,
}

/// Account settings update. Leverage is optional; the three auto flags
/// default on, matching how farmed accounts are provisioned.
#[derive(Debug, Clone)]
pub struct AccountSettingsUpdate {
    pub leverage_limit: Option<u32>,
    pub auto_lend: bool,
    pub auto_borrow_settlements: bool,
    pub auto_repay_borrows: bool,
}

impl Default for AccountSettingsUpdate {
    fn default() -> Self {
        Self {
            leverage_limit: None,
            auto_lend: true,
            auto_borrow_settlements: true,
            auto_repay_borrows: true,
        }
    }
}

impl AccountSettingsUpdate {
    pub fn with_leverage(leverage: u32) -> Self {
        Self {
            leverage_limit: Some(leverage),
            ..Self::default()
        }
    }
}

/// Summary of a close-all sweep over open perp positions.
#[derive(Debug, Clone, Default)]
pub struct CloseAllSummary {
    pub closed: usize,
    pub total: usize,
    pub failed: Vec<CloseFailure>,
}

#[derive(Debug, Clone)]
pub struct CloseFailure {
    pub symbol: String,
    pub error: String,
}

/// Outcome of one market sale in a convert-to-USDC sweep.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub symbol: String,
    pub success: bool,
    pub order: Option<OrderResponse>,
    pub error: Option<String>,
}

/// One account's API keypair. The secret is the base64 Ed25519 seed.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub api_key: String,
    pub api_secret: String,
}

/// Anti-fingerprinting identity attached to an account: extra request
/// headers and cookies sent with every call. Maps may be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FakeIdentity {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
}

/// Egress check result: what the IP-info service saw through the proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyReport {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    /// Round-trip latency, measured client-side.
    #[serde(skip)]
    pub response_time_ms: u128,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Bid.opposite(), Side::Ask);
        assert_eq!(Side::Ask.opposite(), Side::Bid);
    }

    #[test]
    fn closing_side_opposes_position_sign() {
        let short = PerpPosition {
            symbol: "SOL_USDC_PERP".into(),
            net_quantity: dec!(-1.5),
            entry_price: None,
            mark_price: None,
            pnl_unrealized: None,
        };
        assert_eq!(short.closing_side(), Side::Bid);

        let long = PerpPosition { net_quantity: dec!(0.3), ..short };
        assert_eq!(long.closing_side(), Side::Ask);
    }

    #[test]
    fn best_levels_respect_book_ordering() {
        let depth: OrderBookDepth = serde_json::from_str(
            r#"{"bids": [["99.1", "0.5"], ["99.8", "1.2"]],
                "asks": [["100.2", "0.01"], ["100.9", "3.0"]]}"#,
        )
        .unwrap();

        assert_eq!(depth.best_bid().unwrap().price(), Some(dec!(99.8)));
        assert_eq!(depth.best_ask().unwrap().price(), Some(dec!(100.2)));
        assert_eq!(depth.best_level(Side::Ask).unwrap().quantity_str(), "0.01");
    }

    #[test]
    fn order_acceptance_tracks_created_at() {
        let accepted: OrderResponse =
            serde_json::from_str(r#"{"id": "abc", "createdAt": 1700000000000}"#).unwrap();
        assert!(accepted.is_accepted());

        let rejected: OrderResponse = serde_json::from_str(r#"{"id": "abc"}"#).unwrap();
        assert!(!rejected.is_accepted());
    }

    #[test]
    fn balances_parse_decimal_strings() {
        let balances: Balances = serde_json::from_str(
            r#"{"USDC": {"available": "10.5", "locked": "0", "staked": "0"}}"#,
        )
        .unwrap();
        assert_eq!(balances["USDC"].available, dec!(10.5));
        assert_eq!(balances["USDC"].total(), dec!(10.5));
    }
}
