//! Typed Backpack exchange operations
//!
//! Each operation builds its parameter set, names its signing
//! instruction, calls through transport+retry, and validates the JSON
//! into a typed record. The instruction labels must match the
//! exchange's verification table exactly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use reqwest::Method;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::{Config, RetryConfig};
use crate::db::{AccountDirectory, ProxyBinding};
use crate::sizing::fallback_precision;
use crate::types::{
    AccountInfo, AccountSettingsUpdate, Balances, BorrowLendPosition, CloseAllSummary,
    CloseFailure, ConversionOutcome, FakeIdentity, OpenOrder, OrderBookDepth, OrderDraft,
    OrderKind, OrderResponse, PerpPosition, ProxyReport, Side, Ticker, WithdrawalRequest,
    WithdrawalResponse,
};

use super::error::ExchangeError;
use super::retry::with_proxy_rotation;
use super::signer::RequestSigner;
use super::transport::Transport;

/// One account's view of the exchange.
pub struct BackpackClient {
    account_id: i64,
    country: Option<String>,
    signer: RequestSigner,
    transport: Transport,
    directory: Arc<dyn AccountDirectory>,
    retry: RetryConfig,
    ip_info_url: String,
}

impl BackpackClient {
    /// Build a client from the directory: credential, bound proxy and
    /// fake identity are all looked up here, once.
    pub async fn connect(
        directory: Arc<dyn AccountDirectory>,
        account_id: i64,
        config: &Config,
    ) -> Result<Self, ExchangeError> {
        let credential = directory
            .find_credential(account_id)
            .await
            .map_err(directory_error)?
            .ok_or_else(|| {
                ExchangeError::Unexpected(format!("account {account_id} has no credential"))
            })?;
        let country = directory
            .find_account(account_id)
            .await
            .map_err(directory_error)?
            .and_then(|account| account.country);
        let proxy = directory
            .find_active_proxy(account_id)
            .await
            .map_err(directory_error)?;
        let identity: FakeIdentity = directory
            .find_fake_identity(account_id)
            .await
            .map_err(directory_error)?
            .unwrap_or_default();

        if let Some(ref proxy) = proxy {
            debug!("Account {account_id}: using proxy {}", proxy.url());
        }

        let signer = RequestSigner::new(&credential.api_key, &credential.api_secret)?;
        let transport = Transport::new(&config.base_url, identity, proxy.map(|p| p.url()));

        Ok(Self {
            account_id,
            country,
            signer,
            transport,
            directory,
            retry: config.retry.clone(),
            ip_info_url: config.ip_info_url.clone(),
        })
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub async fn proxy_url(&self) -> Option<String> {
        self.transport.proxy_url().await
    }

    // ---- capital ----

    pub async fn get_balances(&self) -> Result<Balances, ExchangeError> {
        let value = self
            .signed(Method::GET, "api/v1/capital", "balanceQuery", None)
            .await?;
        parse(value)
    }

    pub async fn get_borrow_lend_positions(&self) -> Result<Vec<BorrowLendPosition>, ExchangeError> {
        let value = self
            .signed(
                Method::GET,
                "api/v1/borrowLend/positions",
                "borrowLendPositionQuery",
                None,
            )
            .await?;
        parse(value)
    }

    /// Per-token total holdings: spot (available+locked+staked) plus
    /// net lending exposure. Exposure can drag a total negative.
    pub async fn get_total_token_quantities(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let balances = self.get_balances().await?;
        let positions = self.get_borrow_lend_positions().await?;

        let mut totals: HashMap<String, Decimal> = balances
            .iter()
            .map(|(symbol, balance)| (symbol.clone(), balance.total()))
            .collect();
        for position in positions {
            *totals.entry(position.symbol.clone()).or_default() += position.net_exposure_quantity;
        }
        Ok(totals)
    }

    pub async fn request_withdrawal(
        &self,
        request: &WithdrawalRequest,
    ) -> Result<WithdrawalResponse, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("address".to_string(), json!(request.address));
        params.insert("blockchain".to_string(), json!(request.blockchain));
        params.insert("symbol".to_string(), json!(request.symbol));
        params.insert("quantity".to_string(), json!(request.quantity.to_string()));
        params.insert("autoBorrow".to_string(), json!(request.auto_borrow));
        params.insert(
            "autoLendRedeem".to_string(),
            json!(request.auto_lend_redeem),
        );
        if let Some(ref token) = request.two_factor_token {
            params.insert("twoFactorToken".to_string(), json!(token));
        }
        if let Some(ref client_id) = request.client_id {
            params.insert("clientId".to_string(), json!(client_id));
        }

        let value = self
            .signed(
                Method::POST,
                "wapi/v1/capital/withdrawals",
                "withdraw",
                Some(params),
            )
            .await?;
        parse(value)
    }

    // ---- orders & positions ----

    pub async fn create_order(&self, draft: &OrderDraft) -> Result<OrderResponse, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), json!(draft.symbol));
        params.insert("side".to_string(), json!(draft.side.as_str()));
        params.insert("orderType".to_string(), json!(draft.kind.as_str()));
        params.insert("quantity".to_string(), json!(draft.quantity.to_string()));

        match draft.kind {
            OrderKind::Limit => {
                let price = draft.price.ok_or_else(|| {
                    ExchangeError::Unexpected("limit order requires a price".to_string())
                })?;
                params.insert("price".to_string(), json!(price.to_string()));
                params.insert("timeInForce".to_string(), json!("GTC"));
                params.insert("postOnly".to_string(), json!(false));
                params.insert("reduceOnly".to_string(), json!(false));
            }
            OrderKind::Market => {
                params.insert("autoBorrow".to_string(), json!(draft.auto_borrow));
                params.insert(
                    "autoBorrowRepay".to_string(),
                    json!(draft.auto_borrow_repay),
                );
                params.insert("autoLend".to_string(), json!(draft.auto_lend));
                params.insert(
                    "autoLendRedeem".to_string(),
                    json!(draft.auto_lend_redeem),
                );
            }
        }

        let value = self
            .signed(Method::POST, "api/v1/order", "orderExecute", Some(params))
            .await?;
        parse(value)
    }

    pub async fn get_open_orders(
        &self,
        market_type: &str,
        symbol: Option<&str>,
    ) -> Result<Vec<OpenOrder>, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("marketType".to_string(), json!(market_type));
        if let Some(symbol) = symbol {
            params.insert("symbol".to_string(), json!(symbol));
        }
        let value = self
            .signed(Method::GET, "api/v1/orders", "orderQueryAll", Some(params))
            .await?;
        parse(value)
    }

    pub async fn get_open_positions(&self) -> Result<Vec<PerpPosition>, ExchangeError> {
        let value = self
            .signed(Method::GET, "api/v1/position", "positionQuery", None)
            .await?;
        parse(value)
    }

    /// Flatten every open perp position with one market order each,
    /// collecting per-symbol failures instead of aborting on the first.
    pub async fn close_all_perp_positions(&self) -> Result<CloseAllSummary, ExchangeError> {
        let positions = self.get_open_positions().await?;
        let mut summary = CloseAllSummary {
            total: positions.len(),
            ..Default::default()
        };

        for position in positions {
            if position.net_quantity.is_zero() {
                continue;
            }
            let draft = OrderDraft::market(
                position.symbol.clone(),
                position.closing_side(),
                position.net_quantity.abs(),
            );
            match self.create_order(&draft).await {
                Ok(order) if order.id.is_some() => summary.closed += 1,
                Ok(order) => summary.failed.push(CloseFailure {
                    symbol: position.symbol,
                    error: format!("order not accepted: {:?}", order.status),
                }),
                Err(e) => summary.failed.push(CloseFailure {
                    symbol: position.symbol,
                    error: e.to_string(),
                }),
            }
        }
        Ok(summary)
    }

    // ---- account ----

    pub async fn get_account(&self) -> Result<AccountInfo, ExchangeError> {
        let value = self
            .signed(Method::GET, "api/v1/account", "accountQuery", None)
            .await?;
        parse(value)
    }

    /// Fire-and-forget settings update; the endpoint returns no body.
    pub async fn update_account_settings(
        &self,
        update: &AccountSettingsUpdate,
    ) -> Result<(), ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert(
            "autoBorrowSettlements".to_string(),
            json!(update.auto_borrow_settlements),
        );
        params.insert("autoLend".to_string(), json!(update.auto_lend));
        params.insert(
            "autoRepayBorrows".to_string(),
            json!(update.auto_repay_borrows),
        );
        if let Some(leverage) = update.leverage_limit {
            params.insert("leverageLimit".to_string(), json!(leverage.to_string()));
        }

        self.signed(Method::PATCH, "api/v1/account", "accountUpdate", Some(params))
            .await?;
        Ok(())
    }

    /// Market-sell every non-USDC token with a positive total. Uses the
    /// static precision fallback since no book is consulted here, and a
    /// small random delay between sales.
    pub async fn convert_all_to_usdc(&self) -> Result<Vec<ConversionOutcome>, ExchangeError> {
        let totals = self.get_total_token_quantities().await?;
        let mut outcomes = Vec::new();

        for (symbol, amount) in totals {
            if symbol == "USDC" || amount <= Decimal::ZERO {
                continue;
            }
            let quantity = amount
                .round_dp_with_strategy(fallback_precision(&symbol), RoundingStrategy::ToZero);
            if quantity <= Decimal::ZERO {
                continue;
            }

            let jitter_ms: u64 = {
                use rand::Rng;
                rand::thread_rng().gen_range(0..5000)
            };
            sleep(Duration::from_millis(jitter_ms)).await;

            let draft = OrderDraft::market(format!("{symbol}_USDC"), Side::Ask, quantity);
            match self.create_order(&draft).await {
                Ok(order) => outcomes.push(ConversionOutcome {
                    symbol,
                    success: order.id.is_some(),
                    order: Some(order),
                    error: None,
                }),
                Err(e) => outcomes.push(ConversionOutcome {
                    symbol,
                    success: false,
                    order: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(outcomes)
    }

    // ---- public market data (unsigned) ----

    pub async fn get_order_book_depth(&self, symbol: &str) -> Result<OrderBookDepth, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), json!(symbol));
        let value = self.public(Method::GET, "api/v1/depth", Some(params)).await?;
        parse(value)
    }

    pub async fn get_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let value = self.public(Method::GET, "api/v1/tickers", None).await?;
        parse(value)
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), json!(symbol.to_uppercase()));
        let value = self.public(Method::GET, "api/v1/ticker", Some(params)).await?;
        parse(value)
    }

    // ---- proxy management ----

    /// Verify the bound proxy actually routes traffic: ask the IP-info
    /// service what egress it sees and time the round trip.
    pub async fn check_proxy(&self) -> Result<ProxyReport, ExchangeError> {
        let (value, elapsed_ms) = self.transport.probe(&self.ip_info_url).await?;
        let mut report: ProxyReport = parse(value)?;
        report.response_time_ms = elapsed_ms;
        Ok(report)
    }

    /// Release the bound proxy and claim a fresh one, preferring the
    /// account's country. The release commits even when nothing is free,
    /// in which case the client continues without a proxy and
    /// `NoFreeProxy` is surfaced to the caller.
    pub async fn change_proxy(&self) -> Result<ProxyBinding, ExchangeError> {
        if let Some(active) = self
            .directory
            .find_active_proxy(self.account_id)
            .await
            .map_err(directory_error)?
        {
            self.directory
                .release_proxy(active.id)
                .await
                .map_err(directory_error)?;
            debug!(
                "Account {}: released proxy {} ({})",
                self.account_id,
                active.id,
                active.url()
            );
        }

        match self
            .directory
            .claim_free_proxy(self.account_id, self.country.as_deref())
            .await
            .map_err(directory_error)?
        {
            Some(binding) => {
                info!(
                    "Account {}: bound proxy {} ({})",
                    self.account_id,
                    binding.id,
                    binding.url()
                );
                self.transport.set_proxy(Some(binding.url())).await;
                Ok(binding)
            }
            None => {
                self.transport.set_proxy(None).await;
                Err(ExchangeError::NoFreeProxy {
                    account_id: self.account_id,
                })
            }
        }
    }

    // ---- plumbing ----

    async fn signed(
        &self,
        method: Method,
        endpoint: &str,
        instruction: &str,
        params: Option<BTreeMap<String, Value>>,
    ) -> Result<Value, ExchangeError> {
        with_proxy_rotation(
            &self.retry,
            instruction,
            || {
                self.transport.send_signed(
                    &self.signer,
                    instruction,
                    method.clone(),
                    endpoint,
                    params.as_ref(),
                )
            },
            || self.rotate_for_retry(),
        )
        .await
    }

    async fn public(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<BTreeMap<String, Value>>,
    ) -> Result<Value, ExchangeError> {
        with_proxy_rotation(
            &self.retry,
            "public",
            || self.transport.send_public(method.clone(), endpoint, params.as_ref()),
            || self.rotate_for_retry(),
        )
        .await
    }

    /// Rotation between retry attempts must never abort the retry
    /// ladder itself; a dry directory just means the next attempt goes
    /// direct.
    async fn rotate_for_retry(&self) {
        match self.change_proxy().await {
            Ok(binding) => debug!(
                "Account {}: rotated to proxy {}",
                self.account_id, binding.id
            ),
            Err(ExchangeError::NoFreeProxy { .. }) => warn!(
                "Account {}: no free proxy, next attempt goes direct",
                self.account_id
            ),
            Err(e) => warn!("Account {}: proxy rotation failed: {e}", self.account_id),
        }
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value).map_err(|e| ExchangeError::InvalidResponseShape(e.to_string()))
}

fn directory_error(e: anyhow::Error) -> ExchangeError {
    ExchangeError::Unexpected(format!("directory error: {e}"))
}
