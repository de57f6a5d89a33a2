//! Per-pool sub-account rebalancing
//!
//! One tick per sub-account: already holding the target number of open
//! positions means nothing to do; a partial position set is reset
//! (close everything, re-apply leverage); an empty account is funded if
//! needed and one market position is opened per configured symbol, with
//! a randomized side split and a descending notional ladder.
//!
//! No sub-account's failure may stop the batch. Every fallible step is
//! contained at this level and logged.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{AccountDirectory, AccountRow, Chain, PoolRow};
use crate::exchange::{BackpackClient, ExchangeError};
use crate::sizing::{self, size_order, total_usd_balance};
use crate::types::{AccountSettingsUpdate, OrderDraft, Side};

/// What a tick does with one sub-account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPlan {
    /// Holding at least the target number of positions: no-op.
    Skip,
    /// Partial position set: close everything, then open fresh.
    ResetThenOpen,
    /// Clean slate: open fresh positions.
    Open,
}

/// Pure tick decision, so the idempotence rule is testable in
/// isolation.
pub fn plan_tick(open_positions: usize, target: usize) -> TickPlan {
    if open_positions >= target {
        TickPlan::Skip
    } else if open_positions > 0 {
        TickPlan::ResetThenOpen
    } else {
        TickPlan::Open
    }
}

/// One side per symbol for the tick: a random primary side, with one
/// randomly chosen symbol flipped so the pool shows no directional
/// bias.
pub fn assign_sides<R: Rng>(rng: &mut R, count: usize) -> Vec<Side> {
    if count == 0 {
        return Vec::new();
    }
    let primary = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
    let flipped = rng.gen_range(0..count);
    (0..count)
        .map(|i| if i == flipped { primary.opposite() } else { primary })
        .collect()
}

/// Outcome counts for one pool pass.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub pool_id: i64,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum SubOutcome {
    Skipped,
    Processed,
}

/// Drives every sub-account of a pool through one tick.
pub struct SubAccountStrategy {
    directory: Arc<dyn AccountDirectory>,
    config: Config,
}

impl SubAccountStrategy {
    pub fn new(directory: Arc<dyn AccountDirectory>, config: Config) -> Self {
        Self { directory, config }
    }

    pub async fn run_pool(&self, pool: &PoolRow) -> PoolReport {
        let mut report = PoolReport {
            pool_id: pool.id,
            ..Default::default()
        };
        info!("Pool {}: start strategy pass", pool.id);

        let mains = match self.directory.main_accounts().await {
            Ok(mains) if !mains.is_empty() => mains,
            Ok(_) => {
                warn!("Pool {}: no main accounts in directory", pool.id);
                return report;
            }
            Err(e) => {
                error!("Pool {}: directory error listing mains: {e}", pool.id);
                return report;
            }
        };
        let main = {
            let index = rand::thread_rng().gen_range(0..mains.len());
            mains[index].clone()
        };

        let main_client =
            match BackpackClient::connect(self.directory.clone(), main.id, &self.config).await {
                Ok(client) => client,
                Err(e) => {
                    error!("Pool {}: cannot build main client {}: {e}", pool.id, main.id);
                    return report;
                }
            };

        let subs = match self.directory.sub_accounts(main.id).await {
            Ok(subs) if !subs.is_empty() => subs,
            Ok(_) => {
                warn!("Pool {}: main {} has no sub-accounts", pool.id, main.id);
                return report;
            }
            Err(e) => {
                error!("Pool {}: directory error listing subs: {e}", pool.id);
                return report;
            }
        };

        for sub in &subs {
            match self.process_sub(pool.id, &main_client, sub).await {
                Ok(SubOutcome::Skipped) => report.skipped += 1,
                Ok(SubOutcome::Processed) => report.processed += 1,
                Err(e) => {
                    error!("Pool {} Sub {}: {e}, moving on", pool.id, sub.id);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Pool {}: pass done, processed={} skipped={} failed={}",
            pool.id, report.processed, report.skipped, report.failed
        );
        report
    }

    async fn process_sub(
        &self,
        pool_id: i64,
        main_client: &BackpackClient,
        sub: &AccountRow,
    ) -> Result<SubOutcome, ExchangeError> {
        let strategy = &self.config.strategy;
        info!("Pool {pool_id}: processing sub {} ({})", sub.id, sub.label);

        let client =
            BackpackClient::connect(self.directory.clone(), sub.id, &self.config).await?;

        let positions = client.get_open_positions().await?;
        match plan_tick(positions.len(), strategy.target_open_positions) {
            TickPlan::Skip => {
                info!(
                    "Pool {pool_id} Sub {}: already {} open positions, skip",
                    sub.id,
                    positions.len()
                );
                return Ok(SubOutcome::Skipped);
            }
            TickPlan::ResetThenOpen => {
                let summary = client.close_all_perp_positions().await?;
                info!(
                    "Pool {pool_id} Sub {}: reset closed {}/{} positions",
                    sub.id, summary.closed, summary.total
                );
                client
                    .update_account_settings(&AccountSettingsUpdate::with_leverage(
                        strategy.leverage,
                    ))
                    .await?;
            }
            TickPlan::Open => {
                client
                    .update_account_settings(&AccountSettingsUpdate::with_leverage(
                        strategy.leverage,
                    ))
                    .await?;
            }
        }

        let balances = client.get_balances().await?;
        let lend = client.get_borrow_lend_positions().await?;
        let prices: HashMap<String, Decimal> = client
            .get_tickers()
            .await?
            .into_iter()
            .map(|t| (t.symbol, t.last_price))
            .collect();
        let total_usd = total_usd_balance(&balances, &lend, &prices);
        info!("Pool {pool_id} Sub {}: total balance ~${total_usd}", sub.id);

        if total_usd < strategy.min_deposit_usd {
            self.top_up_sub(pool_id, main_client, sub.id).await;
        }

        let alloc = (total_usd / Decimal::from(strategy.symbols.len() as u64))
            .round_dp_with_strategy(6, RoundingStrategy::ToZero);
        let sides = {
            let mut rng = rand::thread_rng();
            assign_sides(&mut rng, strategy.symbols.len())
        };
        let leverage = Decimal::from(strategy.leverage);

        for (symbol, side) in strategy.symbols.iter().zip(sides) {
            self.open_with_ladder(&client, pool_id, sub.id, symbol, side, alloc * leverage)
                .await;
        }

        Ok(SubOutcome::Processed)
    }

    /// Deposit funding from the main account. A failure here aborts
    /// only the top-up; the tick goes on with whatever is there.
    async fn top_up_sub(&self, pool_id: i64, main_client: &BackpackClient, sub_id: i64) {
        let address = match self
            .directory
            .find_deposit_address(sub_id, Chain::Solana)
            .await
        {
            Ok(Some(address)) => address,
            Ok(None) => {
                error!("Pool {pool_id} Sub {sub_id}: no Solana deposit address");
                return;
            }
            Err(e) => {
                warn!("Pool {pool_id} Sub {sub_id}: deposit-address lookup failed: {e}");
                return;
            }
        };

        match sizing::top_up(
            main_client,
            &address,
            self.config.strategy.min_deposit_usd,
        )
        .await
        {
            Ok(response) => info!(
                "Pool {pool_id} Sub {sub_id}: top-up withdrawal submitted, status={:?}",
                response.status
            ),
            Err(e) => warn!("Pool {pool_id} Sub {sub_id}: top-up failed: {e}"),
        }
    }

    /// Try descending notional fractions until one order is accepted,
    /// re-reading the book each attempt.
    async fn open_with_ladder(
        &self,
        client: &BackpackClient,
        pool_id: i64,
        sub_id: i64,
        symbol: &str,
        side: Side,
        notional: Decimal,
    ) {
        for fraction in &self.config.strategy.notional_ladder {
            let amount = notional * fraction;
            let book = match client.get_order_book_depth(symbol).await {
                Ok(book) => book,
                Err(e) => {
                    warn!("Pool {pool_id} Sub {sub_id}: no book for {symbol}: {e}");
                    continue;
                }
            };
            let Some(sized) = size_order(&book, side, amount) else {
                warn!("Pool {pool_id} Sub {sub_id}: cannot size {symbol} at ~${amount}");
                continue;
            };

            info!(
                "Pool {pool_id} Sub {sub_id}: placing {side} {symbol} qty={} (~${amount})",
                sized.quantity
            );
            let draft = OrderDraft::market(symbol, side, sized.quantity).auto_leveraged();
            match client.create_order(&draft).await {
                Ok(order) if order.is_accepted() => {
                    info!(
                        "Pool {pool_id} Sub {sub_id}: {symbol} order accepted, id={:?}",
                        order.id
                    );
                    return;
                }
                Ok(order) => warn!(
                    "Pool {pool_id} Sub {sub_id}: {symbol} order not accepted, status={:?}",
                    order.status
                ),
                Err(e) => warn!("Pool {pool_id} Sub {sub_id}: {symbol} order failed: {e}"),
            }
        }
        warn!("Pool {pool_id} Sub {sub_id}: notional ladder exhausted for {symbol}");
    }
}
