//! Pool daemon loop
//!
//! Loads active pools from the directory, runs the sub-account
//! strategy over each `sub_required` pool, then sleeps the configured
//! interval. A whole-cycle failure is logged and the loop keeps going.

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{error, info};

use super::sub_accounts::{PoolReport, SubAccountStrategy};
use crate::config::Config;
use crate::db::AccountDirectory;

pub struct PoolRunner {
    directory: Arc<dyn AccountDirectory>,
    strategy: SubAccountStrategy,
    interval: Duration,
}

impl PoolRunner {
    pub fn new(directory: Arc<dyn AccountDirectory>, config: Config) -> Self {
        let interval = Duration::from_secs(config.pool_interval_seconds);
        let strategy = SubAccountStrategy::new(directory.clone(), config);
        Self {
            directory,
            strategy,
            interval,
        }
    }

    /// One pass over every active `sub_required` pool.
    pub async fn run_once(&self) -> Vec<PoolReport> {
        let mut reports = Vec::new();
        match self.directory.active_pools().await {
            Ok(pools) => {
                for pool in pools.iter().filter(|p| p.is_sub_required()) {
                    reports.push(self.strategy.run_pool(pool).await);
                }
            }
            Err(e) => error!("Pool cycle: directory error listing pools: {e}"),
        }
        reports
    }

    /// Single pass for one pool, by id. `None` when the pool is not
    /// active or not a sub-account pool.
    pub async fn run_pool_by_id(&self, pool_id: i64) -> Option<PoolReport> {
        match self.directory.active_pools().await {
            Ok(pools) => {
                let pool = pools
                    .into_iter()
                    .find(|p| p.id == pool_id && p.is_sub_required())?;
                Some(self.strategy.run_pool(&pool).await)
            }
            Err(e) => {
                error!("Pool {pool_id}: directory error: {e}");
                None
            }
        }
    }

    pub async fn run_forever(&self) {
        info!(
            "Pool daemon started, interval {}s",
            self.interval.as_secs()
        );
        loop {
            let reports = self.run_once().await;
            let processed: usize = reports.iter().map(|r| r.processed).sum();
            let failed: usize = reports.iter().map(|r| r.failed).sum();
            info!(
                "Cycle complete: {} pools, {} sub-accounts processed, {} failed",
                reports.len(),
                processed,
                failed
            );
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::MemoryDirectory;
    use crate::db::PoolRow;

    #[tokio::test]
    async fn only_sub_required_pools_are_driven() {
        let directory = MemoryDirectory::new();
        directory.add_pool(1, "gift_sniper");
        directory.add_pool(2, PoolRow::SUB_REQUIRED);

        let runner = PoolRunner::new(Arc::new(directory), Config::default());
        let reports = runner.run_once().await;

        // The sub_required pool runs (and reports zeros: no mains);
        // the other type is ignored entirely.
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].pool_id, 2);
        assert_eq!(reports[0].processed, 0);
    }

    #[tokio::test]
    async fn unknown_pool_id_is_none() {
        let directory = MemoryDirectory::new();
        directory.add_pool(1, PoolRow::SUB_REQUIRED);

        let runner = PoolRunner::new(Arc::new(directory), Config::default());
        assert!(runner.run_pool_by_id(99).await.is_none());
    }
}
