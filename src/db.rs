//! SQLite account/proxy directory
//!
//! The trading core consumes this store through the [`AccountDirectory`]
//! trait so tests can substitute an in-memory fake. The only invariant
//! the store owns: at most one proxy is bound and in use per account,
//! and claiming a free proxy is serialized in a single transaction so
//! two pools can never grab the same one.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{info, warn};

use crate::types::{Credential, FakeIdentity};

/// Deposit chains the directory knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Solana,
    Ethereum,
    Bitcoin,
}

impl Chain {
    pub fn as_str(self) -> &'static str {
        match self {
            Chain::Solana => "Solana",
            Chain::Ethereum => "Ethereum",
            Chain::Bitcoin => "Bitcoin",
        }
    }
}

/// One trading account. Mains have no parent; subs point at their main.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub label: String,
    pub country: Option<String>,
}

/// A SOCKS5 proxy row. `in_use` marks the active binding.
#[derive(Debug, Clone)]
pub struct ProxyBinding {
    pub id: i64,
    pub account_id: Option<i64>,
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub country: Option<String>,
    pub in_use: bool,
}

impl ProxyBinding {
    pub fn url(&self) -> String {
        format!(
            "socks5://{}:{}@{}:{}",
            self.login, self.password, self.host, self.port
        )
    }
}

/// Pool of sub-accounts driven by the strategy daemon.
#[derive(Debug, Clone)]
pub struct PoolRow {
    pub id: i64,
    pub name: String,
    pub pool_type: String,
}

impl PoolRow {
    /// Pool type handled by the sub-account strategy.
    pub const SUB_REQUIRED: &'static str = "sub_required";

    pub fn is_sub_required(&self) -> bool {
        self.pool_type.eq_ignore_ascii_case(Self::SUB_REQUIRED)
    }
}

/// Directory lookups the trading core needs. Everything else about
/// persistence lives outside this crate.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_account(&self, account_id: i64) -> Result<Option<AccountRow>>;
    async fn find_credential(&self, account_id: i64) -> Result<Option<Credential>>;
    async fn main_accounts(&self) -> Result<Vec<AccountRow>>;
    async fn sub_accounts(&self, main_id: i64) -> Result<Vec<AccountRow>>;

    async fn find_active_proxy(&self, account_id: i64) -> Result<Option<ProxyBinding>>;
    async fn release_proxy(&self, proxy_id: i64) -> Result<()>;
    /// Atomically claim a free proxy for the account, preferring one in
    /// the given country. `None` when the directory has nothing free.
    async fn claim_free_proxy(
        &self,
        account_id: i64,
        preferred_country: Option<&str>,
    ) -> Result<Option<ProxyBinding>>;

    async fn find_fake_identity(&self, account_id: i64) -> Result<Option<FakeIdentity>>;
    async fn find_deposit_address(&self, account_id: i64, chain: Chain) -> Result<Option<String>>;

    async fn active_pools(&self) -> Result<Vec<PoolRow>>;
}

/// Directory backed by a local SQLite file.
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to directory database")?;

        let directory = Self { pool };
        directory.initialize().await?;

        Ok(directory)
    }

    /// Initialize directory schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER REFERENCES accounts(id),
                label TEXT NOT NULL,
                api_key TEXT NOT NULL UNIQUE,
                api_secret TEXT NOT NULL,
                country TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER REFERENCES accounts(id),
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                login TEXT NOT NULL,
                password TEXT NOT NULL,
                country TEXT,
                in_use INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fake_identities (
                account_id INTEGER PRIMARY KEY REFERENCES accounts(id),
                headers TEXT NOT NULL DEFAULT '{}',
                cookies TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposit_addresses (
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                chain TEXT NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (account_id, chain)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                pool_type TEXT NOT NULL DEFAULT 'sub_required',
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes for the hot rotation lookups
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxies_account ON proxies(account_id, in_use)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxies_free ON proxies(in_use, account_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_accounts_parent ON accounts(parent_id)")
            .execute(&self.pool)
            .await?;

        info!("Directory database initialized");
        Ok(())
    }
}

type ProxyTuple = (
    i64,
    Option<i64>,
    String,
    i64,
    String,
    String,
    Option<String>,
    bool,
);

fn proxy_from_tuple(row: ProxyTuple) -> ProxyBinding {
    ProxyBinding {
        id: row.0,
        account_id: row.1,
        host: row.2,
        port: row.3 as u16,
        login: row.4,
        password: row.5,
        country: row.6,
        in_use: row.7,
    }
}

#[async_trait]
impl AccountDirectory for SqliteDirectory {
    async fn find_account(&self, account_id: i64) -> Result<Option<AccountRow>> {
        let row: Option<(i64, Option<i64>, String, Option<String>)> = sqlx::query_as(
            "SELECT id, parent_id, label, country FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, parent_id, label, country)| AccountRow {
            id,
            parent_id,
            label,
            country,
        }))
    }

    async fn find_credential(&self, account_id: i64) -> Result<Option<Credential>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT api_key, api_secret FROM accounts WHERE id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(api_key, api_secret)| Credential {
            api_key,
            api_secret,
        }))
    }

    async fn main_accounts(&self) -> Result<Vec<AccountRow>> {
        let rows: Vec<(i64, Option<i64>, String, Option<String>)> = sqlx::query_as(
            "SELECT id, parent_id, label, country FROM accounts WHERE parent_id IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, parent_id, label, country)| AccountRow {
                id,
                parent_id,
                label,
                country,
            })
            .collect())
    }

    async fn sub_accounts(&self, main_id: i64) -> Result<Vec<AccountRow>> {
        let rows: Vec<(i64, Option<i64>, String, Option<String>)> = sqlx::query_as(
            "SELECT id, parent_id, label, country FROM accounts WHERE parent_id = ? ORDER BY id",
        )
        .bind(main_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, parent_id, label, country)| AccountRow {
                id,
                parent_id,
                label,
                country,
            })
            .collect())
    }

    async fn find_active_proxy(&self, account_id: i64) -> Result<Option<ProxyBinding>> {
        let row: Option<ProxyTuple> = sqlx::query_as(
            r#"
            SELECT id, account_id, host, port, login, password, country, in_use
            FROM proxies WHERE account_id = ? AND in_use = 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(proxy_from_tuple))
    }

    async fn release_proxy(&self, proxy_id: i64) -> Result<()> {
        // Release only drops the in-use flag. The binding stays linked
        // to its last account; a claim hands out never-bound rows, so a
        // burned proxy is not recycled straight back into rotation.
        sqlx::query("UPDATE proxies SET in_use = 0 WHERE id = ?")
            .bind(proxy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_free_proxy(
        &self,
        account_id: i64,
        preferred_country: Option<&str>,
    ) -> Result<Option<ProxyBinding>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<ProxyTuple> = sqlx::query_as(
            r#"
            SELECT id, account_id, host, port, login, password, country, in_use
            FROM proxies
            WHERE in_use = 0 AND account_id IS NULL
            ORDER BY CASE WHEN country = ? THEN 0 ELSE 1 END, id
            LIMIT 1
            "#,
        )
        .bind(preferred_country)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE proxies SET account_id = ?, in_use = 1 WHERE id = ?")
            .bind(account_id)
            .bind(row.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut claimed = proxy_from_tuple(row);
        claimed.account_id = Some(account_id);
        claimed.in_use = true;
        Ok(Some(claimed))
    }

    async fn find_fake_identity(&self, account_id: i64) -> Result<Option<FakeIdentity>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT headers, cookies FROM fake_identities WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(headers, cookies)| FakeIdentity {
            headers: parse_string_map(&headers, account_id, "headers"),
            cookies: parse_string_map(&cookies, account_id, "cookies"),
        }))
    }

    async fn find_deposit_address(
        &self,
        account_id: i64,
        chain: Chain,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT address FROM deposit_addresses WHERE account_id = ? AND chain = ?",
        )
        .bind(account_id)
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(address,)| address))
    }

    async fn active_pools(&self) -> Result<Vec<PoolRow>> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, name, pool_type FROM pools WHERE is_active = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, pool_type)| PoolRow {
                id,
                name,
                pool_type,
            })
            .collect())
    }
}

fn parse_string_map(raw: &str, account_id: i64, what: &str) -> HashMap<String, String> {
    match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            warn!("Account {account_id}: malformed fake-identity {what}: {e}");
            HashMap::new()
        }
    }
}

/// In-memory directory for tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        accounts: Vec<AccountRow>,
        credentials: HashMap<i64, Credential>,
        proxies: Vec<ProxyBinding>,
        identities: HashMap<i64, FakeIdentity>,
        deposit_addresses: HashMap<(i64, Chain), String>,
        pools: Vec<PoolRow>,
    }

    #[derive(Default)]
    pub struct MemoryDirectory {
        state: Mutex<State>,
    }

    impl MemoryDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_account(
            &self,
            id: i64,
            parent_id: Option<i64>,
            label: &str,
            api_secret: &str,
        ) {
            let mut state = self.state.lock().unwrap();
            state.accounts.push(AccountRow {
                id,
                parent_id,
                label: label.to_string(),
                country: None,
            });
            state.credentials.insert(
                id,
                Credential {
                    api_key: format!("api-key-{id}"),
                    api_secret: api_secret.to_string(),
                },
            );
        }

        pub fn add_free_proxy(&self, id: i64, country: Option<&str>) {
            self.state.lock().unwrap().proxies.push(ProxyBinding {
                id,
                account_id: None,
                host: format!("198.51.100.{id}"),
                port: 1080,
                login: "user".to_string(),
                password: "pass".to_string(),
                country: country.map(str::to_string),
                in_use: false,
            });
        }

        pub fn set_deposit_address(&self, account_id: i64, chain: Chain, address: &str) {
            self.state
                .lock()
                .unwrap()
                .deposit_addresses
                .insert((account_id, chain), address.to_string());
        }

        pub fn add_pool(&self, id: i64, pool_type: &str) {
            self.state.lock().unwrap().pools.push(PoolRow {
                id,
                name: format!("pool-{id}"),
                pool_type: pool_type.to_string(),
            });
        }

        pub fn proxy(&self, proxy_id: i64) -> Option<ProxyBinding> {
            self.state
                .lock()
                .unwrap()
                .proxies
                .iter()
                .find(|p| p.id == proxy_id)
                .cloned()
        }
    }

    #[async_trait]
    impl AccountDirectory for MemoryDirectory {
        async fn find_account(&self, account_id: i64) -> Result<Option<AccountRow>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .accounts
                .iter()
                .find(|a| a.id == account_id)
                .cloned())
        }

        async fn find_credential(&self, account_id: i64) -> Result<Option<Credential>> {
            Ok(self.state.lock().unwrap().credentials.get(&account_id).cloned())
        }

        async fn main_accounts(&self) -> Result<Vec<AccountRow>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .accounts
                .iter()
                .filter(|a| a.parent_id.is_none())
                .cloned()
                .collect())
        }

        async fn sub_accounts(&self, main_id: i64) -> Result<Vec<AccountRow>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .accounts
                .iter()
                .filter(|a| a.parent_id == Some(main_id))
                .cloned()
                .collect())
        }

        async fn find_active_proxy(&self, account_id: i64) -> Result<Option<ProxyBinding>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .proxies
                .iter()
                .find(|p| p.account_id == Some(account_id) && p.in_use)
                .cloned())
        }

        async fn release_proxy(&self, proxy_id: i64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(proxy) = state.proxies.iter_mut().find(|p| p.id == proxy_id) {
                proxy.in_use = false;
            }
            Ok(())
        }

        async fn claim_free_proxy(
            &self,
            account_id: i64,
            preferred_country: Option<&str>,
        ) -> Result<Option<ProxyBinding>> {
            let mut state = self.state.lock().unwrap();
            let index = state
                .proxies
                .iter()
                .position(|p| {
                    !p.in_use
                        && p.account_id.is_none()
                        && preferred_country.is_some()
                        && p.country.as_deref() == preferred_country
                })
                .or_else(|| {
                    state
                        .proxies
                        .iter()
                        .position(|p| !p.in_use && p.account_id.is_none())
                });
            Ok(index.map(|i| {
                let proxy = &mut state.proxies[i];
                proxy.in_use = true;
                proxy.account_id = Some(account_id);
                proxy.clone()
            }))
        }

        async fn find_fake_identity(&self, account_id: i64) -> Result<Option<FakeIdentity>> {
            Ok(self.state.lock().unwrap().identities.get(&account_id).cloned())
        }

        async fn find_deposit_address(
            &self,
            account_id: i64,
            chain: Chain,
        ) -> Result<Option<String>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .deposit_addresses
                .get(&(account_id, chain))
                .cloned())
        }

        async fn active_pools(&self) -> Result<Vec<PoolRow>> {
            Ok(self.state.lock().unwrap().pools.clone())
        }
    }
}
