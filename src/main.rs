//! Backpack Pool Bot CLI
//!
//! Operator surface for the pool trading daemon.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use backpack_pool_bot::{BackpackClient, Config, ExchangeError, PoolRunner, SqliteDirectory};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rust_decimal::Decimal;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "backpack-pool-bot")]
#[command(about = "Pool trading daemon for Backpack exchange sub-accounts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool daemon continuously
    Run,

    /// Run a single strategy pass and exit
    Tick {
        /// Restrict the pass to one pool id
        #[arg(short, long)]
        pool: Option<i64>,
    },

    /// Show an account's balances valued in USD
    Balance {
        /// Account id in the directory
        #[arg(short, long)]
        account: i64,
    },

    /// Verify the account's proxy egress
    CheckProxy {
        #[arg(short, long)]
        account: i64,
    },

    /// Release the account's proxy and claim a fresh one
    Rotate {
        #[arg(short, long)]
        account: i64,
    },

    /// Market-sell every non-USDC holding on the account
    Convert {
        #[arg(short, long)]
        account: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let directory = Arc::new(SqliteDirectory::new(&config.database_path).await?);

    match cli.command {
        Commands::Run => run_daemon(directory, config).await,
        Commands::Tick { pool } => run_tick(directory, config, pool).await,
        Commands::Balance { account } => show_balance(directory, &config, account).await?,
        Commands::CheckProxy { account } => check_proxy(directory, &config, account).await?,
        Commands::Rotate { account } => rotate_proxy(directory, &config, account).await?,
        Commands::Convert { account } => convert_account(directory, &config, account).await?,
    }

    Ok(())
}

async fn run_daemon(directory: Arc<SqliteDirectory>, config: Config) {
    println!("\n{}", "=".repeat(70));
    println!("  BACKPACK POOL DAEMON");
    println!(
        "  Interval: {}s | Symbols: {} | Target positions: {}",
        config.pool_interval_seconds,
        config.strategy.symbols.join(", "),
        config.strategy.target_open_positions
    );
    println!("{}\n", "=".repeat(70));

    PoolRunner::new(directory, config).run_forever().await;
}

async fn run_tick(directory: Arc<SqliteDirectory>, config: Config, pool: Option<i64>) {
    let runner = PoolRunner::new(directory, config);

    let reports = match pool {
        Some(pool_id) => match runner.run_pool_by_id(pool_id).await {
            Some(report) => vec![report],
            None => {
                println!("{}", format!("Pool {pool_id} is not an active sub-account pool").red());
                return;
            }
        },
        None => runner.run_once().await,
    };

    for report in &reports {
        println!(
            "Pool {}: {} processed, {} skipped, {} {}",
            report.pool_id,
            report.processed.to_string().green(),
            report.skipped,
            report.failed,
            if report.failed > 0 { "failed".red() } else { "failed".normal() },
        );
    }
    if reports.is_empty() {
        println!("No active sub-account pools.");
    }
}

async fn show_balance(
    directory: Arc<SqliteDirectory>,
    config: &Config,
    account: i64,
) -> Result<()> {
    let client = connect(directory, account, config).await?;

    let totals = client.get_total_token_quantities().await?;
    let prices: HashMap<String, Decimal> = client
        .get_tickers()
        .await?
        .into_iter()
        .map(|t| (t.symbol, t.last_price))
        .collect();

    println!("\nAccount {account} holdings:");
    println!("{}", "-".repeat(44));
    let mut total_usd = Decimal::ZERO;
    let mut rows: Vec<_> = totals.into_iter().collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    for (token, quantity) in rows {
        if quantity.is_zero() {
            continue;
        }
        let usd = if token == "USDC" {
            Some(quantity)
        } else {
            prices
                .get(&format!("{token}_USDC"))
                .or_else(|| prices.get(&format!("{token}_USDC_PERP")))
                .map(|price| quantity * price)
        };
        match usd {
            Some(usd) => {
                total_usd += usd;
                println!("  {:<8} {:>16}  ~${:.2}", token.bold(), quantity, usd);
            }
            None => println!("  {:<8} {:>16}  (no price)", token.bold(), quantity),
        }
    }
    println!("{}", "-".repeat(44));
    println!("  {:<8} {}", "TOTAL".bold(), format!("~${total_usd:.2}").green());

    Ok(())
}

async fn check_proxy(
    directory: Arc<SqliteDirectory>,
    config: &Config,
    account: i64,
) -> Result<()> {
    let client = connect(directory, account, config).await?;

    match client.proxy_url().await {
        Some(url) => println!("Bound proxy: {url}"),
        None => println!("{}", "No proxy bound; checking direct egress".yellow()),
    }

    let report = client.check_proxy().await?;
    println!(
        "Egress: {} ({} / {})",
        report.ip.as_deref().unwrap_or("?").bold(),
        report.city.as_deref().unwrap_or("?"),
        report.country.as_deref().unwrap_or("?"),
    );
    if let Some(org) = &report.org {
        println!("Org:    {org}");
    }
    println!("RTT:    {} ms", report.response_time_ms);

    Ok(())
}

async fn rotate_proxy(
    directory: Arc<SqliteDirectory>,
    config: &Config,
    account: i64,
) -> Result<()> {
    let client = connect(directory, account, config).await?;

    match client.change_proxy().await {
        Ok(binding) => println!(
            "{} proxy {} ({})",
            "Bound".green(),
            binding.id,
            binding.url()
        ),
        Err(ExchangeError::NoFreeProxy { .. }) => {
            println!("{}", "No free proxy available; account now runs direct".yellow())
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

async fn convert_account(
    directory: Arc<SqliteDirectory>,
    config: &Config,
    account: i64,
) -> Result<()> {
    let client = connect(directory, account, config).await?;

    let outcomes = client.convert_all_to_usdc().await?;
    if outcomes.is_empty() {
        println!("Nothing to convert.");
        return Ok(());
    }
    for outcome in outcomes {
        if outcome.success {
            println!("  {} {} sold", "OK ".green(), outcome.symbol);
        } else {
            println!(
                "  {} {} - {}",
                "FAIL".red(),
                outcome.symbol,
                outcome.error.as_deref().unwrap_or("order not accepted")
            );
        }
    }

    Ok(())
}

async fn connect(
    directory: Arc<SqliteDirectory>,
    account: i64,
    config: &Config,
) -> Result<BackpackClient> {
    BackpackClient::connect(directory, account, config)
        .await
        .map_err(|e| anyhow::anyhow!("cannot build client for account {account}: {e}"))
}
