//! Seed the transaction log with synthetic paid transactions.
//!
//! Spreads rows uniformly over `--merchants` merchants and the last `--days`
//! days. Amounts are 100..10100 cents, fees 0..500 cents.

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Parser;
use rand::Rng;
use tracing::info;

use paysettle_core::{Cents, MerchantId};
use paysettle_infra::transactions::postgres::{NewTransaction, PostgresTransactionSource};
use paysettle_infra::{db, AppConfig};
use paysettle_settlement::TransactionStatus;

#[derive(Debug, Parser)]
#[command(name = "seed", about = "Insert synthetic paid transactions")]
struct Args {
    /// Number of transactions to insert
    #[arg(long, default_value_t = 1_000_000)]
    count: u64,
    /// Number of distinct merchants
    #[arg(long, default_value_t = 100)]
    merchants: u64,
    /// Spread transactions over this many days, ending now
    #[arg(long, default_value_t = 90)]
    days: i64,
    /// Rows per INSERT statement
    #[arg(long, default_value_t = 5_000)]
    batch: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    paysettle_observability::init();

    let args = Args::parse();
    anyhow::ensure!(args.merchants > 0, "--merchants must be greater than zero");
    anyhow::ensure!(args.days > 0, "--days must be greater than zero");
    anyhow::ensure!(args.batch > 0, "--batch must be greater than zero");

    let config = AppConfig::from_env().context("invalid configuration")?;
    let pool = db::connect(config.database_url()?, config.database_max_connections).await?;
    let source = PostgresTransactionSource::new(pool);

    let window_secs = args.days * 24 * 60 * 60;
    let end = Utc::now();
    let mut rng = rand::rng();
    let mut inserted = 0u64;

    while inserted < args.count {
        let size = (args.count - inserted).min(args.batch as u64);
        let batch: Vec<NewTransaction> = (0..size)
            .map(|_| NewTransaction {
                merchant_id: MerchantId(rng.random_range(1..=args.merchants)),
                amount: Cents(rng.random_range(100..10_100)),
                fee: Cents(rng.random_range(0..500)),
                status: TransactionStatus::Paid,
                paid_at: end - Duration::seconds(rng.random_range(0..window_secs)),
            })
            .collect();

        inserted += source.insert_batch(&batch).await?;
        info!(inserted, total = args.count, "seeded batch");
    }

    info!(inserted, "seeding complete");
    Ok(())
}
