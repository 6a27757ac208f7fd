//! Bank Ledger CLI
//!
//! ```text
//! bank-ledger [--env dev] health
//! bank-ledger [--env dev] create-account <owner> <balance> <currency>
//! bank-ledger [--env dev] account <id>
//! bank-ledger [--env dev] transfer <from> <to> <amount> [--label <label>]
//!                                  [--isolation <read_committed|repeatable_read|serializable>]
//! ```
//!
//! Every command loads `config/<env>.yaml`, connects to PostgreSQL and makes
//! sure the ledger schema exists before doing its work.

use anyhow::{Context, anyhow, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use bank_ledger::config::AppConfig;
use bank_ledger::db::Database;
use bank_ledger::ledger::{
    CreateAccountParams, IsolationLevel, LedgerStore, Store, TransferParams, TxContext,
};
use bank_ledger::logging::init_logging;

// ============================================================
// ARGUMENTS
// ============================================================

const ENV_FLAGS: &[&str] = &["--env", "-e"];
const LABEL_FLAGS: &[&str] = &["--label"];
const ISOLATION_FLAGS: &[&str] = &["--isolation"];

fn is_known_flag(arg: &str) -> bool {
    [ENV_FLAGS, LABEL_FLAGS, ISOLATION_FLAGS]
        .iter()
        .any(|names| names.contains(&arg))
}

fn get_flag(args: &[String], names: &[&str]) -> Option<String> {
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env(args: &[String]) -> String {
    get_flag(args, ENV_FLAGS).unwrap_or_else(|| "dev".to_string())
}

/// Positional arguments with known `--flag value` pairs removed.
/// Anything else, negative numbers included, stays positional.
fn positional(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if is_known_flag(arg) {
            iter.next();
        } else {
            out.push(arg.clone());
        }
    }
    out
}

fn parse_i64(value: Option<&String>, name: &str) -> anyhow::Result<i64> {
    let value = value.with_context(|| format!("missing <{}>", name))?;
    value
        .parse::<i64>()
        .with_context(|| format!("<{}> must be an integer, got '{}'", name, value))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let mut config = AppConfig::load(&env)?;
    if let Some(level) = get_flag(&args, ISOLATION_FLAGS) {
        config.ledger.isolation_level = level.parse::<IsolationLevel>().map_err(|e| anyhow!(e))?;
    }
    let _guard = init_logging(&config);

    tracing::info!(
        env = %env,
        git = env!("GIT_HASH"),
        isolation = %config.ledger.isolation_level,
        "bank-ledger starting"
    );

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.init_schema().await.context("Failed to bootstrap schema")?;

    let store = LedgerStore::postgres(db.pool().clone(), &config.ledger);
    let pos = positional(&args);

    match pos.first().map(String::as_str) {
        Some("health") => {
            db.health_check().await?;
            println!("ok");
        }
        Some("create-account") => {
            let owner = pos.get(1).context("missing <owner>")?.clone();
            let balance = parse_i64(pos.get(2), "balance")?;
            let currency = pos.get(3).context("missing <currency>")?.clone();
            let account = store
                .create_account(CreateAccountParams::new(owner, balance, currency))
                .await?;
            print_json(&account)?;
        }
        Some("account") => {
            let id = parse_i64(pos.get(1), "id")?;
            print_json(&store.get_account(id).await?)?;
        }
        Some("transfer") => {
            let from = parse_i64(pos.get(1), "from")?;
            let to = parse_i64(pos.get(2), "to")?;
            let amount = parse_i64(pos.get(3), "amount")?;
            let label = get_flag(&args, LABEL_FLAGS)
                .unwrap_or_else(|| format!("cli {}->{}", from, to));

            let cancel = CancellationToken::new();
            let ctx = TxContext::with_label(label).with_cancel(cancel.clone());
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted - cancelling transfer");
                    cancel.cancel();
                }
            });

            let result = store
                .tx_transfer(TransferParams::new(from, to, amount), &ctx)
                .await
                .map_err(|e| anyhow!("[{}] {}", e.code(), e))?;
            print_json(&result)?;
        }
        Some(other) => bail!("unknown command '{}'", other),
        None => bail!("usage: bank-ledger [--env <env>] <health|create-account|account|transfer> ..."),
    }

    Ok(())
}
