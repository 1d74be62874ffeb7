//! Binary wiring: config, cancellation, the engine run, and the final
//! report.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::Config;
use crate::credentials::SystemCredentials;
use crate::engine::progress::LogProgress;
use crate::engine::report::{RunReport, RunStatus};
use crate::engine::Engine;
use crate::storage::FileStore;
use crate::types::Account;

pub async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?;
    let accounts = filter_accounts(&config, &cli.account)?;

    let root = cli.root.clone().unwrap_or_else(|| config.store_root());
    info!(root = %root.display(), accounts = accounts.len(), "archive run starting");

    let cancel = CancellationToken::new();
    spawn_ctrl_c_watcher(cancel.clone());

    let engine = Engine::new(
        FileStore::new(root),
        config.archive.clone(),
        Arc::new(SystemCredentials),
        Arc::new(LogProgress),
        cancel.clone(),
    )
    .with_dry_run(cli.dry_run);

    if cli.list {
        return list_folders(&engine, &accounts).await;
    }

    if let Some(secs) = config.archive.run_timeout_secs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "run timeout reached, cancelling");
            cancel.cancel();
        });
    }

    let report = engine.run(&accounts).await;
    render_report(&report);
    Ok(report.exit_code())
}

fn filter_accounts(config: &Config, wanted: &[String]) -> Result<Vec<Account>> {
    if wanted.is_empty() {
        return Ok(config.accounts.clone());
    }
    for name in wanted {
        if !config.accounts.iter().any(|a| &a.name == name) {
            bail!("unknown account {name:?}");
        }
    }
    Ok(config
        .accounts
        .iter()
        .filter(|a| wanted.contains(&a.name))
        .cloned()
        .collect())
}

fn spawn_ctrl_c_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });
}

async fn list_folders(engine: &Engine, accounts: &[Account]) -> Result<i32> {
    let mut failures = 0;
    for account in accounts {
        println!("{} ({})", account.name, account.host);
        match engine.list_account_folders(account).await {
            Ok(folders) => {
                for folder in folders {
                    let marker = if folder.selectable { " " } else { "-" };
                    println!(
                        "  {marker} {:<40} delimiter={:?} role={:?}",
                        folder.raw_name, folder.delimiter, folder.role
                    );
                }
            }
            Err(e) => {
                warn!(account = %account.name, error = %e, "listing failed");
                failures += 1;
            }
        }
    }
    Ok(if failures > 0 { 1 } else { 0 })
}

fn render_report(report: &RunReport) {
    for account in &report.accounts {
        info!(
            account = %account.account,
            processed = account.processed(),
            downloaded = account.downloaded(),
            skipped = account.skipped(),
            failed = account.failed(),
            bytes = account.bytes(),
            elapsed_ms = account.elapsed.as_millis() as u64,
            fatal = account.fatal.as_deref().unwrap_or("none"),
            "account summary"
        );
        for error in &account.errors {
            warn!(
                account = %account.account,
                folder = %error.folder,
                uid = error.uid.map(|u| u.to_string()).unwrap_or_else(|| "-".into()),
                category = error.category,
                detail = %error.detail,
                "recorded error"
            );
        }
    }

    let status = match report.status() {
        RunStatus::Success => "success",
        RunStatus::CompletedWithErrors => "completed with errors",
        RunStatus::Failed => "failed",
    };
    info!(
        status,
        accounts = report.accounts.len(),
        downloaded = report.downloaded(),
        failed = report.failed(),
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run finished"
    );
}
