mod cli;

use std::collections::VecDeque;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use attestor_core::contact::ensure_contact_config;
use attestor_core::proxy::{parse_proxy_line, ProxySpec};
use attestor_engine::inventory::RecordInventory;
use attestor_engine::ledger::Ledger;
use attestor_engine::mailbox::HttpMailbox;
use attestor_engine::provider::{HttpProvider, ProviderTimeouts};
use attestor_engine::proxy::{ProxyPool, ProxyPoolConfig};
use attestor_engine::{
    start_engine, EngineConfig, EngineDeps, EngineEvent, RecordSelector, UserId,
};

use crate::cli::Cli;

fn xdg_state_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_STATE_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("state"))
}

fn load_proxy_specs(path: &Path) -> anyhow::Result<Vec<ProxySpec>> {
    let raw = std::fs::read_to_string(path)?;
    let mut specs = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_proxy_line(line) {
            Ok(spec) => specs.push(spec),
            Err(err) => tracing::warn!(%err, line, "skipping unparseable proxy line"),
        }
    }
    Ok(specs)
}

/// Keep `outstanding` submissions in flight, one synthetic user per record.
/// Rejected submissions (e.g. a record consumed by a previous run) are
/// logged and skipped.
async fn top_up(
    engine: &attestor_engine::EngineHandle,
    queue: &mut VecDeque<String>,
    next_user: &mut i64,
    outstanding: &mut usize,
    parallel: usize,
) {
    while *outstanding < parallel {
        let Some(key) = queue.pop_front() else { break };
        let user = UserId(*next_user);
        *next_user += 1;
        match engine.submit(user, RecordSelector::Key(key)).await {
            Ok(_) => *outstanding += 1,
            Err(err) => tracing::warn!(%err, "submission rejected"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => xdg_state_home()?.join("attestor"),
    };

    let ledger = Arc::new(Ledger::load(state_dir.join("ledger.jsonl"))?);
    if cli.stats {
        let stats = ledger.stats();
        println!(
            "total {}  succeeded {}  failed {}  timed out {}  cancelled {}",
            stats.total, stats.succeeded, stats.failed, stats.timed_out, stats.cancelled
        );
        return Ok(());
    }

    let inventory = Arc::new(RecordInventory::load(
        &cli.records,
        state_dir.join("consumed.txt"),
    )?);

    if let Some(path) = &cli.import {
        let text = std::fs::read_to_string(path)?;
        let added = inventory.import_lines(&text).await?;
        println!(
            "imported {added} record(s); {} now available",
            inventory.count_available()
        );
        return Ok(());
    }

    let interactive = std::io::stdin().is_terminal();
    let contact = match ensure_contact_config(interactive)? {
        Some(cfg) => cfg,
        None => anyhow::bail!("no contact configuration; run interactively once to create it"),
    };
    let Some(contact_email) = contact.email else {
        anyhow::bail!("contact configuration has no mailbox address");
    };

    let proxy_specs = match &cli.proxies {
        Some(path) => load_proxy_specs(path)?,
        None => Vec::new(),
    };
    if proxy_specs.is_empty() {
        tracing::warn!("no egress proxies loaded; all jobs run over the direct connection");
    } else {
        tracing::info!(proxies = proxy_specs.len(), "loaded proxy pool");
    }
    let proxies = Arc::new(ProxyPool::new(
        ProxyPoolConfig {
            default_health: cli.proxy_health,
            cooldown: Duration::from_secs(cli.proxy_cooldown_secs),
        },
        proxy_specs,
    ));

    let provider = Arc::new(HttpProvider::new(
        cli.provider_url.clone(),
        contact_email,
        contact.label,
        ProviderTimeouts::default(),
    )?);
    let mailbox = Arc::new(HttpMailbox::new(
        cli.mailbox_url.clone(),
        HttpMailbox::DEFAULT_TIMEOUT,
    )?);

    let config = EngineConfig {
        parallel: cli.parallel as usize,
        daily_quota: cli.daily_quota,
        decision_deadline: Duration::from_secs(cli.decision_deadline_secs),
        oob_deadline: Duration::from_secs(cli.oob_deadline_secs),
        ..EngineConfig::default()
    };
    let engine = start_engine(
        config,
        EngineDeps {
            provider,
            mailbox,
            inventory: inventory.clone(),
            proxies,
            ledger: ledger.clone(),
        },
    );
    let mut events = engine.subscribe();

    // The CLI stands in for the chat layer: each record is driven on behalf
    // of its own synthetic user, up to the engine's concurrency cap.
    let mut queue: VecDeque<String> = inventory.available().iter().map(|r| r.key()).collect();
    if let Some(limit) = cli.limit {
        queue.truncate(limit);
    }
    if queue.is_empty() {
        tracing::info!("no records available; nothing to do");
        engine.request_stop();
    } else {
        tracing::info!(
            records = queue.len(),
            parallel = cli.parallel,
            "starting verification run"
        );
    }

    let mut next_user: i64 = 1;
    let mut outstanding = 0usize;
    let mut stopping = false;

    top_up(&engine, &mut queue, &mut next_user, &mut outstanding, cli.parallel as usize).await;
    if outstanding == 0 && queue.is_empty() && !stopping {
        stopping = true;
        engine.request_stop();
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !stopping {
                    stopping = true;
                    tracing::info!(
                        "stop requested; finishing live jobs (press Ctrl-C again to exit immediately)"
                    );
                    engine.request_stop();
                } else {
                    tracing::warn!("stop requested again; exiting immediately");
                    std::process::exit(130);
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    EngineEvent::JobFinished { .. } => {
                        outstanding = outstanding.saturating_sub(1);
                        if !stopping {
                            top_up(
                                &engine,
                                &mut queue,
                                &mut next_user,
                                &mut outstanding,
                                cli.parallel as usize,
                            )
                            .await;
                        }
                        if outstanding == 0 && queue.is_empty() && !stopping {
                            stopping = true;
                            engine.request_stop();
                        }
                    }
                    EngineEvent::Warning { message } => tracing::warn!("{message}"),
                    EngineEvent::Stopped => break,
                    _ => {}
                }
            }
        }
    }

    engine.wait().await?;

    let stats = ledger.stats();
    println!(
        "done: {} succeeded, {} failed, {} timed out, {} cancelled ({} total in ledger)",
        stats.succeeded, stats.failed, stats.timed_out, stats.cancelled, stats.total
    );
    Ok(())
}
