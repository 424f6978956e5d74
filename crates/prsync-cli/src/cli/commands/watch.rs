use anyhow::{Context, Result};
use chrono::Local;
use prsync_core::github::{self, PullRequest, RepoSlug, WorkflowRun};
use prsync_core::{PollState, Resource, Subscription, SyncConfig};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::cli::args::WatchArgs;
use crate::exit_codes;

pub async fn run(args: WatchArgs, mut config: SyncConfig) -> Result<i32> {
    let repos = args
        .repos
        .iter()
        .map(|r| RepoSlug::parse(r))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid repository argument")?;

    if let Some(secs) = args.interval {
        config = config.with_poll_interval(Duration::from_secs(secs));
    }

    let layer = super::build_layer(config, !args.no_snapshots)?;
    if let Err(e) = layer.start().await {
        eprintln!("authentication failed: {}", e);
        return Ok(exit_codes::SYNC_FAILED);
    }

    let pulls = layer.polling_engine::<Vec<PullRequest>>();
    let runs = layer.polling_engine::<Vec<WorkflowRun>>();
    let mut printers = JoinSet::new();

    for repo in &repos {
        let sub = pulls.subscribe(
            repo.resource_key("pulls"),
            github::open_pull_requests(layer.gateway().clone(), repo),
        )?;
        printers.spawn(print_changes(sub, |pulls: &Vec<PullRequest>| describe_pulls(pulls)));

        if !args.no_runs {
            let sub = runs.subscribe(
                repo.resource_key("runs"),
                github::workflow_runs(layer.gateway().clone(), repo),
            )?;
            printers.spawn(print_changes(sub, |runs: &Vec<WorkflowRun>| describe_runs(runs)));
        }
    }

    eprintln!(
        "Watching {} repositories every {:?}. Send SIGHUP to refresh now, Ctrl+C to stop.",
        repos.len(),
        layer.config().polling.interval
    );

    let mut hangups = Hangups::new()?;
    let mut kill = layer.kill_switch().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping.");
                break;
            }
            _ = hangups.recv() => {
                eprintln!("[{}] refreshing all repositories", now());
                layer.refresh_all();
            }
            changed = kill.changed() => {
                if changed.is_err() {
                    break;
                }
                if *kill.borrow_and_update() {
                    let until = layer
                        .gateway()
                        .suspended_until()
                        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    eprintln!("[{}] rate limited, polling paused until {}", now(), until);
                } else {
                    eprintln!("[{}] polling resumed", now());
                }
            }
        }
    }

    pulls.shutdown().await;
    runs.shutdown().await;
    while printers.join_next().await.is_some() {}
    Ok(exit_codes::SUCCESS)
}

async fn print_changes<T, F>(mut sub: Subscription<T>, describe: F)
where
    T: Resource,
    F: Fn(&T) -> Vec<String>,
{
    while let Ok(state) = sub.changed().await {
        match state {
            PollState::Loading => {}
            PollState::Fresh { data, .. } => {
                println!("[{}] {}", now(), sub.key());
                for line in describe(&data) {
                    println!("  {}", line);
                }
            }
            PollState::Stale {
                data,
                fetched_at,
                reason,
            } => {
                println!(
                    "[{}] {} (stale since {}: {})",
                    now(),
                    sub.key(),
                    fetched_at.with_timezone(&Local).format("%H:%M:%S"),
                    reason
                );
                for line in describe(&data) {
                    println!("  {}", line);
                }
            }
        }
    }
}

/// SIGHUP stream; never fires where the signal does not exist.
struct Hangups {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Hangups {
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
            Ok(Self { signal })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.signal.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

fn now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn describe_pulls(pulls: &[PullRequest]) -> Vec<String> {
    if pulls.is_empty() {
        return vec!["no open pull requests".to_string()];
    }
    pulls
        .iter()
        .map(|pr| {
            let draft = if pr.draft { " [draft]" } else { "" };
            format!("#{} {}{} ({})", pr.number, pr.title, draft, pr.user.login)
        })
        .collect()
}

fn describe_runs(runs: &[WorkflowRun]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["no workflow runs".to_string()];
    }
    runs.iter()
        .map(|run| {
            let outcome = if run.is_running() {
                run.status.as_deref().unwrap_or("pending")
            } else {
                run.conclusion.as_deref().unwrap_or("unknown")
            };
            format!(
                "{} on {}: {}",
                run.name.as_deref().unwrap_or("workflow"),
                run.head_branch.as_deref().unwrap_or(&run.head_sha),
                outcome
            )
        })
        .collect()
}
