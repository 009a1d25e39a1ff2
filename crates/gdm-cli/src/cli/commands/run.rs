//! `gdm run` – download a batch of URLs as one group.

use anyhow::{bail, Context, Result};
use gdm_core::config::GdmConfig;
use gdm_core::event::Notification;
use gdm_core::transport::{CurlOptions, CurlTransport};
use gdm_core::{url_model, DownloadGroup, TaskState};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::input::{self, Entry};

/// Exit code after Ctrl-C, as a shell reports SIGINT.
const EXIT_INTERRUPTED: i32 = 130;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct RunArgs {
    pub urls: Vec<String>,
    pub input: Option<PathBuf>,
    pub dir: PathBuf,
    pub jobs: Option<usize>,
    pub local_only: bool,
}

pub async fn run_group(cfg: &GdmConfig, args: RunArgs) -> Result<i32> {
    let mut entries: Vec<Entry> = args.urls.iter().map(Entry::url_only).collect();
    if let Some(file) = &args.input {
        entries.extend(input::read_entries(file)?);
    }
    if entries.is_empty() {
        bail!("nothing to download: give URLs or --input FILE");
    }
    let targets = resolve_paths(&args.dir, &entries);

    let mut group_cfg = cfg.group_config();
    if let Some(jobs) = args.jobs {
        group_cfg.limit = jobs;
    }
    let transport = Arc::new(CurlTransport::new(CurlOptions::from_config(cfg)));
    let group = Arc::new(DownloadGroup::with_transport(group_cfg, transport));

    for (entry, path) in entries.iter().zip(targets) {
        let weight = entry.weight.unwrap_or(1.0);
        group
            .submit_with(entry.url.as_str(), path, weight, args.local_only)
            .with_context(|| format!("submitting {}", entry.url))?;
    }
    let total = group.all_tasks().len();
    tracing::info!(tasks = total, limit = group.limit(), "starting group");
    println!("Downloading {} file(s), {} at a time", total, group.limit());

    let mut progress = group.total_progress_stream()?;
    group.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            n = progress.recv() => match n {
                Some(Notification::Next(p)) => {
                    let done = finished(&group);
                    print!("\r  {:5.1}%  {}/{} finished  ", p.progress, done, total);
                    let _ = std::io::stdout().flush();
                }
                Some(Notification::Completed) | Some(Notification::Failed(_)) | None => break,
            },
            _ = &mut ctrl_c => {
                interrupted = true;
                println!();
                println!("Stopping; partial files are kept for the next run.");
                let g = Arc::clone(&group);
                tokio::task::spawn_blocking(move || g.stop_group())
                    .await
                    .context("stop task panicked")??;
                settle(&group).await;
                break;
            }
        }
    }
    println!();

    let code = report(&group, interrupted);
    let g = Arc::clone(&group);
    tokio::task::spawn_blocking(move || g.destroy_group())
        .await
        .context("destroy task panicked")??;
    Ok(code)
}

/// Destination for each entry: explicit paths relative to `dir`, derived
/// names for the rest (numbered when two URLs share a name).
fn resolve_paths(dir: &Path, entries: &[Entry]) -> Vec<PathBuf> {
    let implicit: Vec<&str> = entries
        .iter()
        .filter(|e| e.path.is_none())
        .map(|e| e.url.as_str())
        .collect();
    let mut derived = url_model::destinations(dir, implicit).into_iter();
    entries
        .iter()
        .map(|e| match &e.path {
            Some(p) => dir.join(p),
            None => derived.next().unwrap_or_else(|| dir.join(url_model::file_name(&e.url))),
        })
        .collect()
}

fn finished(group: &DownloadGroup) -> usize {
    group
        .all_tasks()
        .iter()
        .filter(|t| t.state().is_finished())
        .count()
}

/// Wait until stopped runs have let go of their temp files.
async fn settle(group: &DownloadGroup) {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while group
        .all_tasks()
        .iter()
        .any(|t| t.state() == TaskState::Downloading)
    {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("transfers still running after stop");
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn report(group: &DownloadGroup, interrupted: bool) -> i32 {
    let tasks = group.all_tasks();
    let mut failed = 0usize;
    for t in &tasks {
        match t.state() {
            TaskState::Success => println!("  ok       {}", t.local_path().display()),
            TaskState::Error => {
                failed += 1;
                println!("  FAILED   {}", t.url());
            }
            state => println!("  {:<8} {}", state.as_str().to_lowercase(), t.url()),
        }
    }
    println!(
        "{} of {} finished, {} failed",
        tasks
            .iter()
            .filter(|t| t.state() == TaskState::Success)
            .count(),
        tasks.len(),
        failed
    );
    if failed > 0 {
        1
    } else if interrupted {
        EXIT_INTERRUPTED
    } else {
        0
    }
}
