#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::if_not_else, clippy::non_ascii_literal)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::debug;
use rustsweep::input::{Config, Opts, FALLBACK_PROBE_TIMEOUT};
use rustsweep::scanner::progress::Progress;
use rustsweep::scanner::{Engine, RunSummary, ScanRequest, ScanResult, TcpConnectProbe};
use rustsweep::{detail, output, warning};

#[cfg(not(tarpaulin_include))]
#[tokio::main]
/// Adaptive TCP sweep.
/// The dispatching itself lives in `rustsweep::scanner`.
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut opts: Opts = Opts::read();
    let config = Config::read(opts.config_path.clone())?;
    opts.merge(&config);

    debug!("Main() `opts` arguments are {opts:?}");

    #[cfg(unix)]
    adjust_ulimit_size(&opts);

    let request = ScanRequest {
        targets: opts.addresses.clone(),
        targets_text: None,
        excludes: opts.exclude_addresses.clone().unwrap_or_default(),
        options: opts.scan_options(),
    };
    let timeout = opts.timeout.map_or(FALLBACK_PROBE_TIMEOUT, Duration::from_millis);
    let probe = Arc::new(TcpConnectProbe::new(timeout, opts.tries));

    let engine = Engine::default();
    let handle = match engine.run(&request, probe).await {
        Ok(handle) => handle,
        Err(e) => {
            warning!(format!("{e}"), opts.greppable, opts.accessible);
            std::process::exit(1);
        }
    };

    let (mut results, mut progress, control) = handle.into_parts();
    let cancel = control.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let bar = progress_bar(opts.greppable || opts.json || opts.accessible);
    let bar_task = {
        let bar = bar.clone();
        tokio::spawn(async move {
            let mut last = Progress::default();
            while let Some(snapshot) = progress.recv().await {
                bar.set_length(snapshot.planned);
                bar.set_position(snapshot.finished());
                bar.set_message(format!("{} active, {:.0} pps", snapshot.active, snapshot.pps));
                last = snapshot;
            }
            bar.finish_and_clear();
            last
        })
    };

    let mut open: BTreeMap<IpAddr, Vec<u16>> = BTreeMap::new();
    while let Some(result) = results.recv().await {
        if opts.json {
            println!("{}", serde_json::to_string(&result)?);
        } else if !opts.greppable {
            bar.suspend(|| print_open(&result, opts.accessible));
        }
        open.entry(result.address).or_default().push(result.port);
    }

    let summary = control.finish().await?;
    let last = bar_task.await?;
    debug!("Final progress {last:?}");

    if opts.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else if opts.greppable {
        for (ip, ports) in &open {
            println!("{} -> [{}]", ip, ports.iter().sorted().join(","));
        }
    } else {
        report(&summary, &open, opts.accessible);
    }

    if summary.cancelled {
        warning!("Scan cancelled before completion.", opts.greppable, opts.accessible);
    }
    Ok(())
}

fn print_open(result: &ScanResult, accessible: bool) {
    let target = match &result.host {
        Some(host) => format!("{} ({host})", result.socket()),
        None => result.socket().to_string(),
    };
    if accessible {
        println!("Open {target}");
    } else {
        println!("Open {}", target.purple());
    }
}

fn report(summary: &RunSummary, open: &BTreeMap<IpAddr, Vec<u16>>, accessible: bool) {
    detail!(
        format!(
            "{} probes in {:.2}s: {} open, {} closed, {} timed out",
            summary.submitted,
            summary.elapsed_ms as f64 / 1000.0,
            summary.succeeded,
            summary.failed.saturating_sub(summary.preflight_rejected),
            summary.timed_out
        ),
        false,
        accessible
    );
    if summary.unreachable_addresses > 0 {
        detail!(
            format!(
                "{} addresses skipped by preflight ({} ports)",
                summary.unreachable_addresses, summary.preflight_rejected
            ),
            false,
            accessible
        );
    }
    for (ip, ports) in open {
        output!(
            format!("{} -> [{}]", ip, ports.iter().sorted().join(",")),
            false,
            accessible
        );
    }
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.greppable,
                opts.accessible
            );
        } else {
            warning!("ERROR. Failed to set ulimit value.", opts.greppable, opts.accessible);
        }
    }

    if let Ok((soft, _)) = Resource::NOFILE.get() {
        debug!("File descriptor soft limit is {soft}");
    }
}
