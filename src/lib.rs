//! This crate exposes the internal functionality of the rustsweep scan
//! dispatcher.
//!
//! rustsweep turns a list of targets (CIDRs, IPs and hostnames, minus
//! excludes) and a port list into a stream of individually rate-limited,
//! concurrency-bounded probe tasks. It runs them against a pluggable
//! [`Probe`](crate::scanner::Probe), streams open results back, and reports
//! live progress while the run stays cancellable.
//!
//! ## Architecture Overview
//!
//! 1. **Input Processing**: [`input::resolve`] merges caller options over the
//!    engine defaults and the fallback constants.
//! 2. **Target Expansion**: [`address::expand_targets`] resolves, filters,
//!    unions and subtracts targets into sorted address ranges.
//! 3. **Dispatch**: a target stream walks the ranges round-robin in port
//!    chunks, an optional preflight skips dead addresses, and a single
//!    dispatch loop admits tasks through the inflight gate, the token
//!    buckets and the worker pool.
//! 4. **Feedback**: in auto mode the worker pool is resized every two
//!    seconds from error rate, timeout rate, CPU load and backlog.
//! 5. **Reporting**: progress snapshots are coalesced and published at most
//!    every 200ms; the run ends with a [`RunSummary`](scanner::RunSummary).
//!
//! ## Basic Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use rustsweep::input::ScanOptions;
//! use rustsweep::scanner::{Engine, FnProbe, ProbeOutcome, ScanRequest, ScanTask};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::default();
//!
//!     let mut request = ScanRequest::new(["203.0.113.0/30"]);
//!     request.options = ScanOptions {
//!         ports: Some("80,443".to_owned()),
//!         max_pps: Some(0),
//!         per_ip_max_pps: Some(0),
//!         ..ScanOptions::default()
//!     };
//!
//!     // Pretend only 443 answers.
//!     let probe = Arc::new(FnProbe(|task: ScanTask| async move {
//!         if task.port == 443 {
//!             ProbeOutcome::open(Duration::from_millis(1))
//!         } else {
//!             ProbeOutcome::closed("connection refused", Duration::from_millis(1))
//!         }
//!     }));
//!
//!     let mut handle = engine.run(&request, probe).await?;
//!     let mut open = Vec::new();
//!     while let Some(result) = handle.results.recv().await {
//!         open.push(result.socket());
//!     }
//!     let summary = handle.wait().await?;
//!
//!     assert_eq!(open.len(), 4);
//!     assert_eq!(summary.submitted, 8);
//!     Ok(())
//! }
//! ```
//!
//! ## Safety Rail
//!
//! Loopback and private addresses are refused unless `allow_loopback` /
//! `allow_private` are set. Unspecified, multicast, link-local and broadcast
//! addresses are always refused.
#![allow(clippy::needless_doctest_main)]

pub mod tui;

pub mod error;

pub mod input;

pub mod scanner;

pub mod address;
