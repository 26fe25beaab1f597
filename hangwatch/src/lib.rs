//! # hangwatch - Dispatch Thread Hang Watchdog
//!
//! hangwatch watches a single-threaded event-dispatch loop (a UI thread, an
//! actor mailbox, a game loop) and explains why a dispatch is taking long.
//! The host notifies it when each dispatch starts and ends; a background
//! scan thread samples the dispatch thread's stack every few milliseconds,
//! credits elapsed time to the frames that stayed on the stack, and
//! escalates through contention checks and forced reports as the dispatch
//! keeps running.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Host Dispatch Loop                          │
//! │        before_dispatch() ── handler ── after_dispatch()         │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ DispatchHook
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 DispatchWatchdog (watchdog)                     │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  In-flight   │──▶│   Dispatch   │──▶│  Contention  │         │
//! │  │    queue     │   │   Analyzer   │   │   Scanner    │         │
//! │  └──────────────┘   └──────┬───────┘   └──────┬───────┘         │
//! │         ▲                  │ Synopsis         │                 │
//! │   scan thread              ▼                  ▼                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Deadlock   │──▶│  ReportSink  │──▶│ JSON export  │         │
//! │  │   Scanner    │   │ (log/memory) │   │              │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ThreadIntrospector
//!                         ▼
//!          shadow stacks  ·  /proc  ·  fixed snapshots
//! ```
//!
//! ## Module Structure
//!
//! - [`watchdog`]: hook, in-flight queue, per-dispatch analyzers, scan timers
//! - [`analysis`]: stack diffing, profile synopsis, contention and deadlock
//!   analysis
//! - [`classification`]: risky call sites, application code, protected
//!   resources
//! - [`introspection`]: thread introspection backends
//! - [`report`]: report events, sinks and text formatting
//! - [`export`]: JSON report export
//! - [`config`]: watchdog thresholds and pattern tables
//! - [`host`]: a demo dispatch loop and workload
//! - [`cli`], [`preflight`], [`process_lookup`]: the `hangwatch` binary
//! - [`domain`], [`clock`]: shared types and time sources
//!
//! ## Escalation
//!
//! For a dispatch that has run for `elapsed`:
//!
//! 1. Past each contention-check interval: scan the dispatch thread's
//!    locks and report threads holding what it waits on.
//! 2. Otherwise, past each forced-logging interval: assign a hang id, scan
//!    for contention, emit a forced report, and check for deadlocks.
//!
//! Forced reports go out at `High`, `High`, `Medium`, then `Info`.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Run the demo workload under the watchdog
//! RUST_LOG=info hangwatch demo --duration 5
//!
//! # Inspect another process
//! hangwatch threads my-app
//! ```

pub mod analysis;
pub mod classification;
pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod export;
pub mod host;
pub mod introspection;
pub mod preflight;
pub mod process_lookup;
pub mod report;
pub mod watchdog;
