//! # STP Harvest
//!
//! Watches a directory tree for bedside monitor recordings, converts each one
//! to HDF5 through an external engine, shifts every timestamp by a
//! per-recording offset and files the de-identified result under the
//! patient's id.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌────────────┐   ┌────────────┐
//! │  Stability   │──▶│ Identity │──▶│ Conversion │──▶│ De-identify│
//! │  detector    │   │  merger  │   │ dispatcher │   │  renamer   │
//! └──────┬───────┘   └────┬─────┘   └────────────┘   └─────┬──────┘
//!        │                │                                │
//!        ▼                ▼                                ▼
//!   ┌──────────┐    ┌──────────┐                     ┌──────────┐
//!   │  Ledger  │◀───┤ Identity │                     │ Success/ │
//!   │ (SQLite) │    │ (SQLite) │                     │  <pid>/  │
//!   └──────────┘    └──────────┘                     └──────────┘
//! ```
//!
//! Every source file ends in exactly one place: the success tree, one of the
//! `Skipped/` quarantines, or one of the `Failed/` quarantines. The
//! completion ledger keeps delivered files from being converted twice.
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init --create-identity-store   # output tree, ledger, empty identity store
//! harvest once                           # one cycle
//! harvest run                            # cycle until Ctrl-C
//! harvest status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and startup checks |
//! | [`models`] | Core data types |
//! | [`layout`] | Output tree and quarantine moves |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema setup |
//! | [`ledger`] | Completion ledger |
//! | [`identity`] | Identity directory and update batches |
//! | [`scanner`] | Stability detector |
//! | [`merge`] | Identity merger |
//! | [`engine`] | External conversion engine |
//! | [`scratch`] | Per-job scratch area |
//! | [`dispatch`] | Conversion dispatcher |
//! | [`progress`] | Progress tally |
//! | [`deidentify`] | De-identification renamer |
//! | [`pipeline`] | Control loop |
//! | [`status`] | Status report |

pub mod config;
pub mod db;
pub mod deidentify;
pub mod dispatch;
pub mod engine;
pub mod identity;
pub mod layout;
pub mod ledger;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod scanner;
pub mod scratch;
pub mod status;
