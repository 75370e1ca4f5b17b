//! The harvest control loop.
//!
//! One cycle runs the stages strictly in sequence:
//!
//! ```text
//! identity refresh → stability detector → identity merger
//!     → conversion dispatcher → de-identification renamer → ledger update
//! ```
//!
//! A cycle with no matched files, or with nothing delivered, ends early and
//! leaves the ledger untouched.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::deidentify;
use crate::dispatch::{self, DispatchContext};
use crate::engine::ConversionEngine;
use crate::identity::{self, IdentityStore, RefreshOutcome};
use crate::layout::OutputLayout;
use crate::ledger::Ledger;
use crate::merge;
use crate::progress::{ProgressReporter, Tally};
use crate::scanner::StabilityDetector;
use crate::scratch;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No candidate had an identity record.
    NoMatches,
    /// Jobs ran but no artifact reached the success tree.
    NothingDelivered(Tally),
    Delivered {
        tally: Tally,
        /// Source names with at least one delivered artifact.
        delivered: usize,
        /// Names newly added to the ledger.
        recorded: u64,
    },
}

pub struct Harvester {
    config: Config,
    layout: OutputLayout,
    ledger: Ledger,
    identities: IdentityStore,
    dispatch: Arc<DispatchContext>,
    cycles: u64,
}

impl Harvester {
    /// Run the startup checks and open both stores. Fails on a missing root
    /// or identity store before any work starts.
    pub async fn open(config: Config, engine: Arc<dyn ConversionEngine>) -> Result<Self> {
        config.check_paths()?;

        let layout = OutputLayout::new(&config);
        layout.ensure()?;
        let swept = scratch::clear_all(layout.scratch());
        if swept > 0 {
            info!(swept, "cleared scratch files left by a previous run");
        }

        let ledger = Ledger::open(&config.paths.ledger_db()).await?;
        let identities = IdentityStore::open(&config.paths.identity_db).await?;
        let dispatch = Arc::new(DispatchContext::new(&config, layout.clone(), engine));

        Ok(Self {
            config,
            layout,
            ledger,
            identities,
            dispatch,
            cycles: 0,
        })
    }

    /// Replace the per-job progress reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        let ctx = DispatchContext::new(&self.config, self.layout.clone(), self.dispatch.engine.clone())
            .with_reporter(reporter);
        self.dispatch = Arc::new(ctx);
        self
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Fold waiting identity updates into the store. A no-op when no update
    /// folder is configured.
    pub async fn refresh_identities(&self) -> Result<RefreshOutcome> {
        match &self.config.paths.identity_updates {
            Some(dir) => {
                identity::refresh(&self.identities, dir, &self.layout, &self.config.paths.input_root)
                    .await
            }
            None => Ok(RefreshOutcome::NoUpdates),
        }
    }

    /// Run one full cycle. Blocks in the detector until candidates exist.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycles += 1;
        let span = info_span!("cycle", n = self.cycles);
        self.cycle().instrument(span).await
    }

    async fn cycle(&self) -> Result<CycleOutcome> {
        match self.refresh_identities().await {
            Ok(outcome) => debug!(?outcome, "identity refresh"),
            Err(e) => warn!(error = %format!("{:#}", e), "identity refresh failed; using existing table"),
        }

        let detector = StabilityDetector::new(
            &self.config.paths.input_root,
            &self.layout,
            self.config.pipeline.poll_interval(),
        )?;
        let candidates = detector.wait_for_candidates(&self.ledger).await?;

        let table = self.identities.load().await?;
        let matched = merge::merge_with_identities(candidates, &table, &self.layout);
        if matched.is_empty() {
            info!("no files were matched with patient information; restarting");
            return Ok(CycleOutcome::NoMatches);
        }

        let tally = dispatch::dispatch(Arc::clone(&self.dispatch), matched.clone()).await;

        let delivered = deidentify::relocate_staged(
            &self.layout,
            &matched,
            &self.config.naming,
            self.config.engine.wave_data,
        )?;
        let delivered = match delivered {
            Some(names) if !names.is_empty() => names,
            _ => {
                info!("nothing was delivered this cycle; restarting");
                return Ok(CycleOutcome::NothingDelivered(tally));
            }
        };

        let recorded = self.ledger.append(&delivered).await?;
        info!(
            delivered = delivered.len(),
            recorded, "cycle complete"
        );
        Ok(CycleOutcome::Delivered {
            tally,
            delivered: delivered.len(),
            recorded,
        })
    }

    /// Cycle until interrupted. A failed cycle is logged and retried after
    /// one poll interval. On Ctrl-C in-flight jobs are dropped, which kills
    /// their engine processes, and the scratch area is cleared.
    pub async fn run_forever(&mut self) -> Result<()> {
        info!(
            input = %self.config.paths.input_root.display(),
            output = %self.layout.root().display(),
            workers = self.config.pipeline.workers,
            "harvester started"
        );

        loop {
            let result = tokio::select! {
                result = self.run_cycle() => result,
                _ = tokio::signal::ctrl_c() => break,
            };
            match result {
                Ok(outcome) => debug!(?outcome, "cycle finished"),
                Err(e) => {
                    error!(error = %format!("{:#}", e), "cycle failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.pipeline.poll_interval()) => {}
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            }
        }

        warn!("interrupted; stopping");
        let swept = scratch::clear_all(self.layout.scratch());
        info!(swept, "scratch area cleared");
        self.close().await;
        Ok(())
    }

    pub async fn close(&self) {
        self.ledger.close().await;
        self.identities.close().await;
    }
}
