//! Conversion dispatcher.
//!
//! Runs one job per matched file with at most `workers` in flight. Each job
//! copies its source into the scratch area, runs the decode and encode stages
//! (each bounded by the job timeout), and moves the engine's outputs into the
//! shared `Converted` staging area. Finished jobs are drained in completion
//! order; each outcome routes the source file exactly once:
//!
//! | Outcome   | Source file                                  |
//! |-----------|----------------------------------------------|
//! | Succeeded | left in place, or deleted when configured    |
//! | TimedOut  | moved to `Failed/TimedOut`                   |
//! | Errored   | moved to `Failed/ErroredOut`                 |
//!
//! [`dispatch`] returns only after every job is terminal, so the renamer
//! never sees output from a job that is still running.

use anyhow::Context;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, EngineConfig};
use crate::deidentify;
use crate::engine::{ConversionEngine, DecodeRequest, EncodeRequest, EngineError};
use crate::layout::{self, OutputLayout, Quarantine};
use crate::models::{JobOutcome, JobState, MatchedFile};
use crate::progress::{JobFinished, LogProgress, ProgressReporter, Tally};
use crate::scratch;

/// Everything a job needs, shared read-only across workers.
pub struct DispatchContext {
    pub engine: Arc<dyn ConversionEngine>,
    pub layout: OutputLayout,
    pub options: EngineConfig,
    pub workers: usize,
    pub timeout: Duration,
    pub delete_source_on_success: bool,
    pub reporter: Arc<dyn ProgressReporter>,
}

impl DispatchContext {
    pub fn new(config: &Config, layout: OutputLayout, engine: Arc<dyn ConversionEngine>) -> Self {
        Self {
            engine,
            layout,
            options: config.engine.clone(),
            workers: config.pipeline.workers,
            timeout: config.pipeline.job_timeout(),
            delete_source_on_success: config.pipeline.delete_source_on_success,
            reporter: Arc::new(LogProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

/// A matched file and where its conversion stands.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub file: MatchedFile,
    state: JobState,
}

impl ConversionJob {
    pub fn new(file: MatchedFile) -> Self {
        Self {
            file,
            state: JobState::Queued,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn start(&mut self) {
        self.state = JobState::Running;
    }

    /// Set the terminal state. Only the first call has an effect.
    fn finish(&mut self, outcome: &JobOutcome) {
        if !self.state.is_terminal() {
            self.state = outcome.state();
        }
    }
}

/// Why a job stopped early.
enum JobFailure {
    TimedOut,
    Errored(String),
}

impl From<anyhow::Error> for JobFailure {
    fn from(e: anyhow::Error) -> Self {
        JobFailure::Errored(format!("{:#}", e))
    }
}

impl From<EngineError> for JobFailure {
    fn from(e: EngineError) -> Self {
        JobFailure::Errored(e.to_string())
    }
}

/// Convert every matched file and route each source by outcome.
pub async fn dispatch(ctx: Arc<DispatchContext>, files: Vec<MatchedFile>) -> Tally {
    let started = Instant::now();
    let mut tally = Tally::new(files.len());
    info!(
        jobs = files.len(),
        workers = ctx.workers,
        timeout_secs = ctx.timeout.as_secs(),
        "starting conversions"
    );

    let permits = Arc::new(Semaphore::new(ctx.workers.max(1)));
    let mut set = JoinSet::new();
    let mut names = HashMap::new();

    for file in files {
        let basename = file.source.basename().to_string();
        let span = info_span!("job", file = %basename);
        let ctx = Arc::clone(&ctx);
        let permits = Arc::clone(&permits);

        let handle = set.spawn(
            async move {
                let mut job = ConversionJob::new(file);
                let _permit = permits.acquire().await.ok();
                job.start();
                debug!("job running");
                let outcome = run_job(&ctx, &job.file).await;
                job.finish(&outcome);
                (job, outcome)
            }
            .instrument(span),
        );
        names.insert(handle.id(), basename);
    }

    while let Some(joined) = set.join_next_with_id().await {
        let (basename, outcome) = match joined {
            Ok((id, (job, outcome))) => {
                names.remove(&id);
                route(&ctx, &job.file, &outcome);
                (job.file.source.basename().to_string(), outcome)
            }
            Err(e) => {
                let basename = names.remove(&e.id()).unwrap_or_default();
                error!(file = %basename, error = %e, "conversion task failed; source left in place");
                if let Err(e) = scratch::clear(ctx.layout.scratch(), &basename) {
                    warn!(file = %basename, error = %e, "scratch cleanup failed");
                }
                (basename, JobOutcome::Errored(format!("task failed: {}", e)))
            }
        };

        tally.record(&outcome);
        ctx.reporter.report(&JobFinished {
            basename: &basename,
            outcome: &outcome,
            tally,
            elapsed: started.elapsed(),
        });
    }

    info!(
        succeeded = tally.succeeded,
        timed_out = tally.timed_out,
        errored = tally.errored,
        "conversions finished"
    );
    tally
}

/// Run one conversion job to a terminal outcome. The basename's scratch
/// files are removed whatever happens.
pub async fn run_job(ctx: &DispatchContext, file: &MatchedFile) -> JobOutcome {
    let started = Instant::now();
    let result = convert(ctx, file).await;

    if let Err(e) = scratch::clear(ctx.layout.scratch(), file.source.basename()) {
        warn!(error = %e, "scratch cleanup failed");
    }

    match result {
        Ok(outputs) => {
            debug!(outputs, "job produced output");
            JobOutcome::Succeeded(started.elapsed())
        }
        Err(JobFailure::TimedOut) => JobOutcome::TimedOut,
        Err(JobFailure::Errored(msg)) => JobOutcome::Errored(msg),
    }
}

async fn convert(ctx: &DispatchContext, file: &MatchedFile) -> Result<usize, JobFailure> {
    let scratch = ctx.layout.scratch();
    let basename = file.source.basename();

    // Leftovers from a crashed run
    scratch::clear(scratch, basename)?;

    let work_copy = scratch.join(&file.source.file_name);
    tokio::fs::copy(&file.source.path, &work_copy)
        .await
        .with_context(|| format!("Failed to copy {} into scratch", file.source.path.display()))?;

    let intermediate = scratch.join(format!("{}.xml", basename));
    let decode = DecodeRequest {
        source: work_copy.clone(),
        output: intermediate.clone(),
        system: ctx.options.system,
        wave_data: ctx.options.wave_data,
    };
    bounded(ctx.timeout, ctx.engine.decode(&decode)).await?;
    remove_if_present(&work_copy)?;

    let encode = EncodeRequest {
        input: intermediate.clone(),
        offset_seconds: file.offset_seconds,
        single_output_file: ctx.options.single_output_file,
    };
    bounded(ctx.timeout, ctx.engine.encode(&encode)).await?;
    remove_if_present(&intermediate)?;

    let outputs = scratch::outputs_for(scratch, basename)?;
    if outputs.is_empty() {
        return Err(JobFailure::Errored("no output produced".to_string()));
    }
    // Anything the renamer could not join back would be stranded in staging
    if let Some(stray) = outputs.iter().find(|o| {
        !matches!(deidentify::parse_staged_name(o), Some(a) if a.bed_and_seconds == basename)
    }) {
        return Err(JobFailure::Errored(format!(
            "unrecognised output name: {}",
            stray.display()
        )));
    }
    Ok(stage_outputs(&outputs, &ctx.layout.converted())?)
}

/// Move a job's outputs into staging, all or none. On failure the outputs
/// already moved are returned to where they came from.
fn stage_outputs(outputs: &[PathBuf], converted: &Path) -> anyhow::Result<usize> {
    let mut moved: Vec<(&PathBuf, PathBuf)> = Vec::with_capacity(outputs.len());
    for output in outputs {
        let Some(name) = output.file_name() else {
            continue;
        };
        let dest = converted.join(name);
        if let Err(e) = layout::move_file(output, &dest) {
            for (from, to) in moved.iter().rev() {
                if let Err(undo) = layout::move_file(to, from) {
                    warn!(error = %undo, file = %to.display(), "could not unstage output");
                    let _ = std::fs::remove_file(to);
                }
            }
            return Err(e);
        }
        moved.push((output, dest));
    }
    Ok(moved.len())
}

/// Run a stage under the job timeout. Dropping the stage future on expiry
/// kills the child process.
async fn bounded<F>(limit: Duration, stage: F) -> Result<(), JobFailure>
where
    F: Future<Output = Result<(), EngineError>>,
{
    match tokio::time::timeout(limit, stage).await {
        Ok(result) => result.map_err(JobFailure::from),
        Err(_) => Err(JobFailure::TimedOut),
    }
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Move or delete the source according to its outcome.
fn route(ctx: &DispatchContext, file: &MatchedFile, outcome: &JobOutcome) {
    let name = &file.source.file_name;
    let quarantine = match outcome {
        JobOutcome::Succeeded(_) => {
            if ctx.delete_source_on_success {
                match std::fs::remove_file(&file.source.path) {
                    Ok(()) => debug!(file = %name, "source deleted"),
                    Err(e) => warn!(file = %name, error = %e, "could not delete source"),
                }
            }
            return;
        }
        JobOutcome::TimedOut => {
            warn!(file = %name, "conversion timed out");
            Quarantine::TimedOut
        }
        JobOutcome::Errored(msg) => {
            error!(file = %name, error = %msg, "conversion failed");
            Quarantine::ErroredOut
        }
    };

    if let Err(e) = ctx.layout.quarantine_file(&file.source.path, quarantine) {
        error!(file = %name, error = %e, "could not move failed source to {}", quarantine.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceFile;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        Convert,
        Hang,
        FailEncode,
        NoOutput,
    }

    /// Writes the intermediate, then one staged file per day.
    struct FakeEngine {
        behaviour: HashMap<String, Behaviour>,
        days: usize,
        running: AtomicUsize,
        peak: AtomicUsize,
        offsets: Mutex<Vec<i64>>,
    }

    impl FakeEngine {
        fn new(behaviour: &[(&str, Behaviour)], days: usize) -> Self {
            Self {
                behaviour: behaviour
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
                days,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                offsets: Mutex::new(Vec::new()),
            }
        }

        fn behaviour_for(&self, path: &Path) -> Behaviour {
            let stem = path.file_stem().unwrap().to_string_lossy().to_string();
            self.behaviour
                .get(&stem)
                .copied()
                .unwrap_or(Behaviour::Convert)
        }
    }

    #[async_trait]
    impl ConversionEngine for FakeEngine {
        async fn decode(&self, req: &DecodeRequest) -> Result<(), EngineError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.behaviour_for(&req.source) == Behaviour::Hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            std::fs::write(&req.output, b"<xml/>").unwrap();
            Ok(())
        }

        async fn encode(&self, req: &EncodeRequest) -> Result<(), EngineError> {
            self.offsets.lock().unwrap().push(req.offset_seconds);
            match self.behaviour_for(&req.input) {
                Behaviour::FailEncode => {
                    return Err(EngineError::Exit {
                        stage: crate::engine::Stage::Encode,
                        status: "exit status: 2".to_string(),
                        output: "bad input".to_string(),
                    })
                }
                Behaviour::NoOutput => return Ok(()),
                _ => {}
            }
            let dir = req.input.parent().unwrap();
            let stem = req.input.file_stem().unwrap().to_string_lossy();
            for day in 1..=self.days {
                let name = format!("{}-_-2024-01-{:02}.hdf5", stem, day);
                std::fs::write(dir.join(name), b"hdf5").unwrap();
            }
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        input: std::path::PathBuf,
        layout: OutputLayout,
        config: Config,
    }

    fn fixture(extra: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        let config = crate::config::parse_config(&format!(
            "[paths]\ninput_root = \"{0}\"\noutput_root = \"{1}/out\"\nidentity_db = \"{1}/ids.sqlite\"\n{2}",
            input.display(),
            tmp.path().display(),
            extra
        ))
        .unwrap();
        let layout = OutputLayout::new(&config);
        layout.ensure().unwrap();
        Fixture {
            _tmp: tmp,
            input,
            layout,
            config,
        }
    }

    fn matched(f: &Fixture, name: &str, offset: i64) -> MatchedFile {
        let path = f.input.join(name);
        std::fs::write(&path, vec![0u8; 1000]).unwrap();
        MatchedFile {
            source: SourceFile::new(path, 1000, Utc::now()),
            patient_id: 42,
            offset_seconds: offset,
        }
    }

    fn context(f: &Fixture, engine: Arc<FakeEngine>) -> Arc<DispatchContext> {
        Arc::new(DispatchContext::new(&f.config, f.layout.clone(), engine))
    }

    #[test]
    fn test_job_state_set_once() {
        let f = fixture("");
        let mut job = ConversionJob::new(matched(&f, "A-1.stp", 0));
        assert_eq!(job.state(), JobState::Queued);
        job.start();
        assert_eq!(job.state(), JobState::Running);
        job.finish(&JobOutcome::TimedOut);
        job.finish(&JobOutcome::Succeeded(Duration::ZERO));
        assert_eq!(job.state(), JobState::TimedOut);
    }

    #[tokio::test]
    async fn test_success_stages_output_and_keeps_source() {
        let f = fixture("");
        let engine = Arc::new(FakeEngine::new(&[], 1));
        let file = matched(&f, "BED1-1000.stp", 100);

        let tally = dispatch(context(&f, engine.clone()), vec![file]).await;

        assert_eq!(tally.succeeded, 1);
        assert!(f.input.join("BED1-1000.stp").exists());
        assert!(f
            .layout
            .converted()
            .join("BED1-1000-_-2024-01-01.hdf5")
            .exists());
        assert!(layout::list_files(f.layout.scratch()).unwrap().is_empty());
        assert_eq!(*engine.offsets.lock().unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn test_success_deletes_source_when_configured() {
        let f = fixture("[pipeline]\ndelete_source_on_success = true\n");
        let engine = Arc::new(FakeEngine::new(&[], 3));
        let file = matched(&f, "BED1-1000.stp", 0);

        let tally = dispatch(context(&f, engine), vec![file]).await;

        assert_eq!(tally.succeeded, 1);
        assert!(!f.input.join("BED1-1000.stp").exists());
        assert_eq!(layout::list_files(&f.layout.converted()).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failures_are_quarantined_and_isolated() {
        let f = fixture("[pipeline]\njob_timeout_secs = 1\n");
        let engine = Arc::new(FakeEngine::new(
            &[
                ("SLOW-1", Behaviour::Hang),
                ("BAD-2", Behaviour::FailEncode),
                ("EMPTY-3", Behaviour::NoOutput),
            ],
            1,
        ));
        let files = vec![
            matched(&f, "SLOW-1.stp", 0),
            matched(&f, "BAD-2.stp", 0),
            matched(&f, "EMPTY-3.stp", 0),
            matched(&f, "GOOD-4.stp", 0),
        ];

        let tally = dispatch(context(&f, engine), files).await;

        assert_eq!(
            (tally.succeeded, tally.timed_out, tally.errored, tally.done()),
            (1, 1, 2, 4)
        );
        assert!(f
            .layout
            .quarantine(Quarantine::TimedOut)
            .join("SLOW-1.stp")
            .exists());
        let errored = f.layout.quarantine(Quarantine::ErroredOut);
        assert!(errored.join("BAD-2.stp").exists());
        assert!(errored.join("EMPTY-3.stp").exists());
        assert!(f.input.join("GOOD-4.stp").exists());
        assert!(!f.input.join("SLOW-1.stp").exists());
        // Cleanup ran for every outcome
        assert!(layout::list_files(f.layout.scratch()).unwrap().is_empty());
        let staged = layout::list_files(&f.layout.converted()).unwrap();
        assert_eq!(staged.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_bound() {
        let f = fixture("[pipeline]\nworkers = 2\n");
        let engine = Arc::new(FakeEngine::new(&[], 1));
        let files = (0..6)
            .map(|i| matched(&f, &format!("BED{}-{}.stp", i, i), 0))
            .collect();

        let tally = dispatch(context(&f, engine.clone()), files).await;

        assert_eq!(tally.succeeded, 6);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_prefix_sibling_jobs_do_not_collide() {
        let f = fixture("");
        let engine = Arc::new(FakeEngine::new(&[("BED1-100", Behaviour::FailEncode)], 1));
        let files = vec![matched(&f, "BED1-100.stp", 0), matched(&f, "BED1-1000.stp", 0)];

        let tally = dispatch(context(&f, engine), files).await;

        assert_eq!((tally.succeeded, tally.errored), (1, 1));
        assert!(f
            .layout
            .converted()
            .join("BED1-1000-_-2024-01-01.hdf5")
            .exists());
    }

    #[tokio::test]
    async fn test_dotted_source_name_succeeds() {
        let f = fixture("[pipeline]\ndelete_source_on_success = true\n");
        let engine = Arc::new(FakeEngine::new(&[], 1));
        let file = matched(&f, "BED1-1000.v2.stp", 0);

        let tally = dispatch(context(&f, engine), vec![file]).await;

        assert_eq!(tally.succeeded, 1);
        assert!(f
            .layout
            .converted()
            .join("BED1-1000.v2-_-2024-01-01.hdf5")
            .exists());
    }

    #[tokio::test]
    async fn test_output_without_bed_and_seconds_is_errored() {
        let f = fixture("[pipeline]\ndelete_source_on_success = true\n");
        let engine = Arc::new(FakeEngine::new(&[], 1));
        let file = matched(&f, "notes.stp", 0);

        let tally = dispatch(context(&f, engine), vec![file]).await;

        assert_eq!((tally.succeeded, tally.errored), (0, 1));
        assert!(f
            .layout
            .quarantine(Quarantine::ErroredOut)
            .join("notes.stp")
            .exists());
        assert!(layout::list_files(&f.layout.converted()).unwrap().is_empty());
        assert!(layout::list_files(f.layout.scratch()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_staging_leaves_nothing_staged() {
        let f = fixture("");
        let engine = Arc::new(FakeEngine::new(&[], 2));
        let file = matched(&f, "BED1-1000.stp", 0);
        // Second day's output cannot be moved onto a directory
        std::fs::create_dir_all(f.layout.converted().join("BED1-1000-_-2024-01-02.hdf5")).unwrap();

        let tally = dispatch(context(&f, engine), vec![file]).await;

        assert_eq!((tally.succeeded, tally.errored), (0, 1));
        assert!(!f
            .layout
            .converted()
            .join("BED1-1000-_-2024-01-01.hdf5")
            .exists());
        assert!(f
            .layout
            .quarantine(Quarantine::ErroredOut)
            .join("BED1-1000.stp")
            .exists());
        assert!(layout::list_files(f.layout.scratch()).unwrap().is_empty());
    }
}
