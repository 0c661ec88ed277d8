//! Cancellable batch run over a list of scenes.
//!
//! A run walks its items strictly in order. The cancel flag is checked before
//! each item's network work and inside every transfer; once it is observed no
//! further item is started. Completion is reported to the sink exactly once per
//! run that leaves `Idle`.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::catalog::CatalogClient;
use crate::domain::{BandSelection, Scene, ZoomRange};
use crate::error::CatalogError;
use crate::store::TmsCache;
use crate::tiles::TileCacheWriter;
use crate::transfer::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ScanMode {
    Materialize {
        cache: TmsCache,
        bands: BandSelection,
        zoom: ZoomRange,
    },
    Verify {
        bands: BandSelection,
    },
}

impl ScanMode {
    pub fn name(&self) -> &'static str {
        match self {
            ScanMode::Materialize { .. } => "materialize",
            ScanMode::Verify { .. } => "verify",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub mode: String,
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub canceled: bool,
    /// Verify only: scenes already checked by an earlier run.
    pub skipped: usize,
    /// Scenes whose tiles the provider does not serve.
    pub unavailable: usize,
    pub tiles_written: usize,
    pub tile_errors: usize,
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub summary: ScanSummary,
    pub scenes: Vec<Scene>,
}

enum ItemOutcome {
    Done(Scene),
    Failed(Scene, CatalogError),
    Canceled(Scene),
}

pub struct ScanPipeline<C: CatalogClient> {
    client: C,
    cancel: CancelToken,
    state: Mutex<RunState>,
}

impl<C: CatalogClient> ScanPipeline<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            cancel: CancelToken::new(),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn state(&self) -> RunState {
        *self.lock_state()
    }

    /// Requests cancellation of the active run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.lock_state() = state;
    }

    pub fn run(
        &self,
        items: Vec<Scene>,
        mode: &ScanMode,
        sink: &dyn ProgressSink,
    ) -> Result<ScanOutcome, CatalogError> {
        if items.is_empty() {
            sink.event(ProgressEvent {
                message: format!("phase={}; nothing to process", mode.name()),
                elapsed: None,
            });
            return Err(CatalogError::NothingToProcess);
        }

        {
            let mut state = self.lock_state();
            if *state == RunState::Running {
                return Err(CatalogError::RunInProgress);
            }
            *state = RunState::Running;
            self.cancel.reset();
        }

        if let ScanMode::Materialize { cache, .. } = mode {
            if let Err(err) = cache.ensure_root() {
                self.set_state(RunState::Failed);
                return Err(err);
            }
        }

        let started = Instant::now();
        let total = items.len();
        let mut summary = ScanSummary {
            mode: mode.name().to_string(),
            total,
            ..ScanSummary::default()
        };
        info!(mode = mode.name(), total, "scan started");

        let mut scenes = Vec::with_capacity(total);
        let mut pending = items.into_iter();
        for scene in pending.by_ref() {
            if self.cancel.is_canceled() {
                summary.canceled = true;
                scenes.push(scene);
                break;
            }

            match self.process(scene, mode, &mut summary) {
                ItemOutcome::Done(scene) => {
                    summary.processed += 1;
                    scenes.push(scene);
                }
                ItemOutcome::Failed(scene, err) => {
                    warn!(scene = %scene.id, error = %err, "scene failed");
                    summary.processed += 1;
                    summary.errors += 1;
                    summary.last_error = Some(err.to_string());
                    scenes.push(scene);
                }
                ItemOutcome::Canceled(scene) => {
                    summary.canceled = true;
                    scenes.push(scene);
                    break;
                }
            }
            sink.progress(summary.processed, total);
        }
        scenes.extend(pending);

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        self.set_state(if summary.canceled {
            RunState::Canceled
        } else {
            RunState::Completed
        });
        info!(
            mode = mode.name(),
            processed = summary.processed,
            errors = summary.errors,
            canceled = summary.canceled,
            "scan finished"
        );
        sink.completed(&summary);

        Ok(ScanOutcome { summary, scenes })
    }

    fn process(&self, scene: Scene, mode: &ScanMode, summary: &mut ScanSummary) -> ItemOutcome {
        match mode {
            ScanMode::Verify { bands } => {
                if scene.tms.has_checked {
                    summary.skipped += 1;
                    if !scene.tms.is_available {
                        summary.unavailable += 1;
                    }
                    return ItemOutcome::Done(scene);
                }
                match self.client.probe_tile_exists(&scene, bands, &self.cancel) {
                    Ok(probe) => {
                        if !probe.available {
                            summary.unavailable += 1;
                        }
                        let tms = scene.tms.checked(probe.available, probe.message);
                        ItemOutcome::Done(scene.with_tms(tms))
                    }
                    Err(CatalogError::Canceled) => ItemOutcome::Canceled(scene),
                    Err(err) => ItemOutcome::Failed(scene, err),
                }
            }
            ScanMode::Materialize { cache, bands, zoom } => {
                let writer = TileCacheWriter::new(&self.client, cache);
                match writer.materialize(&scene, bands, *zoom, &self.cancel) {
                    Ok(report) => {
                        summary.tiles_written += report.tiles_written;
                        summary.tile_errors += report.tile_errors;
                        let available = report.tiles_written > 0;
                        if !available {
                            summary.unavailable += 1;
                        }
                        let tms = scene.tms.checked(available, report.last_error.clone());
                        let scene = scene.with_tms(tms);
                        match report.last_error {
                            Some(message) if !report.is_complete() => ItemOutcome::Failed(
                                scene,
                                CatalogError::TileUnavailable(format!(
                                    "{} of {} tiles failed: {message}",
                                    report.tile_errors, report.tiles_requested
                                )),
                            ),
                            _ => ItemOutcome::Done(scene),
                        }
                    }
                    Err(CatalogError::Canceled) => ItemOutcome::Canceled(scene),
                    Err(err) => ItemOutcome::Failed(scene, err),
                }
            }
        }
    }
}
