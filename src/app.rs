use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::catalog::{CatalogClient, HostsReport, SceneQuery};
use crate::domain::{BandSelection, Scene, ZoomRange};
use crate::error::CatalogError;
use crate::geometry::Geometry;
use crate::pipeline::{RunState, ScanMode, ScanOutcome, ScanPipeline, ScanSummary};
use crate::store::{ClearReport, SceneCatalog, TmsCache};
use crate::transfer::CancelToken;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);

    fn progress(&self, processed: usize, total: usize) {
        self.event(ProgressEvent {
            message: format!("phase=Scan; {processed}/{total}"),
            elapsed: None,
        });
    }

    fn completed(&self, summary: &ScanSummary) {
        self.event(ProgressEvent {
            message: format!(
                "phase=Done; processed={} errors={} canceled={}",
                summary.processed, summary.errors, summary.canceled
            ),
            elapsed: Some(Duration::from_millis(summary.elapsed_ms)),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub root: String,
    pub size_bytes: u64,
    pub scenes: Vec<String>,
}

pub struct App<C: CatalogClient> {
    cache: TmsCache,
    pipeline: ScanPipeline<C>,
    search_cancel: CancelToken,
}

impl<C: CatalogClient> App<C> {
    pub fn new(cache: TmsCache, client: C) -> Self {
        Self {
            cache,
            pipeline: ScanPipeline::new(client),
            search_cancel: CancelToken::new(),
        }
    }

    pub fn cache(&self) -> &TmsCache {
        &self.cache
    }

    pub fn client(&self) -> &C {
        self.pipeline.client()
    }

    pub fn state(&self) -> RunState {
        self.pipeline.state()
    }

    /// Queries the catalog; a result truncated by the provider limit is refused.
    pub fn run_search(
        &self,
        satellite: &str,
        geometry: Geometry,
        date_from: NaiveDate,
        date_to: NaiveDate,
        sink: &dyn ProgressSink,
    ) -> Result<SceneCatalog, CatalogError> {
        let query = SceneQuery::new(satellite, geometry, date_from, date_to)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Search; {} {}..{}",
                query.satellite, query.date_from, query.date_to
            ),
            elapsed: None,
        });

        self.search_cancel.reset();
        let search = self.client().search_scenes(&query, &self.search_cancel)?;
        if search.exceeds_limit() {
            warn!(
                returned = search.returned,
                found = search.total_found,
                "catalog search exceeded the provider limit"
            );
            return Err(CatalogError::ExceededLimit {
                returned: search.returned,
                found: search.total_found,
            });
        }

        sink.event(ProgressEvent {
            message: format!("phase=Search; found {} scenes", search.scenes.len()),
            elapsed: None,
        });
        Ok(SceneCatalog {
            satellite: query.satellite,
            date_from: query.date_from,
            date_to: query.date_to,
            scenes: search.scenes,
        })
    }

    pub fn run_materialize(
        &self,
        scenes: Vec<Scene>,
        bands: BandSelection,
        zoom: ZoomRange,
        sink: &dyn ProgressSink,
    ) -> Result<ScanOutcome, CatalogError> {
        let mode = ScanMode::Materialize {
            cache: self.cache.clone(),
            bands,
            zoom,
        };
        self.pipeline.run(scenes, &mode, sink)
    }

    pub fn run_verify(
        &self,
        scenes: Vec<Scene>,
        bands: BandSelection,
        sink: &dyn ProgressSink,
    ) -> Result<ScanOutcome, CatalogError> {
        self.pipeline.run(scenes, &ScanMode::Verify { bands }, sink)
    }

    /// Cancels the running search or scan, whichever is active.
    pub fn cancel(&self) {
        self.search_cancel.cancel();
        self.pipeline.cancel();
    }

    pub fn check_hosts(&self, sink: &dyn ProgressSink) -> Result<HostsReport, CatalogError> {
        sink.event(ProgressEvent {
            message: "phase=Hosts; probing tile hosts".to_string(),
            elapsed: None,
        });
        self.search_cancel.reset();
        self.client().check_hosts_live(&self.search_cancel)
    }

    /// Scenes named in `selection`, in selection order; all scenes when it is empty.
    pub fn select_items(
        scenes: Vec<Scene>,
        selection: &[String],
    ) -> Result<Vec<Scene>, CatalogError> {
        if selection.is_empty() {
            return Ok(scenes);
        }
        selection
            .iter()
            .map(|id| {
                scenes
                    .iter()
                    .find(|scene| &scene.id == id)
                    .cloned()
                    .ok_or_else(|| CatalogError::SceneNotFound(id.clone()))
            })
            .collect()
    }

    pub fn cache_report(&self) -> Result<CacheReport, CatalogError> {
        Ok(CacheReport {
            root: self.cache.root().to_string(),
            size_bytes: self.cache.size_bytes()?,
            scenes: self.cache.scene_ids()?,
        })
    }

    pub fn clear_cache(&self) -> Result<ClearReport, CatalogError> {
        if self.pipeline.state() == RunState::Running {
            return Err(CatalogError::RunInProgress);
        }
        self.cache.clear()
    }
}
