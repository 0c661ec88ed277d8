use std::collections::BTreeMap;
use std::io::{self, Write};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{BandSelection, Satellite, Scene};
use crate::error::CatalogError;
use crate::geometry::Geometry;
use crate::transfer::{
    CancelToken, Credential, FailureKind, HttpTransfer, TransferConfig, TransferEvent,
    TransferRequest, TransferResult,
};

pub const SEARCH_LIMIT: usize = 2000;
pub const DEFAULT_SEARCH_URL: &str = "https://api.developmentseed.org/satellites/";
pub const DEFAULT_LANDSAT_HOST: &str =
    "https://{key}.execute-api.us-west-2.amazonaws.com/production/landsat";
pub const DEFAULT_SENTINEL_HOST: &str =
    "https://{key}.execute-api.eu-central-1.amazonaws.com/production/sentinel";

const PREVIEW_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SceneQuery {
    pub satellite: Satellite,
    pub geometry: Geometry,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

impl SceneQuery {
    pub fn new(
        satellite: &str,
        geometry: Geometry,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Self, CatalogError> {
        let satellite = satellite.parse::<Satellite>()?;
        if date_from > date_to {
            return Err(CatalogError::InvalidDate(format!(
                "date_from {date_from} is after date_to {date_to}"
            )));
        }
        Ok(Self {
            satellite,
            geometry,
            date_from,
            date_to,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneSearch {
    pub scenes: Vec<Scene>,
    pub returned: usize,
    pub total_found: u64,
}

impl SceneSearch {
    pub fn exceeds_limit(&self) -> bool {
        self.total_found > self.returned as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileProbe {
    pub available: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub satellite: Satellite,
    pub url: String,
    pub live: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostsReport {
    pub hosts: Vec<HostStatus>,
}

impl HostsReport {
    pub fn all_live(&self) -> bool {
        self.hosts.iter().all(|host| host.live)
    }

    pub fn dead(&self) -> Vec<Satellite> {
        self.hosts
            .iter()
            .filter(|host| !host.live)
            .map(|host| host.satellite)
            .collect()
    }

    /// `"{title}: landsat-8,sentinel-2"` listing the dead hosts, if any.
    pub fn failure_message(&self, title: &str) -> Option<String> {
        let dead = self.dead();
        if dead.is_empty() {
            return None;
        }
        let names = dead
            .iter()
            .map(|satellite| satellite.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Some(format!("{title}: {names}"))
    }
}

/// Provider capabilities consumed by the scan pipeline and the app facade.
pub trait CatalogClient: Send + Sync {
    fn search_scenes(
        &self,
        query: &SceneQuery,
        cancel: &CancelToken,
    ) -> Result<SceneSearch, CatalogError>;

    /// Tile URL template with `{z}/{x}/{y}` slots still unfilled.
    fn tile_url(&self, scene: &Scene, bands: &BandSelection) -> Result<String, CatalogError>;

    fn probe_tile_exists(
        &self,
        scene: &Scene,
        bands: &BandSelection,
        cancel: &CancelToken,
    ) -> Result<TileProbe, CatalogError>;

    fn download_tile(
        &self,
        url: &str,
        writer: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<u64, CatalogError>;

    fn check_hosts_live(&self, cancel: &CancelToken) -> Result<HostsReport, CatalogError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub search_url: String,
    pub landsat_host: String,
    pub sentinel_host: String,
    #[serde(default)]
    pub api_keys: BTreeMap<Satellite, String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            landsat_host: DEFAULT_LANDSAT_HOST.to_string(),
            sentinel_host: DEFAULT_SENTINEL_HOST.to_string(),
            api_keys: BTreeMap::new(),
        }
    }
}

impl Endpoints {
    /// Tile host for a provider family with its API key filled in.
    pub fn host(&self, family: Satellite) -> String {
        let template = match family {
            Satellite::Landsat8 => &self.landsat_host,
            Satellite::Sentinel2 => &self.sentinel_host,
        };
        let key = self.api_keys.get(&family).map(String::as_str).unwrap_or_default();
        template.replace("{key}", key)
    }

    pub fn with_api_keys(&self, keys: &BTreeMap<Satellite, String>) -> Self {
        let mut endpoints = self.clone();
        for (satellite, key) in keys {
            endpoints.api_keys.insert(*satellite, key.trim().to_string());
        }
        endpoints
    }
}

/// Full search URL with every parameter percent-encoded.
pub fn search_url(base: &str, query: &SceneQuery) -> Result<String, CatalogError> {
    let mut url = Url::parse(base)
        .map_err(|err| CatalogError::CatalogResponse(format!("invalid search url {base}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("limit", &SEARCH_LIMIT.to_string())
        .append_pair("satellite_name", query.satellite.as_str())
        .append_pair("date_from", &query.date_from.format("%Y-%m-%d").to_string())
        .append_pair("date_to", &query.date_to.format("%Y-%m-%d").to_string())
        .append_pair("intersects", &query.geometry.to_geojson());
    Ok(url.to_string())
}

pub fn build_tile_url(
    endpoints: &Endpoints,
    metadata: &Map<String, Value>,
    bands: &BandSelection,
) -> Result<String, CatalogError> {
    let name = metadata
        .get("satellite_name")
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogError::CatalogResponse("scene has no satellite_name".to_string()))?;
    let family = Satellite::from_metadata_name(name);
    let id_key = family.tile_id_key();
    let id = metadata
        .get(id_key)
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogError::CatalogResponse(format!("scene has no {id_key}")))?;
    Ok(format!(
        "{}/tiles/{}/{{z}}/{{x}}/{{y}}.png?rgb={}&tile=256&pan=true",
        endpoints.host(family),
        id,
        bands.rgb_param(family)
    ))
}

/// Decodes a catalog search reply into scenes.
pub fn parse_search_response(
    content_type_json: bool,
    body: &[u8],
) -> Result<SceneSearch, CatalogError> {
    if !content_type_json {
        return Err(CatalogError::CatalogResponse(
            "search reply is not JSON".to_string(),
        ));
    }
    let mut document: Value = serde_json::from_slice(body)
        .map_err(|err| CatalogError::CatalogResponse(err.to_string()))?;
    let total_found = document
        .pointer("/meta/found")
        .and_then(Value::as_u64)
        .ok_or_else(|| CatalogError::CatalogResponse("missing meta.found".to_string()))?;
    let results = match document.get_mut("results").map(Value::take) {
        Some(Value::Array(results)) => results,
        _ => {
            return Err(CatalogError::CatalogResponse(
                "missing results array".to_string(),
            ));
        }
    };

    let returned = results.len();
    let mut scenes = Vec::with_capacity(returned);
    for item in results {
        match Scene::from_catalog_item(item) {
            Ok(scene) => scenes.push(scene),
            Err(err) => warn!(error = %err, "skipping catalog entry"),
        }
    }
    Ok(SceneSearch {
        scenes,
        returned,
        total_found,
    })
}

/// Message carried by a JSON error payload from a tile renderer.
pub fn provider_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body).trim().to_string();
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|value| {
            ["message", "errorMessage"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or(text)
}

pub struct HttpCatalogClient {
    transfer: HttpTransfer,
    endpoints: Endpoints,
    credential: Option<Credential>,
}

impl HttpCatalogClient {
    pub fn new(
        endpoints: Endpoints,
        config: &TransferConfig,
        credential: Option<Credential>,
    ) -> Result<Self, CatalogError> {
        let transfer = HttpTransfer::new(config)?;
        Ok(Self {
            transfer,
            endpoints,
            credential,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn request(&self, url: impl Into<String>) -> TransferRequest {
        TransferRequest::get(url).with_credential(self.credential.clone())
    }

    fn probe_hosts(
        &self,
        endpoints: &Endpoints,
        cancel: &CancelToken,
    ) -> Result<HostsReport, CatalogError> {
        let mut hosts = Vec::new();
        for satellite in Satellite::ALL {
            let url = endpoints.host(satellite);
            let outcome = self.transfer.exchange(self.request(&url), cancel, &mut |_| Ok(()));
            let status = match outcome {
                TransferResult::Success(_) => HostStatus {
                    satellite,
                    url,
                    live: true,
                    message: None,
                },
                TransferResult::Failure(failure) => match failure.kind {
                    FailureKind::Canceled => return Err(CatalogError::Canceled),
                    FailureKind::HostNotFound => HostStatus {
                        message: Some(format!("{}\nURL = {url}", failure.message)),
                        satellite,
                        url,
                        live: false,
                    },
                    _ => HostStatus {
                        satellite,
                        url,
                        live: true,
                        message: Some(failure.message),
                    },
                },
            };
            debug!(satellite = %status.satellite, live = status.live, "host probed");
            hosts.push(status);
        }
        Ok(HostsReport { hosts })
    }

    /// Adopts the keys only when every keyed host answers.
    pub fn apply_api_keys(
        &mut self,
        keys: &BTreeMap<Satellite, String>,
        cancel: &CancelToken,
    ) -> Result<HostsReport, CatalogError> {
        let candidate = self.endpoints.with_api_keys(keys);
        let report = self.probe_hosts(&candidate, cancel)?;
        if let Some(message) = report.failure_message("Invalid key(s)") {
            return Err(CatalogError::InvalidApiKeys(message));
        }
        info!("api keys accepted");
        self.endpoints = candidate;
        Ok(report)
    }
}

impl CatalogClient for HttpCatalogClient {
    fn search_scenes(
        &self,
        query: &SceneQuery,
        cancel: &CancelToken,
    ) -> Result<SceneSearch, CatalogError> {
        let url = search_url(&self.endpoints.search_url, query)?;
        info!(
            satellite = %query.satellite,
            from = %query.date_from,
            to = %query.date_to,
            "searching catalog"
        );
        let response = self
            .transfer
            .exchange(self.request(url), cancel, &mut |_| Ok(()))
            .into_result()
            .map_err(CatalogError::from_transfer)?;
        let search = parse_search_response(response.headers.is_json(), response.bytes())?;
        debug!(
            returned = search.returned,
            found = search.total_found,
            "catalog search finished"
        );
        Ok(search)
    }

    fn tile_url(&self, scene: &Scene, bands: &BandSelection) -> Result<String, CatalogError> {
        build_tile_url(&self.endpoints, &scene.metadata, bands)
    }

    fn probe_tile_exists(
        &self,
        scene: &Scene,
        bands: &BandSelection,
        cancel: &CancelToken,
    ) -> Result<TileProbe, CatalogError> {
        let url = scene.tms.minimum_tile.fill(&self.tile_url(scene, bands)?);
        match self.transfer.exchange(self.request(url), cancel, &mut |_| Ok(())) {
            TransferResult::Success(response) => {
                if response.headers.is_json() {
                    Ok(TileProbe {
                        available: false,
                        message: Some(provider_message(response.bytes())),
                    })
                } else {
                    Ok(TileProbe {
                        available: true,
                        message: None,
                    })
                }
            }
            TransferResult::Failure(failure) => match failure.kind {
                FailureKind::HttpStatus(_) | FailureKind::Unauthorized => Ok(TileProbe {
                    available: false,
                    message: Some(failure.message),
                }),
                _ => Err(CatalogError::from_transfer(failure)),
            },
        }
    }

    fn download_tile(
        &self,
        url: &str,
        writer: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<u64, CatalogError> {
        let mut preview = Vec::new();
        let mut sink = |event: TransferEvent| -> io::Result<()> {
            if let TransferEvent::Chunk(chunk) = event {
                if preview.len() < PREVIEW_LIMIT {
                    let take = (PREVIEW_LIMIT - preview.len()).min(chunk.len());
                    preview.extend_from_slice(&chunk[..take]);
                }
                writer.write_all(&chunk)?;
            }
            Ok(())
        };
        let response = self
            .transfer
            .exchange(self.request(url).streaming(), cancel, &mut sink)
            .into_result()
            .map_err(CatalogError::from_transfer)?;
        if response.headers.is_json() {
            return Err(CatalogError::TileUnavailable(provider_message(&preview)));
        }
        Ok(response.byte_count())
    }

    fn check_hosts_live(&self, cancel: &CancelToken) -> Result<HostsReport, CatalogError> {
        self.probe_hosts(&self.endpoints, cancel)
    }
}
