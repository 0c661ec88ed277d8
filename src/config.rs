use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Local, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::catalog::Endpoints;
use crate::domain::{BandSelection, Satellite, ZoomRange};
use crate::error::CatalogError;
use crate::geometry::{GeoBounds, Geometry};
use crate::store::TmsCache;
use crate::transfer::{Credential, TransferConfig};

pub const CONFIG_FILE: &str = "catalog-tms.json";

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub satellite: Option<String>,
    #[serde(default)]
    pub bands: Option<BandsEntry>,
    #[serde(default)]
    pub zoom: Option<ZoomEntry>,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub area: Option<AreaEntry>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub endpoints: Option<EndpointsEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_keys: BTreeMap<Satellite, String>,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub accept_invalid_certs: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BandsEntry {
    Shorthand(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ZoomEntry {
    Shorthand(String),
    Detailed { min: u8, max: u8 },
}

/// Search area: `"min_lon,min_lat,max_lon,max_lat"` or a GeoJSON polygon.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AreaEntry {
    Bbox(String),
    Geometry(Geometry),
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct EndpointsEntry {
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub landsat_host: Option<String>,
    #[serde(default)]
    pub sentinel_host: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub satellite: Satellite,
    pub bands: BandSelection,
    pub zoom: ZoomRange,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub area: Option<Geometry>,
    pub output_dir: Utf8PathBuf,
    pub endpoints: Endpoints,
    pub credential: Option<Credential>,
    pub transfer: TransferConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CatalogError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CatalogError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but a missing default file yields defaults.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        match Self::resolve(path) {
            Err(CatalogError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CatalogError> {
        Self::resolve_config_at(config, Local::now().date_naive())
    }

    pub fn resolve_config_at(
        config: Config,
        today: NaiveDate,
    ) -> Result<ResolvedConfig, CatalogError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let satellite = match config.satellite.as_deref() {
            Some(value) => value.parse()?,
            None => Satellite::Landsat8,
        };

        let bands = match config.bands {
            Some(BandsEntry::Shorthand(value)) => {
                BandSelection::for_satellite(satellite, value.split(','))?
            }
            Some(BandsEntry::List(values)) => BandSelection::for_satellite(satellite, values)?,
            None => satellite.vegetation_bands(),
        };

        let zoom = match config.zoom {
            Some(ZoomEntry::Shorthand(value)) => value.parse()?,
            Some(ZoomEntry::Detailed { min, max }) => ZoomRange::new(min, max)?,
            None => ZoomRange::default(),
        };

        let (default_from, default_to) = default_dates(today);
        let date_from = config.date_from.unwrap_or(default_from);
        let date_to = config.date_to.unwrap_or(default_to);
        if date_from > date_to {
            return Err(CatalogError::InvalidDate(format!(
                "date_from {date_from} is after date_to {date_to}"
            )));
        }

        let area = match config.area {
            Some(AreaEntry::Bbox(value)) => {
                Some(Geometry::from_bounds(&GeoBounds::parse_csv(&value)?))
            }
            Some(AreaEntry::Geometry(geometry)) => {
                geometry.bounds()?;
                Some(geometry)
            }
            None => None,
        };

        let output_dir = match config.output_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => TmsCache::default_root()?,
        };

        let defaults = Endpoints::default();
        let entry = config.endpoints.unwrap_or_default();
        let endpoints = Endpoints {
            search_url: entry.search_url.unwrap_or(defaults.search_url),
            landsat_host: entry.landsat_host.unwrap_or(defaults.landsat_host),
            sentinel_host: entry.sentinel_host.unwrap_or(defaults.sentinel_host),
            api_keys: config.api_keys,
        };

        let mut transfer = TransferConfig::default();
        if let Some(secs) = config.timeout_secs {
            transfer.timeout = Duration::from_secs(secs);
        }
        if let Some(accept) = config.accept_invalid_certs {
            transfer.accept_invalid_certs = accept;
        }

        Ok(ResolvedConfig {
            schema_version,
            satellite,
            bands,
            zoom,
            date_from,
            date_to,
            area,
            output_dir,
            endpoints,
            credential: config.credential,
            transfer,
        })
    }
}

/// Last month up to today.
pub fn default_dates(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let from = today.checked_sub_months(Months::new(1)).unwrap_or(today);
    (from, today)
}

/// Load/save collaborator for persisted settings.
pub trait SettingsStore {
    fn load(&self) -> Result<Config, CatalogError>;
    fn save(&self, config: &Config) -> Result<(), CatalogError>;
}

pub struct JsonSettingsStore {
    path: Utf8PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<Config, CatalogError> {
        if !self.path.as_std_path().exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|_| CatalogError::ConfigRead(self.path.clone().into_std_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| CatalogError::ConfigParse(err.to_string()))
    }

    fn save(&self, config: &Config) -> Result<(), CatalogError> {
        let mut content = serde_json::to_vec_pretty(config)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;
        content.push(b'\n');
        TmsCache::write_bytes_atomic(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_satellite() {
        let config = Config {
            satellite: Some("sentinel-2".to_string()),
            output_dir: Some("/tmp/tms".to_string()),
            ..Config::default()
        };
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let resolved = ConfigLoader::resolve_config_at(config, today).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.bands.to_string(), "B11,B8A,B04");
        assert_eq!(resolved.zoom, ZoomRange { min: 8, max: 12 });
        assert_eq!(resolved.date_from, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(resolved.date_to, today);
    }
}
