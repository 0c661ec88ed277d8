use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CatalogError;
use crate::geometry::{Geometry, MAX_ZOOM, TileKey};
use crate::metadata;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
pub enum Satellite {
    #[serde(rename = "landsat-8")]
    #[value(name = "landsat-8")]
    Landsat8,
    #[serde(rename = "sentinel-2")]
    #[value(name = "sentinel-2")]
    Sentinel2,
}

impl Satellite {
    pub const ALL: [Satellite; 2] = [Satellite::Landsat8, Satellite::Sentinel2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Satellite::Landsat8 => "landsat-8",
            Satellite::Sentinel2 => "sentinel-2",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Satellite::Landsat8 => "Landsat 8",
            Satellite::Sentinel2 => "Sentinel 2",
        }
    }

    /// Provider family of a catalog record; every non-Landsat name
    /// (e.g. `Sentinel-2A`) belongs to the Sentinel tiler.
    pub fn from_metadata_name(name: &str) -> Self {
        if name == Satellite::Landsat8.as_str() {
            Satellite::Landsat8
        } else {
            Satellite::Sentinel2
        }
    }

    /// Metadata key holding the identifier the tiler expects.
    pub fn tile_id_key(&self) -> &'static str {
        match self {
            Satellite::Landsat8 => "product_id",
            Satellite::Sentinel2 => "scene_id",
        }
    }

    pub fn bands(&self) -> Vec<String> {
        match self {
            Satellite::Landsat8 => (1..=7)
                .chain(std::iter::once(9))
                .map(|n| format!("B{n}"))
                .collect(),
            Satellite::Sentinel2 => (2..=8)
                .map(|n| format!("B{n:02}"))
                .chain(["B8A", "B11", "B12"].into_iter().map(String::from))
                .collect(),
        }
    }

    pub fn vegetation_bands(&self) -> BandSelection {
        let codes: &[&str] = match self {
            Satellite::Landsat8 => &["B6", "B5", "B4"],
            Satellite::Sentinel2 => &["B11", "B8A", "B04"],
        };
        BandSelection(codes.iter().map(|code| code.to_string()).collect())
    }

    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|satellite| satellite.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Satellite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Satellite {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|satellite| satellite.as_str() == value.trim())
            .ok_or_else(|| CatalogError::InvalidSatellite {
                value: value.to_string(),
                supported: Self::supported_list(),
            })
    }
}

fn band_regex() -> &'static Regex {
    static BAND: OnceLock<Regex> = OnceLock::new();
    BAND.get_or_init(|| Regex::new(r"^B[0-9]{1,2}A?$").expect("band pattern is valid"))
}

/// Ordered red, green, blue band codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandSelection(Vec<String>);

impl BandSelection {
    pub fn new<I, S>(codes: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes = codes
            .into_iter()
            .map(|code| code.as_ref().trim().to_uppercase())
            .collect::<Vec<_>>();
        if codes.is_empty() {
            return Err(CatalogError::InvalidBand("no bands selected".to_string()));
        }
        if let Some(bad) = codes.iter().find(|code| !band_regex().is_match(code)) {
            return Err(CatalogError::InvalidBand(bad.clone()));
        }
        Ok(Self(codes))
    }

    /// Validates every code against the satellite's band catalogue.
    pub fn for_satellite<I, S>(satellite: Satellite, codes: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let selection = Self::new(codes)?;
        let known = satellite.bands();
        if let Some(bad) = selection.0.iter().find(|code| !known.contains(code)) {
            return Err(CatalogError::InvalidBand(format!("{bad} (not a {satellite} band)")));
        }
        Ok(selection)
    }

    pub fn codes(&self) -> &[String] {
        &self.0
    }

    /// `rgb` query value: Landsat takes bare band numbers, Sentinel the full codes.
    pub fn rgb_param(&self, family: Satellite) -> String {
        match family {
            Satellite::Landsat8 => self
                .0
                .iter()
                .map(|code| code.trim_start_matches('B'))
                .collect::<Vec<_>>()
                .join(","),
            Satellite::Sentinel2 => self.0.join(","),
        }
    }
}

impl fmt::Display for BandSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

impl FromStr for BandSelection {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value.split(','))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomRange {
    pub min: u8,
    pub max: u8,
}

impl ZoomRange {
    pub fn new(min: u8, max: u8) -> Result<Self, CatalogError> {
        if min > max {
            return Err(CatalogError::InvalidZoomRange(format!("{min} > {max}")));
        }
        if max > MAX_ZOOM {
            return Err(CatalogError::InvalidZoomRange(format!(
                "{max} exceeds {MAX_ZOOM}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn levels(&self) -> impl Iterator<Item = u8> {
        self.min..=self.max
    }
}

impl Default for ZoomRange {
    fn default() -> Self {
        Self { min: 8, max: 12 }
    }
}

impl fmt::Display for ZoomRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for ZoomRange {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u8>()
                .map_err(|_| CatalogError::InvalidZoomRange(value.to_string()))
        };
        match value.split_once('-') {
            Some((min, max)) => Self::new(parse(min)?, parse(max)?),
            None => {
                let level = parse(value)?;
                Self::new(level, level)
            }
        }
    }
}

/// Tile availability of a scene; replaced as a whole on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmsStatus {
    pub has_checked: bool,
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub minimum_tile: TileKey,
}

impl TmsStatus {
    pub fn unchecked(minimum_tile: TileKey) -> Self {
        Self {
            has_checked: false,
            is_available: true,
            message: None,
            minimum_tile,
        }
    }

    pub fn checked(&self, is_available: bool, message: Option<String>) -> Self {
        Self {
            has_checked: true,
            is_available,
            message,
            minimum_tile: self.minimum_tile,
        }
    }
}

pub const TMS_KEY: &str = "TMS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub acquired: String,
    pub thumbnail: String,
    pub geometry: Geometry,
    pub metadata: Map<String, Value>,
    pub tms: TmsStatus,
}

impl Scene {
    /// Builds a scene from one entry of the catalog `results` array.
    ///
    /// `thumbnail` and `data_geometry` move out of the metadata into their own
    /// fields; the minimum covering tile is taken at the probe zoom.
    pub fn from_catalog_item(item: Value) -> Result<Self, CatalogError> {
        let Value::Object(mut metadata) = item else {
            return Err(CatalogError::CatalogResponse(
                "scene entry is not an object".to_string(),
            ));
        };
        let id = required_text(&metadata, "scene_id")?;
        let acquired = required_text(&metadata, "date")?;
        let thumbnail = metadata
            .remove("thumbnail")
            .map(|value| match value {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or_default();
        let geometry = metadata
            .remove("data_geometry")
            .ok_or_else(|| {
                CatalogError::CatalogResponse(format!("scene {id} has no data_geometry"))
            })
            .and_then(Geometry::from_value)?;
        metadata.remove(TMS_KEY);

        let (lat, lon) = geometry.bounds()?.northwest();
        let minimum_tile = TileKey::minimum(lat, lon)?;

        Ok(Self {
            id,
            acquired,
            thumbnail,
            geometry,
            metadata,
            tms: TmsStatus::unchecked(minimum_tile),
        })
    }

    pub fn satellite_name(&self) -> Option<&str> {
        self.metadata.get("satellite_name").and_then(Value::as_str)
    }

    pub fn with_tms(self, tms: TmsStatus) -> Self {
        Self { tms, ..self }
    }

    /// Metadata as published to consumers, with the TMS status embedded.
    pub fn metadata_document(&self) -> Value {
        let mut document = self.metadata.clone();
        document.insert(
            TMS_KEY.to_string(),
            serde_json::to_value(&self.tms).unwrap_or(Value::Null),
        );
        Value::Object(document)
    }

    pub fn meta_json(&self) -> String {
        self.metadata_document().to_string()
    }

    pub fn meta_html(&self) -> String {
        metadata::to_html(&self.metadata_document())
    }

    pub fn acquired_date(&self) -> &str {
        self.acquired.split('T').next().unwrap_or(&self.acquired)
    }
}

fn required_text(metadata: &Map<String, Value>, key: &str) -> Result<String, CatalogError> {
    match metadata.get(key) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Null) | None => Err(CatalogError::CatalogResponse(format!(
            "scene entry is missing '{key}'"
        ))),
        Some(other) => Ok(other.to_string()),
    }
}
