//! GeoJSON footprints, Web-Mercator reprojection and slippy-map tiling.
//!
//! Tiles follow the XYZ convention used by the remote tile renderer:
//! - `x` is the column, 0 at 180°W, increasing eastward
//! - `y` is the row, 0 at ~85.05°N, increasing southward
//! - both lie in `0..2^z`

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Half the Web-Mercator world width in metres (EPSG:3857).
pub const MERCATOR_ORIGIN: f64 = 20_037_508.342_789_244;

/// Latitude limit of the Web-Mercator projection, `atan(sinh(π))`.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

pub const TILE_SIZE: u32 = 256;

pub const MAX_ZOOM: u8 = 22;

/// Zoom used for the minimum covering tile stored with every scene.
pub const PROBE_ZOOM: u8 = 8;

/// Polygonal footprint in WGS84 longitude/latitude order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Vec<Vec<f64>>>),
    MultiPolygon(Vec<Vec<Vec<Vec<f64>>>>),
}

impl Geometry {
    pub fn from_value(value: serde_json::Value) -> Result<Self, CatalogError> {
        serde_json::from_value(value).map_err(|err| CatalogError::InvalidGeometry(err.to_string()))
    }

    /// Closed rectangle covering `bounds`, used as the search area.
    pub fn from_bounds(bounds: &GeoBounds) -> Self {
        let ring = vec![
            vec![bounds.min_lon, bounds.min_lat],
            vec![bounds.max_lon, bounds.min_lat],
            vec![bounds.max_lon, bounds.max_lat],
            vec![bounds.min_lon, bounds.max_lat],
            vec![bounds.min_lon, bounds.min_lat],
        ];
        Geometry::Polygon(vec![ring])
    }

    pub fn to_geojson(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn positions(&self) -> Box<dyn Iterator<Item = &Vec<f64>> + '_> {
        match self {
            Geometry::Polygon(rings) => Box::new(rings.iter().flatten()),
            Geometry::MultiPolygon(polygons) => {
                Box::new(polygons.iter().flatten().flatten())
            }
        }
    }

    pub fn bounds(&self) -> Result<GeoBounds, CatalogError> {
        let mut bounds: Option<GeoBounds> = None;
        for position in self.positions() {
            if position.len() < 2 {
                return Err(CatalogError::InvalidGeometry(format!(
                    "position needs longitude and latitude, got {position:?}"
                )));
            }
            let (lon, lat) = (position[0], position[1]);
            if !lon.is_finite() || !lat.is_finite() {
                return Err(CatalogError::InvalidGeometry(
                    "non-finite coordinate".to_string(),
                ));
            }
            bounds = Some(match bounds {
                None => GeoBounds::new(lon, lat, lon, lat),
                Some(current) => current.extend(lon, lat),
            });
        }
        bounds.ok_or_else(|| CatalogError::InvalidGeometry("geometry has no positions".to_string()))
    }

    /// Derived footprint in EPSG:3857 metres; `self` is left untouched.
    pub fn to_web_mercator(&self) -> Result<MercatorBounds, CatalogError> {
        let bounds = self.bounds()?;
        let (min_x, min_y) = lon_lat_to_mercator(bounds.min_lon, bounds.min_lat);
        let (max_x, max_y) = lon_lat_to_mercator(bounds.max_lon, bounds.max_lat);
        Ok(MercatorBounds {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl GeoBounds {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    fn extend(self, lon: f64, lat: f64) -> Self {
        Self {
            min_lon: self.min_lon.min(lon),
            min_lat: self.min_lat.min(lat),
            max_lon: self.max_lon.max(lon),
            max_lat: self.max_lat.max(lat),
        }
    }

    /// Returns (lat, lon) of the north-west corner.
    pub fn northwest(&self) -> (f64, f64) {
        (self.max_lat, self.min_lon)
    }

    /// Parses `min_lon,min_lat,max_lon,max_lat`.
    pub fn parse_csv(value: &str) -> Result<Self, CatalogError> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CatalogError::InvalidGeometry(format!("invalid bbox: {value}")))?;
        if parts.len() != 4 {
            return Err(CatalogError::InvalidGeometry(format!(
                "bbox needs 4 numbers: {value}"
            )));
        }
        let bounds = Self::new(parts[0], parts[1], parts[2], parts[3]);
        if bounds.min_lon > bounds.max_lon || bounds.min_lat > bounds.max_lat {
            return Err(CatalogError::InvalidGeometry(format!(
                "bbox minimum exceeds maximum: {value}"
            )));
        }
        Ok(bounds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MercatorBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

pub fn lon_lat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = lon.clamp(-180.0, 180.0) * MERCATOR_ORIGIN / 180.0;
    let y = ((90.0 + lat) * PI / 360.0).tan().ln() * MERCATOR_ORIGIN / PI;
    (x, y)
}

/// Ground resolution of one pixel at zoom `z`, in metres.
pub fn units_per_pixel(z: u8) -> f64 {
    2.0 * MERCATOR_ORIGIN / (TILE_SIZE as f64 * (1u64 << z) as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileKey {
    /// Slippy-map tile containing (lat, lon):
    /// - x = floor((lon + 180) / 360 * 2^z)
    /// - y = floor((1 - ln(tan(lat) + sec(lat)) / π) / 2 * 2^z)
    pub fn from_lat_lon(lat: f64, lon: f64, z: u8) -> Result<Self, CatalogError> {
        if z > MAX_ZOOM {
            return Err(CatalogError::InvalidZoomRange(format!(
                "zoom {z} exceeds {MAX_ZOOM}"
            )));
        }
        let n = (1u64 << z) as f64;
        let lat_rad = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        let x = ((lon + 180.0) / 360.0 * n).floor();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();
        Ok(Self {
            x: clamp_index(x, z),
            y: clamp_index(y, z),
            z,
        })
    }

    /// Tile used to check whether the provider serves a scene whose
    /// northwest corner is (lat, lon). A corner exactly at the origin maps
    /// to the world tile.
    pub fn minimum(lat: f64, lon: f64) -> Result<Self, CatalogError> {
        if lat == 0.0 && lon == 0.0 {
            return Ok(Self { x: 0, y: 0, z: 0 });
        }
        Self::from_lat_lon(lat, lon, PROBE_ZOOM)
    }

    /// Replaces `{z}`, `{x}` and `{y}` in a tile URL template.
    pub fn fill(&self, template: &str) -> String {
        template
            .replace("{z}", &self.z.to_string())
            .replace("{x}", &self.x.to_string())
            .replace("{y}", &self.y.to_string())
    }
}

fn clamp_index(value: f64, z: u8) -> u32 {
    let max = ((1u64 << z) - 1) as f64;
    value.clamp(0.0, max) as u32
}

/// Inclusive block of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub z: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn covering(extent: &MercatorBounds, z: u8) -> Self {
        let n = (1u64 << z) as f64;
        let span = 2.0 * MERCATOR_ORIGIN / n;
        let column = |x: f64| clamp_index(((x + MERCATOR_ORIGIN) / span).floor(), z);
        let row = |y: f64| clamp_index(((MERCATOR_ORIGIN - y) / span).floor(), z);
        Self {
            z,
            min_x: column(extent.min_x),
            max_x: column(extent.max_x),
            min_y: row(extent.max_y),
            max_y: row(extent.min_y),
        }
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.max_x - self.min_x + 1) as usize * (self.max_y - self.min_y + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y
    }

    pub fn iter(&self) -> impl Iterator<Item = TileKey> + '_ {
        (self.min_x..=self.max_x).flat_map(move |x| {
            (self.min_y..=self.max_y).map(move |y| TileKey { x, y, z: self.z })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_key_at_origin_zoom_zero() {
        let key = TileKey::from_lat_lon(0.0, 0.0, 0).unwrap();
        assert_eq!(key, TileKey { x: 0, y: 0, z: 0 });
    }

    #[test]
    fn tile_key_clamps_antimeridian() {
        let key = TileKey::from_lat_lon(0.0, 180.0, 3).unwrap();
        assert_eq!(key.x, 7);
    }

    #[test]
    fn mercator_equator_is_zero() {
        let (x, y) = lon_lat_to_mercator(0.0, 0.0);
        assert!(x.abs() < 1e-6);
        assert!(y.abs() < 1e-6);
    }
}
