//! Materialization of one scene into the local TMS pyramid.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::domain::{BandSelection, Scene, ZoomRange};
use crate::error::CatalogError;
use crate::geometry::{MERCATOR_ORIGIN, MercatorBounds, TILE_SIZE, TileRange, units_per_pixel};
use crate::store::TmsCache;
use crate::transfer::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub scene_id: String,
    pub tiles_requested: usize,
    pub tiles_written: usize,
    pub tile_errors: usize,
    pub last_error: Option<String>,
}

impl MaterializeReport {
    pub fn is_complete(&self) -> bool {
        self.tile_errors == 0
    }
}

pub struct TileCacheWriter<'a, C: CatalogClient + ?Sized> {
    client: &'a C,
    cache: &'a TmsCache,
}

impl<'a, C: CatalogClient + ?Sized> TileCacheWriter<'a, C> {
    pub fn new(client: &'a C, cache: &'a TmsCache) -> Self {
        Self { client, cache }
    }

    /// Covering tile range per zoom level of the scene footprint.
    pub fn plan(scene: &Scene, zoom: ZoomRange) -> Result<Vec<TileRange>, CatalogError> {
        let extent = scene.geometry.to_web_mercator()?;
        Ok(zoom
            .levels()
            .map(|z| TileRange::covering(&extent, z))
            .collect())
    }

    /// Downloads every covering tile and writes the scene's XML documents.
    ///
    /// A failed tile is counted and the walk continues; cancellation aborts
    /// the scene and leaves already persisted tiles in place.
    pub fn materialize(
        &self,
        scene: &Scene,
        bands: &BandSelection,
        zoom: ZoomRange,
        cancel: &CancelToken,
    ) -> Result<MaterializeReport, CatalogError> {
        let template = self.client.tile_url(scene, bands)?;
        let ranges = Self::plan(scene, zoom)?;
        let mut report = MaterializeReport {
            scene_id: scene.id.clone(),
            tiles_requested: ranges.iter().map(TileRange::len).sum(),
            tiles_written: 0,
            tile_errors: 0,
            last_error: None,
        };
        info!(
            scene = %scene.id,
            zoom = %zoom,
            tiles = report.tiles_requested,
            "materializing scene"
        );

        for range in &ranges {
            for key in range.iter() {
                if cancel.is_canceled() {
                    return Err(CatalogError::Canceled);
                }
                let path = self.cache.tile_path(&scene.id, &key)?;
                let url = key.fill(&template);
                let mut temp = TmsCache::temp_for(&path)?;
                match self.client.download_tile(&url, temp.as_file_mut(), cancel) {
                    Ok(bytes) => {
                        TmsCache::persist(temp, &path)?;
                        report.tiles_written += 1;
                        debug!(tile = %path, bytes, "tile written");
                    }
                    Err(CatalogError::Canceled) => return Err(CatalogError::Canceled),
                    Err(err) => {
                        warn!(
                            scene = %scene.id,
                            z = key.z,
                            x = key.x,
                            y = key.y,
                            error = %err,
                            "tile failed"
                        );
                        report.tile_errors += 1;
                        report.last_error = Some(err.to_string());
                    }
                }
            }
        }

        let extent = scene.geometry.to_web_mercator()?;
        TmsCache::write_bytes_atomic(
            &self.cache.capabilities_path(&scene.id)?,
            tilemap_resource_xml(scene, bands, &extent, zoom).as_bytes(),
        )?;
        let scene_dir = self.cache.scene_dir(&scene.id)?;
        TmsCache::write_bytes_atomic(
            &self.cache.service_xml_path(&scene.id)?,
            gdal_wms_xml(scene_dir.as_str(), zoom).as_bytes(),
        )?;

        info!(
            scene = %scene.id,
            written = report.tiles_written,
            errors = report.tile_errors,
            "scene materialized"
        );
        Ok(report)
    }
}

/// TMS 1.0.0 capabilities document for one scene pyramid.
///
/// Tiles are addressed top-down (XYZ), so the origin is the north-west corner
/// of the Web-Mercator square.
pub fn tilemap_resource_xml(
    scene: &Scene,
    bands: &BandSelection,
    extent: &MercatorBounds,
    zoom: ZoomRange,
) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<TileMap version=\"1.0.0\" tilemapservice=\"http://tms.osgeo.org/1.0.0\">\n");
    xml.push_str(&format!("  <Title>{}</Title>\n", escape_xml(&scene.id)));
    xml.push_str(&format!(
        "  <Abstract>{} {}</Abstract>\n",
        escape_xml(&scene.acquired),
        escape_xml(&bands.to_string())
    ));
    xml.push_str("  <SRS>EPSG:3857</SRS>\n");
    xml.push_str(&format!(
        "  <BoundingBox minx=\"{:.6}\" miny=\"{:.6}\" maxx=\"{:.6}\" maxy=\"{:.6}\"/>\n",
        extent.min_x, extent.min_y, extent.max_x, extent.max_y
    ));
    xml.push_str(&format!(
        "  <Origin x=\"{:.6}\" y=\"{:.6}\"/>\n",
        -MERCATOR_ORIGIN, MERCATOR_ORIGIN
    ));
    xml.push_str(&format!(
        "  <TileFormat width=\"{TILE_SIZE}\" height=\"{TILE_SIZE}\" mime-type=\"image/png\" extension=\"png\"/>\n"
    ));
    xml.push_str("  <TileSets profile=\"global-mercator\">\n");
    for z in zoom.levels() {
        xml.push_str(&format!(
            "    <TileSet href=\"{z}\" units-per-pixel=\"{:.10}\" order=\"{z}\"/>\n",
            units_per_pixel(z)
        ));
    }
    xml.push_str("  </TileSets>\n");
    xml.push_str("</TileMap>\n");
    xml
}

/// GDAL WMS service description reading the local pyramid.
pub fn gdal_wms_xml(scene_dir: &str, zoom: ZoomRange) -> String {
    let server_url = format!("file://{}/${{z}}/${{x}}/${{y}}.png", scene_dir.trim_end_matches('/'));
    format!(
        "<GDAL_WMS>
  <Service name=\"TMS\">
    <ServerUrl>{server_url}</ServerUrl>
  </Service>
  <DataWindow>
    <UpperLeftX>{min:.6}</UpperLeftX>
    <UpperLeftY>{max:.6}</UpperLeftY>
    <LowerRightX>{max:.6}</LowerRightX>
    <LowerRightY>{min:.6}</LowerRightY>
    <TileLevel>{level}</TileLevel>
    <TileCountX>1</TileCountX>
    <TileCountY>1</TileCountY>
    <YOrigin>top</YOrigin>
  </DataWindow>
  <Projection>EPSG:3857</Projection>
  <BlockSizeX>{TILE_SIZE}</BlockSizeX>
  <BlockSizeY>{TILE_SIZE}</BlockSizeY>
  <BandsCount>4</BandsCount>
  <ZeroBlockHttpCodes>404</ZeroBlockHttpCodes>
  <ZeroBlockOnServerException>true</ZeroBlockOnServerException>
</GDAL_WMS>
",
        server_url = escape_xml(&server_url),
        min = -MERCATOR_ORIGIN,
        max = MERCATOR_ORIGIN,
        level = zoom.max,
    )
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
