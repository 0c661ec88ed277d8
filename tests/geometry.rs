use assert_matches::assert_matches;
use serde_json::json;

use catalog_tms::domain::Scene;
use catalog_tms::error::CatalogError;
use catalog_tms::geometry::{
    GeoBounds, Geometry, MERCATOR_ORIGIN, TileKey, TileRange, lon_lat_to_mercator,
    units_per_pixel,
};

fn footprint() -> Geometry {
    Geometry::from_value(json!({
        "type": "Polygon",
        "coordinates": [[[10.0, 45.0], [10.5, 45.0], [10.5, 45.5], [10.0, 45.5], [10.0, 45.0]]]
    }))
    .unwrap()
}

#[test]
fn inverted_range_is_empty() {
    let range = TileRange {
        z: 4,
        min_x: 5,
        max_x: 4,
        min_y: 2,
        max_y: 2,
    };
    assert!(range.is_empty());
    assert_eq!(range.len(), 0);
    assert_eq!(range.iter().count(), 0);
}

#[test]
fn zoom_zero_has_a_single_tile() {
    for (lat, lon) in [(0.0, 0.0), (60.0, -120.0), (-80.0, 179.9)] {
        assert_eq!(
            TileKey::from_lat_lon(lat, lon, 0).unwrap(),
            TileKey { x: 0, y: 0, z: 0 }
        );
    }
}

#[test]
fn tile_key_for_northwest_corner() {
    let (lat, lon) = footprint().bounds().unwrap().northwest();
    assert_eq!((lat, lon), (45.5, 10.0));
    assert_eq!(
        TileKey::from_lat_lon(lat, lon, 8).unwrap(),
        TileKey { x: 135, y: 91, z: 8 }
    );
}

#[test]
fn scene_cornered_at_origin_checks_world_tile() {
    let scene = Scene::from_catalog_item(json!({
        "scene_id": "LC81970602017101LGN00",
        "product_id": "LC08_L1TP_197060_20170411_20170415_01_T1",
        "satellite_name": "landsat-8",
        "date": "2017-04-11",
        "data_geometry": {
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, -1.0], [0.0, -1.0], [0.0, 0.0]]]
        }
    }))
    .unwrap();
    assert_eq!(scene.tms.minimum_tile, TileKey { x: 0, y: 0, z: 0 });

    assert_eq!(
        TileKey::minimum(45.5, 10.0).unwrap(),
        TileKey { x: 135, y: 91, z: 8 }
    );
    assert_eq!(TileKey::minimum(0.0, 10.0).unwrap().z, 8);
}

#[test]
fn tile_key_rejects_zoom_past_limit() {
    assert_matches!(
        TileKey::from_lat_lon(0.0, 0.0, 23),
        Err(CatalogError::InvalidZoomRange(_))
    );
}

#[test]
fn covering_range_spans_footprint() {
    let extent = footprint().to_web_mercator().unwrap();
    let range = TileRange::covering(&extent, 8);
    assert_eq!(
        range,
        TileRange {
            z: 8,
            min_x: 135,
            max_x: 135,
            min_y: 91,
            max_y: 92
        }
    );
    assert_eq!(range.len(), 2);
    assert!(!range.is_empty());
    let keys = range.iter().collect::<Vec<_>>();
    assert_eq!(keys[0], TileKey { x: 135, y: 91, z: 8 });
    assert_eq!(keys[1], TileKey { x: 135, y: 92, z: 8 });
}

#[test]
fn covering_range_contains_minimum_tile_at_every_level() {
    let geometry = footprint();
    let extent = geometry.to_web_mercator().unwrap();
    let (lat, lon) = geometry.bounds().unwrap().northwest();
    for z in 0..=12 {
        let corner = TileKey::from_lat_lon(lat, lon, z).unwrap();
        let range = TileRange::covering(&extent, z);
        assert_eq!((range.min_x, range.min_y), (corner.x, corner.y), "zoom {z}");
    }
}

#[test]
fn multipolygon_bounds_cover_all_parts() {
    let geometry = Geometry::from_value(json!({
        "type": "MultiPolygon",
        "coordinates": [
            [[[1.0, 2.0], [3.0, 2.0], [3.0, 4.0], [1.0, 2.0]]],
            [[[-5.0, -1.0], [0.0, -1.0], [0.0, 7.0], [-5.0, -1.0]]]
        ]
    }))
    .unwrap();
    assert_eq!(geometry.bounds().unwrap(), GeoBounds::new(-5.0, -1.0, 3.0, 7.0));
}

#[test]
fn reprojection_leaves_geometry_untouched() {
    let geometry = footprint();
    let before = geometry.clone();
    let extent = geometry.to_web_mercator().unwrap();
    assert_eq!(geometry, before);
    assert!(extent.min_x < extent.max_x);
    assert!(extent.min_y < extent.max_y);
}

#[test]
fn mercator_edges_match_origin() {
    let (x, _) = lon_lat_to_mercator(180.0, 0.0);
    assert!((x - MERCATOR_ORIGIN).abs() < 1e-6);
    let (_, y) = lon_lat_to_mercator(0.0, 90.0);
    assert!((y - MERCATOR_ORIGIN).abs() < 1.0);
    assert!((units_per_pixel(0) - 156_543.033_928).abs() < 1e-3);
}

#[test]
fn invalid_geometry_is_rejected() {
    assert_matches!(
        Geometry::from_value(json!({"type": "Point", "coordinates": [1.0, 2.0]})),
        Err(CatalogError::InvalidGeometry(_))
    );
    let empty = Geometry::Polygon(Vec::new());
    assert_matches!(empty.bounds(), Err(CatalogError::InvalidGeometry(_)));
}

#[test]
fn bbox_parses_into_search_polygon() {
    let bounds = GeoBounds::parse_csv("10, 45, 11, 46").unwrap();
    let geometry = Geometry::from_bounds(&bounds);
    assert_eq!(geometry.bounds().unwrap(), bounds);
    assert!(geometry.to_geojson().starts_with("{\"type\":\"Polygon\""));

    assert_matches!(
        GeoBounds::parse_csv("10,45,11"),
        Err(CatalogError::InvalidGeometry(_))
    );
    assert_matches!(
        GeoBounds::parse_csv("11,45,10,46"),
        Err(CatalogError::InvalidGeometry(_))
    );
}

#[test]
fn template_fill_replaces_placeholders() {
    let key = TileKey { x: 3, y: 5, z: 8 };
    assert_eq!(
        key.fill("https://tiles/{z}/{x}/{y}.png?rgb=6,5,4"),
        "https://tiles/8/3/5.png?rgb=6,5,4"
    );
}
