use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde_json::Value;

use catalog_tms::domain::{Satellite, Scene};
use catalog_tms::error::CatalogError;
use catalog_tms::geometry::TileKey;
use catalog_tms::store::{SceneCatalog, TmsCache};

fn temp_cache() -> (tempfile::TempDir, TmsCache) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("tms")).unwrap();
    (temp, TmsCache::new(root))
}

#[test]
fn layout_paths() {
    let cache = TmsCache::new(Utf8PathBuf::from("/data/tms"));
    let key = TileKey { x: 135, y: 91, z: 8 };
    assert_eq!(
        cache.tile_path("S1", &key).unwrap(),
        Utf8PathBuf::from("/data/tms/S1/8/135/91.png")
    );
    assert_eq!(
        cache.capabilities_path("S1").unwrap(),
        Utf8PathBuf::from("/data/tms/S1/tilemapresource.xml")
    );
    assert_eq!(
        cache.service_xml_path("S1").unwrap(),
        Utf8PathBuf::from("/data/tms/S1.xml")
    );
    assert_matches!(
        cache.tile_path("../escape", &key),
        Err(CatalogError::InvalidSceneId(_))
    );
}

#[test]
fn atomic_write_leaves_no_partial_files() {
    let (_temp, cache) = temp_cache();
    let path = cache.tile_path("S1", &TileKey { x: 1, y: 2, z: 3 }).unwrap();
    TmsCache::write_bytes_atomic(&path, b"first").unwrap();
    TmsCache::write_bytes_atomic(&path, b"second").unwrap();
    assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"second");

    let parent = path.parent().unwrap();
    let entries = std::fs::read_dir(parent.as_std_path()).unwrap().count();
    assert_eq!(entries, 1);
}

#[test]
fn size_and_scene_ids_follow_contents() {
    let (_temp, cache) = temp_cache();
    assert_eq!(cache.size_bytes().unwrap(), 0);
    assert!(cache.scene_ids().unwrap().is_empty());

    let key = TileKey { x: 0, y: 0, z: 0 };
    TmsCache::write_bytes_atomic(&cache.tile_path("S2", &key).unwrap(), b"12345").unwrap();
    TmsCache::write_bytes_atomic(&cache.tile_path("S1", &key).unwrap(), b"123").unwrap();
    TmsCache::write_bytes_atomic(&cache.service_xml_path("S1").unwrap(), b"xx").unwrap();

    assert_eq!(cache.size_bytes().unwrap(), 10);
    assert_eq!(cache.scene_ids().unwrap(), ["S1", "S2"]);
}

#[test]
fn clear_removes_scenes_and_service_files() {
    let (_temp, cache) = temp_cache();
    let key = TileKey { x: 0, y: 0, z: 0 };
    TmsCache::write_bytes_atomic(&cache.tile_path("S1", &key).unwrap(), b"png").unwrap();
    TmsCache::write_bytes_atomic(&cache.service_xml_path("S1").unwrap(), b"xml").unwrap();
    TmsCache::write_bytes_atomic(&cache.root().join("notes.txt"), b"keep").unwrap();

    let report = cache.clear().unwrap();
    assert_eq!(report.scene_dirs, 1);
    assert_eq!(report.service_files, 1);
    assert!(cache.scene_ids().unwrap().is_empty());
    assert!(cache.root().join("notes.txt").as_std_path().exists());
}

#[test]
fn clear_on_missing_root_is_empty() {
    let (_temp, cache) = temp_cache();
    let report = cache.clear().unwrap();
    assert_eq!(report.scene_dirs + report.service_files, 0);
}

#[test]
fn scene_catalog_round_trips_through_disk() {
    let (temp, _cache) = temp_cache();
    let response: Value =
        serde_json::from_str(include_str!("fixtures/search_response.json")).unwrap();
    let scenes = response["results"]
        .as_array()
        .unwrap()
        .iter()
        .cloned()
        .map(Scene::from_catalog_item)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let catalog = SceneCatalog {
        satellite: Satellite::Landsat8,
        date_from: NaiveDate::from_ymd_opt(2017, 4, 1).unwrap(),
        date_to: NaiveDate::from_ymd_opt(2017, 4, 30).unwrap(),
        scenes,
    };

    let path = Utf8PathBuf::from_path_buf(temp.path().join("catalog.json")).unwrap();
    catalog.save(&path).unwrap();
    let loaded = SceneCatalog::load(&path).unwrap();
    assert_eq!(loaded, catalog);

    let raw: Value = serde_json::from_slice(&std::fs::read(path.as_std_path()).unwrap()).unwrap();
    assert_eq!(raw["satellite"], "landsat-8");
}

#[test]
fn loading_missing_catalog_fails() {
    let (temp, _cache) = temp_cache();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("absent.json")).unwrap();
    assert_matches!(SceneCatalog::load(&path), Err(CatalogError::Filesystem(_)));
}
