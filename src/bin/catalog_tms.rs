use std::collections::BTreeMap;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use catalog_tms::app::App;
use catalog_tms::catalog::HttpCatalogClient;
use catalog_tms::config::{
    CONFIG_FILE, ConfigLoader, JsonSettingsStore, ResolvedConfig, SettingsStore,
};
use catalog_tms::domain::{BandSelection, Satellite, Scene, ZoomRange};
use catalog_tms::error::CatalogError;
use catalog_tms::geometry::{GeoBounds, Geometry};
use catalog_tms::metadata;
use catalog_tms::output::{JsonOutput, LogProgress};
use catalog_tms::store::{SceneCatalog, TmsCache};
use catalog_tms::transfer::{CancelToken, FailureKind};

#[derive(Parser)]
#[command(name = "catalog-tms")]
#[command(about = "Search Landsat 8 / Sentinel 2 scene catalogs and build local TMS tile caches")]
#[command(version, author)]
struct Cli {
    /// Settings file (defaults to catalog-tms.json in the current directory)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search the catalog for scenes intersecting an area")]
    Search(SearchArgs),
    #[command(about = "Download tile pyramids for scenes of a saved catalog")]
    Materialize(MaterializeArgs),
    #[command(about = "Check tile availability for scenes of a saved catalog")]
    Verify(VerifyArgs),
    #[command(about = "Check that the tile hosts are reachable")]
    Hosts,
    #[command(about = "Validate and store tile API keys")]
    Keys(KeysArgs),
    #[command(about = "Show the metadata of one scene")]
    Metadata(MetadataArgs),
    #[command(about = "Inspect or clear the local tile cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long)]
    satellite: Option<String>,

    /// min_lon,min_lat,max_lon,max_lat
    #[arg(long, conflicts_with = "geometry")]
    bbox: Option<String>,

    /// GeoJSON file holding a Polygon, MultiPolygon or Feature
    #[arg(long)]
    geometry: Option<Utf8PathBuf>,

    #[arg(long)]
    from: Option<NaiveDate>,

    #[arg(long)]
    to: Option<NaiveDate>,

    /// Write the found scenes to this catalog file
    #[arg(long)]
    save: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ScanArgs {
    /// Catalog file written by `search --save`
    #[arg(long)]
    catalog: Utf8PathBuf,

    /// Scene ids to process, in order (all scenes when omitted)
    #[arg(long = "scene")]
    scenes: Vec<String>,

    /// Comma separated band codes, e.g. B6,B5,B4
    #[arg(long)]
    bands: Option<String>,
}

#[derive(Args)]
struct MaterializeArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Zoom range, e.g. 8-12
    #[arg(long)]
    zoom: Option<ZoomRange>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    #[command(flatten)]
    scan: ScanArgs,
}

#[derive(Args)]
struct KeysArgs {
    #[arg(long)]
    landsat: Option<String>,

    #[arg(long)]
    sentinel: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MetadataFormat {
    Json,
    Text,
    Html,
    Pairs,
}

#[derive(Args)]
struct MetadataArgs {
    #[arg(long)]
    catalog: Utf8PathBuf,

    #[arg(long)]
    scene: String,

    #[arg(long, value_enum, default_value = "text")]
    format: MetadataFormat,

    /// Key expression such as '"TMS","has_checked"'
    #[arg(long, conflicts_with = "format")]
    key: Option<String>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,

    #[arg(long, global = true)]
    output: Option<Utf8PathBuf>,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Report the size of the tile cache")]
    Size,
    #[command(about = "Remove all scene pyramids from the tile cache")]
    Clear,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CatalogError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CatalogError) -> u8 {
    match error {
        CatalogError::InvalidSatellite { .. }
        | CatalogError::InvalidBand(_)
        | CatalogError::InvalidDate(_)
        | CatalogError::InvalidZoomRange(_)
        | CatalogError::InvalidGeometry(_)
        | CatalogError::InvalidSceneId(_)
        | CatalogError::InvalidKey(_)
        | CatalogError::InvalidTerminalKey(_)
        | CatalogError::MissingPath(_)
        | CatalogError::InvalidKeyExpression(_)
        | CatalogError::SceneNotFound(_)
        | CatalogError::NothingToProcess
        | CatalogError::ExceededLimit { .. }
        | CatalogError::MissingConfig => 2,
        CatalogError::Transfer(failure) if failure.kind != FailureKind::Io => 3,
        CatalogError::CatalogResponse(_)
        | CatalogError::TileUnavailable(_)
        | CatalogError::InvalidApiKeys(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Search(args) => run_search(args, &config),
        Commands::Materialize(args) => run_materialize(args, &config),
        Commands::Verify(args) => run_verify(args, &config),
        Commands::Hosts => run_hosts(&config),
        Commands::Keys(args) => run_keys(args, cli.config.as_deref(), &config),
        Commands::Metadata(args) => run_metadata(args),
        Commands::Cache(args) => run_cache(args, &config),
    }
}

fn build_app(
    config: &ResolvedConfig,
    output: Option<Utf8PathBuf>,
) -> miette::Result<Arc<App<HttpCatalogClient>>> {
    let client = HttpCatalogClient::new(
        config.endpoints.clone(),
        &config.transfer,
        config.credential.clone(),
    )?;
    let cache = TmsCache::new(output.unwrap_or_else(|| config.output_dir.clone()));
    Ok(Arc::new(App::new(cache, client)))
}

/// Ctrl-C cancels the active search or scan; a canceled scan still saves
/// the scenes it finished.
fn cancel_on_interrupt(app: &Arc<App<HttpCatalogClient>>) -> miette::Result<()> {
    let app = Arc::clone(app);
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, canceling");
        app.cancel();
    })
    .into_diagnostic()
}

fn run_search(args: SearchArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let satellite = args
        .satellite
        .unwrap_or_else(|| config.satellite.as_str().to_string());
    let geometry = match (args.bbox, args.geometry) {
        (Some(bbox), _) => Geometry::from_bounds(&GeoBounds::parse_csv(&bbox)?),
        (None, Some(path)) => read_geometry(&path)?,
        (None, None) => config.area.clone().ok_or_else(|| {
            CatalogError::InvalidGeometry(
                "no search area (use --bbox, --geometry or \"area\" in config)".to_string(),
            )
        })?,
    };
    let date_from = args.from.unwrap_or(config.date_from);
    let date_to = args.to.unwrap_or(config.date_to);

    let app = build_app(config, None)?;
    cancel_on_interrupt(&app)?;
    let catalog = app.run_search(&satellite, geometry, date_from, date_to, &LogProgress)?;
    if let Some(path) = args.save {
        catalog.save(&path)?;
        tracing::info!(path = %path, scenes = catalog.scenes.len(), "catalog saved");
    }
    JsonOutput::print(&catalog).into_diagnostic()?;
    Ok(())
}

fn read_geometry(path: &Utf8PathBuf) -> Result<Geometry, CatalogError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| CatalogError::Filesystem(format!("{path}: {err}")))?;
    let mut value: Value = serde_json::from_str(&content)
        .map_err(|err| CatalogError::InvalidGeometry(err.to_string()))?;
    if let Some(geometry) = value.get_mut("geometry") {
        value = geometry.take();
    }
    let geometry = Geometry::from_value(value)?;
    geometry.bounds()?;
    Ok(geometry)
}

fn scan_bands(args: &ScanArgs, catalog: &SceneCatalog) -> Result<BandSelection, CatalogError> {
    match &args.bands {
        Some(bands) => BandSelection::for_satellite(catalog.satellite, bands.split(',')),
        None => Ok(catalog.satellite.vegetation_bands()),
    }
}

fn run_materialize(args: MaterializeArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let mut catalog = SceneCatalog::load(&args.scan.catalog)?;
    let bands = scan_bands(&args.scan, &catalog)?;
    let zoom = args.zoom.unwrap_or(config.zoom);
    let items =
        App::<HttpCatalogClient>::select_items(catalog.scenes.clone(), &args.scan.scenes)?;

    let app = build_app(config, args.output)?;
    cancel_on_interrupt(&app)?;
    let outcome = app.run_materialize(items, bands, zoom, &LogProgress)?;
    merge_scenes(&mut catalog, outcome.scenes);
    catalog.save(&args.scan.catalog)?;
    JsonOutput::print(&outcome.summary).into_diagnostic()?;
    Ok(())
}

fn run_verify(args: VerifyArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let mut catalog = SceneCatalog::load(&args.scan.catalog)?;
    let bands = scan_bands(&args.scan, &catalog)?;
    let items =
        App::<HttpCatalogClient>::select_items(catalog.scenes.clone(), &args.scan.scenes)?;

    let app = build_app(config, None)?;
    cancel_on_interrupt(&app)?;
    let outcome = app.run_verify(items, bands, &LogProgress)?;
    merge_scenes(&mut catalog, outcome.scenes);
    catalog.save(&args.scan.catalog)?;
    JsonOutput::print(&outcome.summary).into_diagnostic()?;
    Ok(())
}

fn merge_scenes(catalog: &mut SceneCatalog, updated: Vec<Scene>) {
    for scene in updated {
        if let Some(slot) = catalog.scenes.iter_mut().find(|item| item.id == scene.id) {
            *slot = scene;
        }
    }
}

fn run_hosts(config: &ResolvedConfig) -> miette::Result<()> {
    let app = build_app(config, None)?;
    let report = app.check_hosts(&LogProgress)?;
    JsonOutput::print(&report).into_diagnostic()?;
    if let Some(message) = report.failure_message("Host(s) not live") {
        return Err(miette::Report::msg(message));
    }
    Ok(())
}

fn run_keys(args: KeysArgs, path: Option<&str>, config: &ResolvedConfig) -> miette::Result<()> {
    let mut keys = BTreeMap::new();
    if let Some(key) = args.landsat {
        keys.insert(Satellite::Landsat8, key);
    }
    if let Some(key) = args.sentinel {
        keys.insert(Satellite::Sentinel2, key);
    }
    if keys.is_empty() {
        return Err(miette::Report::msg("no key given (use --landsat and/or --sentinel)"));
    }

    let mut client = HttpCatalogClient::new(
        config.endpoints.clone(),
        &config.transfer,
        config.credential.clone(),
    )?;
    let report = client.apply_api_keys(&keys, &CancelToken::new())?;

    let settings = JsonSettingsStore::new(path.unwrap_or(CONFIG_FILE));
    let mut stored = settings.load()?;
    stored.api_keys = client.endpoints().api_keys.clone();
    settings.save(&stored)?;
    tracing::info!(path = %settings.path(), "api keys saved");
    JsonOutput::print(&report).into_diagnostic()?;
    Ok(())
}

fn run_metadata(args: MetadataArgs) -> miette::Result<()> {
    let catalog = SceneCatalog::load(&args.catalog)?;
    let scene = catalog
        .scenes
        .iter()
        .find(|scene| scene.id == args.scene)
        .ok_or_else(|| CatalogError::SceneNotFound(args.scene.clone()))?;

    if let Some(expression) = args.key {
        let value = metadata::value_from_metadata(&scene.meta_json(), &expression)?;
        return JsonOutput::print(&value).into_diagnostic();
    }

    let document = scene.metadata_document();
    let text = match args.format {
        MetadataFormat::Json => return JsonOutput::print(&document).into_diagnostic(),
        MetadataFormat::Text => metadata::to_indented_text(&document),
        MetadataFormat::Html => scene.meta_html(),
        MetadataFormat::Pairs => metadata::to_key_value_lines(&document),
    };
    JsonOutput::print_text(&text).into_diagnostic()
}

fn run_cache(args: CacheArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let app = build_app(config, args.output)?;
    match args.command {
        CacheCommand::Size => JsonOutput::print(&app.cache_report()?).into_diagnostic(),
        CacheCommand::Clear => JsonOutput::print(&app.clear_cache()?).into_diagnostic(),
    }
}
