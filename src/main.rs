use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use catalogrs::config::{Config, ExistingPolicy};
use catalogrs::core::catalog::{CatalogReader, read_all};
use catalogrs::core::index::Selection;
use catalogrs::core::identity::{IdentityNormalizer, RawIdentity};
use catalogrs::core::key::{IdentityKey, KeyBuilder};
use catalogrs::core::matcher::{MatchStatus, Reconciler};
use catalogrs::core::pipeline::{Pipeline, PipelineProgress, RunSummary};
use catalogrs::core::report::{ReportSink, read_inventory, write_inventory};
use catalogrs::core::scanner::{ArchiveScanner, ScannedItem};
use catalogrs::core::transcode::ColorMode;

#[derive(Parser, Debug)]
#[command(
    name = "catalogrs",
    version,
    about = "Reconcile a product photo archive against catalog spreadsheets"
)]
struct Cli {
    /// Config file (default: the per-user catalogrs/config.toml, if present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inventory product folders into a JSON-lines file
    Scan {
        /// Archive root laid out as <size>/<name>/<surface>
        #[arg(short, long, value_name = "DIR")]
        archive: PathBuf,
        /// Inventory file to write
        #[arg(short, long, value_name = "FILE")]
        out: PathBuf,
    },

    /// Check which catalog rows have photos in the archive
    Reconcile {
        #[command(flatten)]
        source: SourceArgs,
        /// Catalog spreadsheet(s)
        #[arg(short, long, value_name = "FILE", required = true, num_args = 1..)]
        catalog: Vec<PathBuf>,
        /// Write per-row results as JSON lines
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
        /// Suggest near matches at or above this similarity (0.0-1.0)
        #[arg(long, value_name = "CUTOFF")]
        fuzzy: Option<f64>,
    },

    /// Build the deduplicated, size-budgeted image set
    Build {
        #[command(flatten)]
        source: SourceArgs,
        /// Output root
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        /// Only build products these catalog spreadsheets ask for
        #[arg(short, long, value_name = "FILE", num_args = 1..)]
        catalog: Vec<PathBuf>,
        /// Append per-image results as JSON lines
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
        #[command(flatten)]
        overrides: BuildOverrides,
        /// Do not ask before writing into a non-empty output root
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the canonical key for an identity triple
    Key {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        size: String,
        #[arg(long, default_value = "")]
        surface: String,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Archive root to scan
    #[arg(short, long, value_name = "DIR")]
    archive: Option<PathBuf>,
    /// Inventory written by `scan`
    #[arg(short, long, value_name = "FILE")]
    inventory: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BuildOverrides {
    /// Byte budget per output image
    #[arg(long, value_name = "BYTES")]
    max_bytes: Option<u64>,
    /// Short-edge limit in pixels
    #[arg(long, value_name = "PX")]
    max_short_edge: Option<u32>,
    /// Worker threads (0 = one per core)
    #[arg(short, long)]
    jobs: Option<usize>,
    /// What to do with outputs that already exist
    #[arg(long, value_enum)]
    existing: Option<ExistingPolicy>,
    /// Colour handling for re-encoded images
    #[arg(long, value_enum)]
    color: Option<ColorMode>,
    /// Only show what would be written
    #[arg(long)]
    dry_run: bool,
}

impl BuildOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(max_bytes) = self.max_bytes {
            config.transcode.max_bytes = max_bytes;
        }
        if let Some(max_short_edge) = self.max_short_edge {
            config.transcode.max_short_edge = max_short_edge;
        }
        if let Some(jobs) = self.jobs {
            config.pipeline.jobs = jobs;
        }
        if let Some(existing) = self.existing {
            config.pipeline.existing = existing;
        }
        if let Some(color) = self.color {
            config.transcode.color_mode = color;
        }
        if self.dry_run {
            config.pipeline.dry_run = true;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "catalogrs=debug" } else { "catalogrs=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Scan { archive, out } => {
            println!("▶ Scanning archive: {}", archive.display());
            let items = benchmark("scanning", || scan_archive(&archive, &config))?;
            let written = write_inventory(&out, &items)
                .with_context(|| format!("Failed to write inventory {}", out.display()))?;
            let empty = items.iter().filter(|item| item.asset_count == 0).count();
            let images: usize = items.iter().map(|item| item.asset_count).sum();
            println!(
                "✅ {} product folders ({} images, {} empty) → {}",
                written,
                images,
                empty,
                out.display()
            );
        }

        Commands::Reconcile {
            source,
            catalog,
            report,
            fuzzy,
        } => {
            if fuzzy.is_some() {
                config.matching.fuzzy_cutoff = fuzzy;
            }
            config.validate()?;

            let items = load_items(&source, &config)?;
            let pipeline = Pipeline::new(Arc::new(config.clone()));
            let plan = pipeline.plan(items);

            let reader = CatalogReader::new(config.catalog.clone());
            let sheets = read_all(&reader, &catalog).context("Failed to read catalog")?;
            let reconciler = Reconciler::new(pipeline.normalizer(), config.matching.fuzzy_cutoff);

            let mut sink = report
                .as_deref()
                .map(ReportSink::create)
                .transpose()
                .context("Failed to open reconcile report")?;

            for (path, sheet) in &sheets {
                let result = reconciler.reconcile(sheet, &plan.selection);
                println!("\n📄 {}", path.display());
                println!(
                    "   ✅ ready: {}   🔎 near: {}   ❌ missing: {}   ⚠️  rejected rows: {}",
                    result.ready_count(),
                    result.near_match_count(),
                    result.missing_count(),
                    result.defects.len()
                );

                for entry in &result.entries {
                    match &entry.status {
                        MatchStatus::Ready { .. } => {}
                        MatchStatus::NearMatch {
                            suggested, similarity, ..
                        } => println!(
                            "   🔎 row {}: {} ≈ {} ({:.2})",
                            entry.row_number, entry.key, suggested, similarity
                        ),
                        MatchStatus::Missing => println!("   ❌ row {}: {}", entry.row_number, entry.key),
                    }
                    if let Some(sink) = sink.as_mut() {
                        sink.append(entry)?;
                    }
                }
                for (key, rows) in &result.duplicate_rows {
                    println!("   🔁 {} requested by rows {:?}", key, rows);
                }
                for defect in &result.defects {
                    println!("   ⚠️  row {}: {}", defect.row_number, defect.reason);
                }
                println!("   📦 {} archive products not in this catalog", result.archive_only.len());
            }

            if let Some(sink) = sink {
                let path = sink.path().display().to_string();
                sink.finish()?;
                println!("\n✅ Wrote reconcile report to {}", path);
            }
        }

        Commands::Build {
            source,
            output,
            catalog,
            report,
            overrides,
            yes,
        } => {
            overrides.apply(&mut config);
            config.validate()?;
            let config = Arc::new(config);

            let items = load_items(&source, &config)?;

            let bar = ProgressBar::hidden();
            let progress_bar = bar.clone();
            let mut pipeline = Pipeline::new(config.clone()).with_progress(Box::new(move |progress: PipelineProgress| {
                progress_bar.set_position(progress.completed_count as u64);
                progress_bar.set_message(progress.key.to_string());
            }));
            if let Some(report) = &report {
                pipeline = pipeline.with_report(report);
            }

            let mut plan = pipeline.plan(items);
            if !catalog.is_empty() {
                let wanted = catalog_keys(&pipeline, &config, &catalog, &plan.selection)?;
                plan.restrict_to(&wanted);
                println!("▶ Catalog asks for {} products present in the archive", plan.product_count());
            }

            if plan.product_count() == 0 {
                println!("Nothing to build.");
                return Ok(());
            }

            if config.pipeline.existing == ExistingPolicy::Overwrite
                && !config.pipeline.dry_run
                && !yes
                && has_entries(&output)
            {
                let proceed = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "{} is not empty and existing files will be overwritten. Continue?",
                        output.display()
                    ))
                    .default(false)
                    .interact()?;
                if !proceed {
                    println!("Aborted.");
                    return Ok(());
                }
            }

            println!(
                "▶ Building {} products ({} images) into {}",
                plan.product_count(),
                plan.image_count(),
                output.display()
            );
            bar.set_length(plan.image_count() as u64);
            bar.set_style(ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )?);
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());

            let summary = benchmark("building", || pipeline.execute(&plan, &output))
                .with_context(|| format!("Build into {} failed", output.display()))?;
            bar.finish_and_clear();

            print_summary(&summary, config.pipeline.dry_run);
            if let Some(report) = &report {
                if !config.pipeline.dry_run {
                    println!("✅ Appended run report to {}", report.display());
                }
            }
        }

        Commands::Key { name, size, surface } => {
            let normalizer = IdentityNormalizer::new(&config.vocabulary);
            let identity = normalizer.normalize(&RawIdentity::new(name, size, surface));
            println!("name:    {}", identity.name);
            println!("size:    {}", identity.size);
            println!("surface: {}", identity.surface);
            println!("key:     {}", KeyBuilder::build(&identity));
            if identity.has_sentinel() {
                println!("⚠️  Normalizes to a sentinel; fix the source data.");
            }
        }
    }

    Ok(())
}

fn scan_archive(archive: &Path, config: &Config) -> Result<Vec<ScannedItem>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning product folders…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let items = ArchiveScanner::new(config.pipeline.clone())
        .scan(archive)
        .with_context(|| format!("Failed to scan {}", archive.display()))?;

    spinner.finish_with_message(format!("Found {} product folders", items.len()));
    Ok(items)
}

fn load_items(source: &SourceArgs, config: &Config) -> Result<Vec<ScannedItem>> {
    match (&source.archive, &source.inventory) {
        (Some(archive), _) => scan_archive(archive, config),
        (None, Some(inventory)) => {
            let items = read_inventory(inventory)
                .with_context(|| format!("Failed to read inventory {}", inventory.display()))?;
            println!("▶ Loaded {} items from {}", items.len(), inventory.display());
            Ok(items)
        }
        (None, None) => anyhow::bail!("Either --archive or --inventory is required"),
    }
}

/// Keys requested by any of the catalogs that have an exact archive match.
fn catalog_keys(
    pipeline: &Pipeline,
    config: &Config,
    catalogs: &[PathBuf],
    selection: &Selection,
) -> Result<BTreeSet<IdentityKey>> {
    let reader = CatalogReader::new(config.catalog.clone());
    let reconciler = Reconciler::new(pipeline.normalizer(), None);

    let mut keys = BTreeSet::new();
    for (path, sheet) in read_all(&reader, catalogs).context("Failed to read catalog")? {
        let result = reconciler.reconcile(&sheet, selection);
        if result.missing_count() > 0 {
            println!(
                "⚠️  {}: {} rows have no photos in the archive",
                path.display(),
                result.missing_count()
            );
        }
        keys.extend(result.ready_keys());
    }
    Ok(keys)
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    println!("\n✨ Products: {}", summary.products);
    if dry_run {
        println!("   📝 Planned: {}", summary.planned);
    } else {
        println!(
            "   ✅ Processed: {} ({} re-encoded, {} copied, {} fallback)",
            summary.processed, summary.written, summary.copied, summary.fallbacks
        );
    }
    println!("   ⏭  Skipped: {}", summary.skipped);
    println!("   ❌ Errors: {}", summary.errors);
    if summary.missing_sources > 0 || summary.empty_sources > 0 {
        println!(
            "   ⚠️  Missing sources: {}, empty folders: {}",
            summary.missing_sources, summary.empty_sources
        );
    }
    if summary.superseded > 0 {
        println!("   🔁 Duplicate folders passed over: {}", summary.superseded);
    }
    if summary.sentinel_keys > 0 {
        println!("   ⚠️  Products with unknown name or size: {}", summary.sentinel_keys);
    }
    if summary.cancelled {
        println!("   🛑 Run was cancelled before finishing");
    }
    if dry_run {
        println!("\n⚠️  Dry-run only; no files were changed.");
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
