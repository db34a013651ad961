use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::identity::{CanonicalIdentity, IdentityNormalizer};
use super::index::{Selection, SourceCandidate, SourceIndex};
use super::key::{IdentityKey, KeyBuilder};
use super::report::{ReportError, ReportSink, digest_file};
use super::scanner::{ScannedItem, eligible_files};
use super::transcode::{ImageTranscoder, TranscodeOutcome, jpeg_destination};
use crate::config::{Config, ExistingPolicy};

/// Failures that abort a whole run. Everything per image or per product is
/// folded into [`RunSummary`] instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to create output root {path}: {source}")]
    OutputRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("{component:?} is not a plain directory name")]
    UnsafeComponent { component: String },
}

/// What happened to one source image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Copied {
        bytes: u64,
    },
    Written {
        bytes: u64,
        quality: Option<u8>,
        resized: bool,
        within_budget: bool,
    },
    Fallback {
        bytes: u64,
        reason: String,
    },
    /// Destination already present under the skip policy.
    Skipped,
    /// Dry run; nothing written.
    Planned,
    Failed {
        error: String,
    },
}

impl From<&TranscodeOutcome> for ItemStatus {
    fn from(outcome: &TranscodeOutcome) -> Self {
        match outcome {
            TranscodeOutcome::Copied { bytes, .. } => Self::Copied { bytes: *bytes },
            TranscodeOutcome::Written { report, .. } => Self::Written {
                bytes: report.bytes,
                quality: report.final_quality(),
                resized: report.resized,
                within_budget: report.within_budget,
            },
            TranscodeOutcome::FallbackCopied { bytes, reason, .. } => Self::Fallback {
                bytes: *bytes,
                reason: reason.clone(),
            },
        }
    }
}

/// One line of the run report.
#[derive(Debug, Clone, Serialize)]
pub struct ItemRecord {
    pub key: IdentityKey,
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(flatten)]
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blake3: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    pub key: IdentityKey,
    pub current_file: String,
    pub completed_count: usize,
    /// Image count from the scan; the files actually found may differ.
    pub total_count: usize,
}

pub type ProgressCallback = Box<dyn Fn(PipelineProgress) + Send + Sync>;

/// Normalized, grouped and deduplicated work for one run.
#[derive(Debug, Default)]
pub struct Plan {
    pub selection: Selection,
    /// Items whose location was not a readable directory.
    pub missing_sources: Vec<ScannedItem>,
    /// Keys built from a sentinel name or size.
    pub sentinel_keys: BTreeSet<IdentityKey>,
}

impl Plan {
    pub fn product_count(&self) -> usize {
        self.selection.len()
    }

    pub fn image_count(&self) -> usize {
        self.selection.winners.values().map(|c| c.asset_count).sum()
    }

    /// Drops every candidate, winning or not, whose key is not in `keys`.
    pub fn restrict_to(&mut self, keys: &BTreeSet<IdentityKey>) {
        self.selection.retain(|key| keys.contains(key));
        self.selection.superseded.retain(|candidate| keys.contains(&candidate.key));
        self.selection.empty.retain(|candidate| keys.contains(&candidate.key));
        self.sentinel_keys.retain(|key| keys.contains(key));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub products: usize,
    /// Images that produced an output file (copied, re-encoded or fallback-copied).
    pub processed: usize,
    pub written: usize,
    pub copied: usize,
    pub fallbacks: usize,
    pub skipped: usize,
    pub planned: usize,
    pub errors: usize,
    pub missing_sources: usize,
    pub empty_sources: usize,
    pub superseded: usize,
    pub sentinel_keys: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, status: &ItemStatus) {
        match status {
            ItemStatus::Copied { .. } => {
                self.processed += 1;
                self.copied += 1;
            }
            ItemStatus::Written { .. } => {
                self.processed += 1;
                self.written += 1;
            }
            ItemStatus::Fallback { .. } => {
                self.processed += 1;
                self.fallbacks += 1;
            }
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Planned => self.planned += 1,
            ItemStatus::Failed { .. } => self.errors += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.written += other.written;
        self.copied += other.copied;
        self.fallbacks += other.fallbacks;
        self.skipped += other.skipped;
        self.planned += other.planned;
        self.errors += other.errors;
        self.missing_sources += other.missing_sources;
        self.cancelled |= other.cancelled;
    }
}

/// Drives normalize -> select -> transcode for a batch of scanned items.
pub struct Pipeline {
    config: Arc<Config>,
    normalizer: IdentityNormalizer,
    transcoder: ImageTranscoder,
    cancellation_token: Arc<AtomicBool>,
    progress_callback: Option<ProgressCallback>,
    report_path: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            normalizer: IdentityNormalizer::new(&config.vocabulary),
            transcoder: ImageTranscoder::new(config.transcode.constraints()),
            config,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
            report_path: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Appends one JSON line per image to `path`.
    pub fn with_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn normalizer(&self) -> &IdentityNormalizer {
        &self.normalizer
    }

    pub fn plan(&self, items: Vec<ScannedItem>) -> Plan {
        let mut plan = Plan::default();
        let mut candidates = Vec::with_capacity(items.len());

        for item in items {
            if !item.location.is_dir() {
                tracing::warn!("Source location missing, skipping: {}", item.location.display());
                plan.missing_sources.push(item);
                continue;
            }

            let identity = self.normalizer.normalize(&item.raw);
            let key = KeyBuilder::build(&identity);
            if identity.has_sentinel() {
                tracing::warn!(
                    "{} normalizes to sentinel key {}",
                    item.location.display(),
                    key
                );
                plan.sentinel_keys.insert(key.clone());
            }

            candidates.push(SourceCandidate {
                key,
                identity,
                location: item.location,
                asset_count: item.asset_count,
                total_bytes: Some(item.total_bytes),
            });
        }

        plan.selection = SourceIndex::select_sorted(candidates);

        for loser in &plan.selection.superseded {
            tracing::debug!(
                "{} superseded for {} ({} images)",
                loser.location.display(),
                loser.key,
                loser.asset_count
            );
        }
        for empty in &plan.selection.empty {
            tracing::debug!("{} has no eligible images", empty.location.display());
        }
        tracing::info!(
            "Planned {} products from {} candidates ({} superseded, {} empty, {} missing)",
            plan.selection.len(),
            plan.selection.len() + plan.selection.superseded.len() + plan.selection.empty.len(),
            plan.selection.superseded.len(),
            plan.selection.empty.len(),
            plan.missing_sources.len()
        );
        plan
    }

    pub fn execute(&self, plan: &Plan, output_root: &Path) -> Result<RunSummary, PipelineError> {
        let dry_run = self.config.pipeline.dry_run;
        if !dry_run {
            fs::create_dir_all(output_root).map_err(|source| PipelineError::OutputRoot {
                path: output_root.display().to_string(),
                source,
            })?;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.pipeline.worker_count())
            .build()?;

        let sink = match &self.report_path {
            Some(path) if !dry_run => Some(Mutex::new(ReportSink::append_to(path)?)),
            _ => None,
        };

        let context = RunContext {
            output_root,
            sink: sink.as_ref(),
            completed: AtomicUsize::new(0),
            total: plan.image_count(),
        };

        let tasks: Vec<&SourceCandidate> = plan.selection.winners.values().collect();
        let results: Vec<RunSummary> = pool.install(|| {
            tasks
                .par_iter()
                .map(|candidate| self.process_product(candidate, &context))
                .collect()
        });

        let mut summary = RunSummary {
            products: plan.selection.len(),
            missing_sources: plan.missing_sources.len(),
            empty_sources: plan.selection.empty.len(),
            superseded: plan.selection.superseded.len(),
            sentinel_keys: plan.sentinel_keys.len(),
            ..Default::default()
        };
        for result in results {
            summary.merge(result);
        }

        if let Some(sink) = sink {
            let sink = sink.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
            let path = sink.path().display().to_string();
            let lines = sink.finish()?;
            tracing::info!("Appended {} records to {}", lines, path);
        }

        tracing::info!(
            "Run finished: {} processed, {} skipped, {} errors, {} fallbacks{}",
            summary.processed,
            summary.skipped,
            summary.errors,
            summary.fallbacks,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    pub fn run(&self, items: Vec<ScannedItem>, output_root: &Path) -> Result<RunSummary, PipelineError> {
        let plan = self.plan(items);
        self.execute(&plan, output_root)
    }

    fn process_product(&self, candidate: &SourceCandidate, context: &RunContext<'_>) -> RunSummary {
        let mut tally = RunSummary::default();

        let directory = match product_directory(context.output_root, &candidate.identity) {
            Ok(directory) => directory,
            Err(e) => {
                tracing::warn!("Not writing {}: {}", candidate.key, e);
                tally.errors += candidate.asset_count;
                return tally;
            }
        };

        let files = match eligible_files(&candidate.location, &self.config.pipeline) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", candidate.location.display(), e);
                tally.missing_sources += 1;
                return tally;
            }
        };

        let mut directory_error = None;
        if !self.config.pipeline.dry_run {
            if let Err(e) = fs::create_dir_all(&directory) {
                tracing::warn!("Cannot create {}: {}", directory.display(), e);
                directory_error = Some(e.to_string());
            }
        }

        let destinations = plan_destinations(&directory, &files);
        for (source, destination) in files.iter().zip(destinations) {
            if self.cancellation_token.load(Ordering::Relaxed) {
                tally.cancelled = true;
                break;
            }

            let failure = directory_error.clone().or_else(|| destination.as_ref().err().cloned());
            let record = match (failure, destination) {
                (None, Ok(destination)) => {
                    self.process_image(&candidate.key, source, destination, context.sink.is_some())
                }
                (error, destination) => ItemRecord {
                    key: candidate.key.clone(),
                    source: source.clone(),
                    destination: destination.unwrap_or_else(|_| directory.join(file_name_of(source))),
                    status: ItemStatus::Failed {
                        error: error.unwrap_or_default(),
                    },
                    blake3: None,
                },
            };

            tally.record(&record.status);
            context.append(&record);
            self.report_progress(candidate, source, context);
        }

        tally
    }

    fn process_image(&self, key: &IdentityKey, source: &Path, destination: PathBuf, digest: bool) -> ItemRecord {
        let mut record = ItemRecord {
            key: key.clone(),
            source: source.to_path_buf(),
            destination,
            status: ItemStatus::Planned,
            blake3: None,
        };

        if self.config.pipeline.existing == ExistingPolicy::Skip
            && (record.destination.exists() || jpeg_destination(&record.destination).exists())
        {
            tracing::debug!("Exists, skipping {}", record.destination.display());
            record.status = ItemStatus::Skipped;
            return record;
        }

        if self.config.pipeline.dry_run {
            return record;
        }

        match self.transcoder.transcode(source, &record.destination) {
            Ok(outcome) => {
                record.status = ItemStatus::from(&outcome);
                record.destination = outcome.path().to_path_buf();
                if digest {
                    record.blake3 = digest_file(outcome.path())
                        .inspect_err(|e| tracing::debug!("No digest for {}: {}", outcome.path().display(), e))
                        .ok();
                }
            }
            Err(e) => {
                tracing::warn!("{}: {}", source.display(), e);
                record.status = ItemStatus::Failed { error: e.to_string() };
            }
        }
        record
    }

    fn report_progress(&self, candidate: &SourceCandidate, source: &Path, context: &RunContext<'_>) {
        let completed = context.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(callback) = &self.progress_callback {
            callback(PipelineProgress {
                key: candidate.key.clone(),
                current_file: source.display().to_string(),
                completed_count: completed,
                total_count: context.total,
            });
        }
    }
}

struct RunContext<'a> {
    output_root: &'a Path,
    sink: Option<&'a Mutex<ReportSink>>,
    completed: AtomicUsize,
    total: usize,
}

impl RunContext<'_> {
    fn append(&self, record: &ItemRecord) {
        let Some(sink) = self.sink else {
            return;
        };
        let mut sink = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = sink.append(record) {
            tracing::warn!("Failed to record {}: {}", record.source.display(), e);
        }
    }
}

fn file_name_of(source: &Path) -> &OsStr {
    source.file_name().unwrap_or_else(|| OsStr::new("image"))
}

/// Destination for each source in one product folder.
///
/// A re-encode lands on the `.jpg` form of its destination, so `a.png` and
/// `a.jpg` would collide; the non-JPEG one becomes `a-png.png` instead. A
/// name that still clashes with an earlier file's output is refused.
pub fn plan_destinations(directory: &Path, files: &[PathBuf]) -> Vec<Result<PathBuf, String>> {
    let named = |source: &PathBuf| directory.join(file_name_of(source));

    let mut landings: HashMap<PathBuf, usize> = HashMap::new();
    for source in files {
        *landings.entry(jpeg_destination(&named(source))).or_default() += 1;
    }

    let mut claimed: HashSet<PathBuf> = HashSet::new();
    files
        .iter()
        .map(|source| {
            let mut destination = named(source);
            let reencoded = jpeg_destination(&destination);
            if reencoded != destination && landings.get(&reencoded).copied().unwrap_or(0) > 1 {
                let stem = destination.file_stem().unwrap_or_default().to_string_lossy().to_string();
                let ext = destination.extension().unwrap_or_default().to_string_lossy().to_string();
                destination = directory.join(format!("{stem}-{ext}.{ext}"));
            }

            let outputs = [jpeg_destination(&destination), destination.clone()];
            if let Some(taken) = outputs.iter().find(|output| claimed.contains(*output)) {
                tracing::warn!("{} would overwrite {}", source.display(), taken.display());
                return Err(format!("output {} is already used by another source", taken.display()));
            }
            claimed.extend(outputs);
            Ok(destination)
        })
        .collect()
}

/// `<root>/<size>/<name>/<surface>`, refusing any component that is not a
/// single plain directory name.
pub fn product_directory(root: &Path, identity: &CanonicalIdentity) -> Result<PathBuf, PipelineError> {
    let mut directory = root.to_path_buf();
    for component in [&identity.size, &identity.name, &identity.surface] {
        let mut parts = Path::new(component.as_str()).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(part)), None) if part == OsStr::new(component.as_str()) => {
                directory.push(part)
            }
            _ => {
                return Err(PipelineError::UnsafeComponent {
                    component: component.clone(),
                });
            }
        }
    }
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::ArchiveScanner;
    use image::{ImageBuffer, Rgb};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        img.save(path).unwrap();
    }

    /// Two spellings of one product (2 and 3 images) plus a second product.
    fn build_archive(root: &Path) {
        for i in 0..2 {
            create_test_image(&root.join(format!("60X120/ABACO BAMBU/MAT/{i}.jpg")), 120, 80);
        }
        for i in 0..3 {
            create_test_image(&root.join(format!("60 x 120/BAMBU ABACO/Mat/{i}.jpg")), 120, 80);
        }
        create_test_image(&root.join("30X60/ZEUS/FULL LAPPATO/z.jpg"), 90, 60);
    }

    fn config(edit: impl FnOnce(&mut Config)) -> Arc<Config> {
        let mut config = Config::default();
        config.pipeline.jobs = 2;
        edit(&mut config);
        Arc::new(config)
    }

    fn scan(root: &Path) -> Vec<ScannedItem> {
        ArchiveScanner::new(Default::default()).scan(root).unwrap()
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
                (relative, fs::read(entry.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_plan_keeps_folder_with_most_images() {
        let archive = TempDir::new().unwrap();
        build_archive(archive.path());

        let pipeline = Pipeline::new(config(|_| {}));
        let plan = pipeline.plan(scan(archive.path()));

        assert_eq!(plan.product_count(), 2);
        assert_eq!(plan.selection.superseded.len(), 1);
        let key = IdentityKey::parse("ABACO BAMBU_60X120_MAT").unwrap();
        let winner = plan.selection.winner(&key).unwrap();
        assert_eq!(winner.location, archive.path().join("60 x 120/BAMBU ABACO/Mat"));
        assert_eq!(plan.image_count(), 4);
    }

    #[test]
    fn test_run_writes_canonical_layout() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());

        let summary = Pipeline::new(config(|_| {}))
            .run(scan(archive.path()), output.path())
            .unwrap();

        assert_eq!(summary.products, 2);
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.copied, 4);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.superseded, 1);

        let files: Vec<PathBuf> = snapshot(output.path()).into_keys().collect();
        assert_eq!(
            files,
            vec![
                PathBuf::from("30X60/ZEUS/FLP/z.jpg"),
                PathBuf::from("60X120/ABACO BAMBU/MAT/0.jpg"),
                PathBuf::from("60X120/ABACO BAMBU/MAT/1.jpg"),
                PathBuf::from("60X120/ABACO BAMBU/MAT/2.jpg"),
            ]
        );
    }

    #[test]
    fn test_rerun_with_overwrite_is_byte_identical() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());

        let pipeline = Pipeline::new(config(|c| c.transcode.max_short_edge = 40));
        let first = pipeline.run(scan(archive.path()), output.path()).unwrap();
        let before = snapshot(output.path());
        let second = pipeline.run(scan(archive.path()), output.path()).unwrap();

        assert_eq!(first.written, 4);
        assert_eq!(first, second);
        assert_eq!(before, snapshot(output.path()));
    }

    #[test]
    fn test_skip_policy_leaves_existing_outputs() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());

        Pipeline::new(config(|_| {}))
            .run(scan(archive.path()), output.path())
            .unwrap();

        let summary = Pipeline::new(config(|c| c.pipeline.existing = ExistingPolicy::Skip))
            .run(scan(archive.path()), output.path())
            .unwrap();
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.processed, 0);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());
        let root = output.path().join("out");

        let summary = Pipeline::new(config(|c| c.pipeline.dry_run = true))
            .with_report(output.path().join("run.jsonl"))
            .run(scan(archive.path()), &root)
            .unwrap();

        assert_eq!(summary.planned, 4);
        assert!(!root.exists());
        assert!(!output.path().join("run.jsonl").exists());
    }

    #[test]
    fn test_missing_source_does_not_abort_batch() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());

        let mut items = scan(archive.path());
        let mut ghost = items[0].clone();
        ghost.location = archive.path().join("gone");
        items.push(ghost);

        let summary = Pipeline::new(config(|_| {}))
            .run(items, output.path())
            .unwrap();
        assert_eq!(summary.missing_sources, 1);
        assert_eq!(summary.processed, 4);
    }

    #[test]
    fn test_sentinel_keys_are_counted_and_processed() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        create_test_image(&archive.path().join("LOOSE/a.jpg"), 20, 20);

        let summary = Pipeline::new(config(|_| {}))
            .run(scan(archive.path()), output.path())
            .unwrap();
        assert_eq!(summary.sentinel_keys, 1);
        assert_eq!(summary.processed, 1);
        assert!(output.path().join("UNKNOWN-SIZE/LOOSE/OTHER/a.jpg").is_file());
    }

    #[test]
    fn test_cancelled_run_processes_nothing() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());

        let pipeline = Pipeline::new(config(|_| {}));
        pipeline.cancellation_token().store(true, Ordering::Relaxed);
        let summary = pipeline.run(scan(archive.path()), output.path()).unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
    }

    #[test]
    fn test_output_root_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let result = Pipeline::new(config(|_| {})).run(vec![], &blocker.join("out"));
        assert!(matches!(result, Err(PipelineError::OutputRoot { .. })));
    }

    #[test]
    fn test_report_lines_carry_digests() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        build_archive(archive.path());
        let report = output.path().join("run.jsonl");
        let root = output.path().join("out");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        Pipeline::new(config(|_| {}))
            .with_report(&report)
            .with_progress(Box::new(move |_: PipelineProgress| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .run(scan(archive.path()), &root)
            .unwrap();

        let lines: Vec<serde_json::Value> = fs::read_to_string(&report)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(seen.load(Ordering::Relaxed), 4);
        for line in &lines {
            assert_eq!(line["status"], "copied");
            let destination = PathBuf::from(line["destination"].as_str().unwrap());
            assert_eq!(line["blake3"], digest_file(&destination).unwrap());
        }
    }

    #[test]
    fn test_write_error_is_counted_and_siblings_continue() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        create_test_image(&archive.path().join("60X120/ABACO/MAT/a.jpg"), 40, 30);
        create_test_image(&archive.path().join("30X60/ZEUS/MAT/z.jpg"), 40, 30);

        // A directory squatting on the destination file name.
        fs::create_dir_all(output.path().join("60X120/ABACO/MAT/a.jpg")).unwrap();

        let summary = Pipeline::new(config(|_| {}))
            .run(scan(archive.path()), output.path())
            .unwrap();

        assert_eq!(summary.products, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.processed, 1);
        assert!(output.path().join("30X60/ZEUS/MAT/z.jpg").is_file());
    }

    #[test]
    fn test_png_and_jpg_with_same_stem_keep_separate_outputs() {
        let archive = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let folder = archive.path().join("60X120/ABACO/MAT");
        create_test_image(&folder.join("a.jpg"), 40, 30);
        create_test_image(&folder.join("a.png"), 200, 120);

        let edit = |c: &mut Config| {
            c.pipeline.extensions = vec!["jpg".into(), "png".into()];
            c.transcode.max_short_edge = 60;
        };
        let items = ArchiveScanner::new(config(edit).pipeline.clone())
            .scan(archive.path())
            .unwrap();

        let summary = Pipeline::new(config(edit)).run(items.clone(), output.path()).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.written, 1);

        let product = output.path().join("60X120/ABACO/MAT");
        assert_eq!(
            fs::read(product.join("a.jpg")).unwrap(),
            fs::read(folder.join("a.jpg")).unwrap()
        );
        assert_eq!(image::open(product.join("a-png.jpg")).unwrap().height(), 60);

        let rerun = Pipeline::new(config(|c| {
            edit(c);
            c.pipeline.existing = ExistingPolicy::Skip;
        }))
        .run(items, output.path())
        .unwrap();
        assert_eq!(rerun.skipped, 2);
    }

    #[test]
    fn test_plan_destinations() {
        let dir = Path::new("/out");
        let files: Vec<PathBuf> = ["a.jpg", "a.png", "b.png", "c.jpeg"]
            .iter()
            .map(|name| PathBuf::from("/src").join(name))
            .collect();

        let destinations: Vec<PathBuf> = plan_destinations(dir, &files)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            destinations,
            vec![
                PathBuf::from("/out/a.jpg"),
                PathBuf::from("/out/a-png.png"),
                PathBuf::from("/out/b.png"),
                PathBuf::from("/out/c.jpeg"),
            ]
        );

        // `a-png.jpg` is a real file here, so the renamed png has nowhere to go.
        let crowded: Vec<PathBuf> = ["a-png.jpg", "a.jpg", "a.png"]
            .iter()
            .map(|name| PathBuf::from("/src").join(name))
            .collect();
        let result = plan_destinations(dir, &crowded);
        assert!(result[0].is_ok() && result[1].is_ok());
        assert!(result[2].is_err());
    }

    #[test]
    fn test_restrict_to_scopes_diagnostics() {
        let archive = TempDir::new().unwrap();
        build_archive(archive.path());
        fs::create_dir_all(archive.path().join("45X45/ORION/MAT")).unwrap();

        let pipeline = Pipeline::new(config(|_| {}));
        let mut plan = pipeline.plan(scan(archive.path()));
        assert_eq!(plan.selection.superseded.len(), 1);
        assert_eq!(plan.selection.empty.len(), 1);

        let zeus = IdentityKey::parse("ZEUS_30X60_FLP").unwrap();
        plan.restrict_to(&BTreeSet::from([zeus.clone()]));

        assert_eq!(plan.product_count(), 1);
        assert!(plan.selection.winner(&zeus).is_some());
        assert!(plan.selection.superseded.is_empty());
        assert!(plan.selection.empty.is_empty());
    }

    #[test]
    fn test_product_directory_rejects_traversal() {
        let root = Path::new("/out");
        let ok = CanonicalIdentity {
            name: "ABACO".into(),
            size: "60X120".into(),
            surface: "MAT".into(),
        };
        assert_eq!(
            product_directory(root, &ok).unwrap(),
            PathBuf::from("/out/60X120/ABACO/MAT")
        );

        for size in ["..", ".", "a/b", ""] {
            let bad = CanonicalIdentity {
                size: size.into(),
                ..ok.clone()
            };
            assert!(product_directory(root, &bad).is_err(), "{size:?} accepted");
        }
    }
}
