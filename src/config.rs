use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::identity::is_valid_surface_code;
use crate::core::transcode::{ColorMode, TranscodeConstraints};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid setting: {message}")]
    Invalid { message: String },
}

/// A finish name and the abbreviation it canonicalizes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceEntry {
    pub name: String,
    pub code: String,
}

impl SurfaceEntry {
    fn new(name: &str, code: &str) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    /// Finish-abbreviation table. Order does not matter, lookups go longest-first.
    pub surfaces: Vec<SurfaceEntry>,
    /// Extra words stripped from product names besides the surface names and codes
    /// (slip-resistance and rectification codes, marketing finish names).
    pub name_noise: Vec<String>,
    /// Colour/material words that get split off when glued to a preceding word.
    pub colors: Vec<String>,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        let surfaces = vec![
            SurfaceEntry::new("FULL LAPPATO", "FLP"),
            SurfaceEntry::new("LAPPATO", "FLP"),
            SurfaceEntry::new("FLP", "FLP"),
            SurfaceEntry::new("SEMI LAPPATO", "SLP"),
            SurfaceEntry::new("SEMILAPPATO", "SLP"),
            SurfaceEntry::new("SLP", "SLP"),
            SurfaceEntry::new("SUGAR", "SGR"),
            SurfaceEntry::new("SGR", "SGR"),
            SurfaceEntry::new("RECTIFIED", "REC"),
            SurfaceEntry::new("REKTI", "REC"),
            SurfaceEntry::new("REC", "REC"),
            SurfaceEntry::new("MAT", "MAT"),
            SurfaceEntry::new("PARLAK", "PARLAK"),
            SurfaceEntry::new("PRK", "PARLAK"),
            SurfaceEntry::new("SOFT ANTISLIP", "ANTISLIP"),
            SurfaceEntry::new("ANTISLIP", "ANTISLIP"),
            SurfaceEntry::new("ASL", "ANTISLIP"),
            SurfaceEntry::new("DEKOR", "DEKOR"),
            SurfaceEntry::new("DEKAFON", "DEKOR"),
        ];

        let name_noise = ["SHINE EFFECT", "SAS", "ANTSLIP", "R9", "R10", "R11"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let colors = [
            "GREY",
            "GRAY",
            "BEIGE",
            "WHITE",
            "BLACK",
            "ANTHRACITE",
            "BROWN",
            "GOLD",
            "SILVER",
            "BLUE",
            "IVORY",
            "VIZON",
            "CREAM",
            "OAK",
            "BONE",
            "TAUPE",
            "MOKA",
            "NOCE",
            "SAND",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            surfaces,
            name_noise,
            colors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub max_bytes: u64,
    pub max_short_edge: u32,
    pub initial_quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
    pub color_mode: ColorMode,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            max_bytes: 3 * 1024 * 1024,
            max_short_edge: 1000,
            initial_quality: 95,
            min_quality: 60,
            quality_step: 5,
            color_mode: ColorMode::Normalize,
        }
    }
}

impl TranscodeConfig {
    pub fn constraints(&self) -> TranscodeConstraints {
        TranscodeConstraints {
            max_bytes: self.max_bytes,
            max_short_edge: self.max_short_edge,
            initial_quality: self.initial_quality,
            min_quality: self.min_quality,
            quality_step: self.quality_step,
            color_mode: self.color_mode,
        }
    }
}

/// What to do when a destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExistingPolicy {
    Overwrite,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// File extensions counted as eligible images, matched case-insensitively.
    pub extensions: Vec<String>,
    pub existing: ExistingPolicy,
    /// Worker threads; 0 means one per available core.
    pub jobs: usize,
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["jpg".to_string(), "jpeg".to_string()],
            existing: ExistingPolicy::Overwrite,
            jobs: 0,
            dry_run: false,
        }
    }
}

impl PipelineConfig {
    pub fn is_eligible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    pub fn worker_count(&self) -> usize {
        if self.jobs > 0 {
            return self.jobs;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Column layout of a catalog spreadsheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Worksheet name; the first sheet when unset.
    pub sheet: Option<String>,
    /// Zero-based index of the header row.
    pub header_row: usize,
    pub name_column: String,
    /// Consulted when the name cell is empty.
    pub fallback_name_column: Option<String>,
    pub size_column: String,
    pub surface_column: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            sheet: None,
            header_row: 1,
            name_column: "Ürün".to_string(),
            fallback_name_column: Some("Stok Adi".to_string()),
            size_column: "Ebat".to_string(),
            surface_column: "Yüzey Karakteri".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Similarity cutoff in 0.0..=1.0 for near-match suggestions; exact matching only when unset.
    pub fuzzy_cutoff: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vocabulary: VocabularyConfig,
    pub transcode: TranscodeConfig,
    pub pipeline: PipelineConfig,
    pub catalog: CatalogConfig,
    pub matching: MatchingConfig,
}

impl Config {
    /// Load from an explicit file, else the per-user config file if it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };

        let config = match path {
            Some(path) => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("catalogrs").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transcode;
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if t.max_bytes == 0 {
            return invalid("transcode.max_bytes must be greater than zero".into());
        }
        if t.max_short_edge == 0 {
            return invalid("transcode.max_short_edge must be greater than zero".into());
        }
        if t.quality_step == 0 {
            return invalid("transcode.quality_step must be greater than zero".into());
        }
        for (field, quality) in [("initial_quality", t.initial_quality), ("min_quality", t.min_quality)] {
            if !(1..=100).contains(&quality) {
                return invalid(format!("transcode.{field} must be within 1..=100, got {quality}"));
            }
        }
        if t.min_quality > t.initial_quality {
            return invalid(format!(
                "transcode.min_quality ({}) is above initial_quality ({})",
                t.min_quality, t.initial_quality
            ));
        }
        if let Some(cutoff) = self.matching.fuzzy_cutoff {
            if !(0.0..=1.0).contains(&cutoff) {
                return invalid(format!("matching.fuzzy_cutoff must be within 0.0..=1.0, got {cutoff}"));
            }
        }
        for entry in &self.vocabulary.surfaces {
            if !is_valid_surface_code(&entry.code) {
                return invalid(format!(
                    "vocabulary surface code {:?} (for {:?}) must be letters and digits only",
                    entry.code, entry.name
                ));
            }
        }
        if self.pipeline.extensions.is_empty() {
            return invalid("pipeline.extensions must list at least one extension".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transcode.max_short_edge, 1000);
        assert_eq!(config.pipeline.existing, ExistingPolicy::Overwrite);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[transcode]
max_short_edge = 1200
color_mode = "preserve"

[pipeline]
existing = "skip"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.transcode.max_short_edge, 1200);
        assert_eq!(config.transcode.color_mode, ColorMode::Preserve);
        assert_eq!(config.transcode.initial_quality, 95);
        assert_eq!(config.pipeline.existing, ExistingPolicy::Skip);
        assert!(!config.vocabulary.surfaces.is_empty());
    }

    #[test]
    fn test_rejects_floor_above_ceiling() {
        let mut config = Config::default();
        config.transcode.min_quality = 90;
        config.transcode.initial_quality = 80;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_zero_step() {
        let mut config = Config::default();
        config.transcode.quality_step = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extension_eligibility_is_case_insensitive() {
        let pipeline = PipelineConfig::default();
        assert!(pipeline.is_eligible(Path::new("a/b/photo.JPG")));
        assert!(pipeline.is_eligible(Path::new("photo.jpeg")));
        assert!(!pipeline.is_eligible(Path::new("photo.png")));
        assert!(!pipeline.is_eligible(Path::new("README")));

        let upper = PipelineConfig {
            extensions: vec!["JPG".into(), ".Png".into()],
            ..PipelineConfig::default()
        };
        assert!(upper.is_eligible(Path::new("photo.jpg")));
        assert!(upper.is_eligible(Path::new("scan.PNG")));
        assert!(!upper.is_eligible(Path::new("photo.jpeg")));
    }

    #[test]
    fn test_rejects_surface_code_with_separator() {
        let mut config = Config::default();
        config.vocabulary.surfaces.push(SurfaceEntry::new("SATIN", "SA_TIN"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { message }) if message.contains("SA_TIN")));

        config.vocabulary.surfaces.pop();
        config.vocabulary.surfaces.push(SurfaceEntry::new("Satin", "stn"));
        assert!(config.validate().is_ok());
    }
}
