use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageEncoder, ImageError, ImageReader};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures that leave no usable file at the destination.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl TranscodeError {
    fn read(path: &Path, source: io::Error) -> Self {
        Self::Read {
            path: path.display().to_string(),
            source,
        }
    }

    fn write(path: &Path, source: io::Error) -> Self {
        Self::Write {
            path: path.display().to_string(),
            source,
        }
    }
}

/// How colour is handled when an image has to be re-encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Convert to 8-bit RGB and drop any embedded ICC profile.
    #[default]
    Normalize,
    /// Keep grayscale as grayscale and re-attach the source ICC profile.
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeConstraints {
    pub max_bytes: u64,
    pub max_short_edge: u32,
    pub initial_quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
    pub color_mode: ColorMode,
}

/// Details of a re-encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodeReport {
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub resized: bool,
    /// Every quality tried, in order. Never increasing.
    pub qualities: Vec<u8>,
    pub bytes: u64,
    /// False when even the floor quality stayed at or above `max_bytes`.
    pub within_budget: bool,
    pub icc_profile_attached: bool,
}

impl EncodeReport {
    pub fn final_quality(&self) -> Option<u8> {
        self.qualities.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscodeOutcome {
    /// Already within budget; the source bytes were copied unchanged.
    Copied { path: PathBuf, bytes: u64 },
    /// Re-encoded as JPEG.
    Written { path: PathBuf, report: EncodeReport },
    /// Decoding or encoding failed; the source bytes were copied unchanged.
    FallbackCopied {
        path: PathBuf,
        bytes: u64,
        reason: String,
    },
}

impl TranscodeOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Copied { path, .. } | Self::Written { path, .. } | Self::FallbackCopied { path, .. } => {
                path
            }
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::FallbackCopied { .. })
    }
}

/// Produces one output image per source that fits a byte and short-edge budget.
///
/// The destination is only ever replaced by a rename from a temporary file in
/// the same directory, so an interrupted run never leaves a partial file at
/// the final path.
#[derive(Debug, Clone)]
pub struct ImageTranscoder {
    constraints: TranscodeConstraints,
}

impl ImageTranscoder {
    pub fn new(constraints: TranscodeConstraints) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &TranscodeConstraints {
        &self.constraints
    }

    pub fn transcode(&self, source: &Path, destination: &Path) -> Result<TranscodeOutcome, TranscodeError> {
        let source_bytes = fs::metadata(source)
            .map_err(|e| TranscodeError::read(source, e))?
            .len();

        let reader = ImageReader::open(source)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| TranscodeError::read(source, e))?;

        let mut decoder = match reader.into_decoder() {
            Ok(decoder) => decoder,
            Err(e) => return self.fallback_copy(source, destination, e),
        };

        let (width, height) = decoder.dimensions();
        let short_edge = width.min(height);

        if short_edge <= self.constraints.max_short_edge && source_bytes < self.constraints.max_bytes {
            let bytes = copy_atomic(source, destination)?;
            tracing::debug!("Within budget, copied {} unchanged", source.display());
            return Ok(TranscodeOutcome::Copied {
                path: destination.to_path_buf(),
                bytes,
            });
        }

        let icc_profile = match decoder.icc_profile() {
            Ok(profile) => profile,
            Err(e) => {
                tracing::debug!("Ignoring unreadable ICC profile in {}: {}", source.display(), e);
                None
            }
        };

        let mut image = match DynamicImage::from_decoder(decoder) {
            Ok(image) => image,
            Err(e) => return self.fallback_copy(source, destination, e),
        };

        let resized = match scaled_dimensions(width, height, self.constraints.max_short_edge) {
            Some((new_width, new_height)) => {
                image = image.resize_exact(new_width, new_height, FilterType::Lanczos3);
                true
            }
            None => false,
        };

        let (image, icc_profile) = self.prepare_color(image, icc_profile, source);

        let (encoded, qualities, within_budget) = match self.compress(&image, icc_profile.as_deref()) {
            Ok(result) => result,
            Err(e) => return self.fallback_copy(source, destination, e),
        };

        if !within_budget {
            tracing::warn!(
                "{} still {} bytes at floor quality {} (budget {})",
                source.display(),
                encoded.len(),
                self.constraints.min_quality,
                self.constraints.max_bytes
            );
        }

        let path = jpeg_destination(destination);
        write_atomic(&path, &encoded)?;

        Ok(TranscodeOutcome::Written {
            path,
            report: EncodeReport {
                source_width: width,
                source_height: height,
                width: image.width(),
                height: image.height(),
                resized,
                qualities,
                bytes: encoded.len() as u64,
                within_budget,
                icc_profile_attached: icc_profile.is_some(),
            },
        })
    }

    /// Encodes at falling quality until the output is under `max_bytes` or
    /// the next step would go below the floor.
    fn compress(&self, image: &DynamicImage, icc_profile: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>, bool), ImageError> {
        let c = &self.constraints;
        let mut quality = c.initial_quality;
        let mut qualities = Vec::new();

        loop {
            let encoded = encode_jpeg(image, quality, icc_profile)?;
            qualities.push(quality);

            if (encoded.len() as u64) < c.max_bytes {
                return Ok((encoded, qualities, true));
            }

            match quality.checked_sub(c.quality_step) {
                Some(next) if next >= c.min_quality && c.quality_step > 0 => quality = next,
                _ => return Ok((encoded, qualities, false)),
            }
        }
    }

    fn prepare_color(
        &self,
        image: DynamicImage,
        icc_profile: Option<Vec<u8>>,
        source: &Path,
    ) -> (DynamicImage, Option<Vec<u8>>) {
        match self.constraints.color_mode {
            ColorMode::Normalize => {
                let image = match image {
                    DynamicImage::ImageRgb8(_) => image,
                    other => DynamicImage::ImageRgb8(other.to_rgb8()),
                };
                (image, None)
            }
            ColorMode::Preserve => {
                // JPEG carries neither alpha nor 16-bit samples.
                let image = match image {
                    DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => image,
                    other if other.color().has_color() => DynamicImage::ImageRgb8(other.to_rgb8()),
                    other => DynamicImage::ImageLuma8(other.to_luma8()),
                };

                let expected: &[u8; 4] = if image.color().has_color() { b"RGB " } else { b"GRAY" };
                let profile = icc_profile.filter(|profile| {
                    let matches = icc_color_space(profile) == Some(expected);
                    if !matches {
                        tracing::warn!(
                            "Dropping ICC profile of {}: profile colour space does not match decoded pixels",
                            source.display()
                        );
                    }
                    matches
                });
                (image, profile)
            }
        }
    }

    fn fallback_copy(
        &self,
        source: &Path,
        destination: &Path,
        cause: ImageError,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        tracing::warn!("Could not process {}, copying original: {}", source.display(), cause);
        let bytes = copy_atomic(source, destination)?;
        Ok(TranscodeOutcome::FallbackCopied {
            path: destination.to_path_buf(),
            bytes,
            reason: cause.to_string(),
        })
    }
}

/// New (width, height) with the short edge at `max_short_edge`, or `None`
/// when the short edge already fits.
pub fn scaled_dimensions(width: u32, height: u32, max_short_edge: u32) -> Option<(u32, u32)> {
    let short_edge = width.min(height);
    if short_edge <= max_short_edge {
        return None;
    }

    let ratio = max_short_edge as f64 / short_edge as f64;
    let scale = |edge: u32| ((edge as f64 * ratio).round() as u32).max(1);

    if width <= height {
        Some((max_short_edge, scale(height)))
    } else {
        Some((scale(width), max_short_edge))
    }
}

/// Data colour space signature from an ICC profile header (bytes 16..20).
fn icc_color_space(profile: &[u8]) -> Option<&[u8; 4]> {
    profile.get(16..20)?.try_into().ok()
}

fn encode_jpeg(image: &DynamicImage, quality: u8, icc_profile: Option<&[u8]>) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    if let Some(profile) = icc_profile {
        encoder
            .set_icc_profile(profile.to_vec())
            .map_err(ImageError::Unsupported)?;
    }
    image.write_with_encoder(encoder)?;
    Ok(buffer)
}

/// Where a re-encode of `destination` lands: the same path when it already has a
/// JPEG extension, otherwise with `.jpg`.
pub fn jpeg_destination(destination: &Path) -> PathBuf {
    let is_jpeg = destination
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
    if is_jpeg {
        destination.to_path_buf()
    } else {
        destination.with_extension("jpg")
    }
}

fn temp_file_beside(destination: &Path) -> Result<tempfile::NamedTempFile, TranscodeError> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new()
        .prefix(".catalogrs-")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| TranscodeError::write(destination, e))
}

fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<(), TranscodeError> {
    let mut temp = temp_file_beside(destination)?;
    temp.write_all(bytes)
        .map_err(|e| TranscodeError::write(destination, e))?;
    temp.persist(destination)
        .map_err(|e| TranscodeError::write(destination, e.error))?;
    Ok(())
}

fn copy_atomic(source: &Path, destination: &Path) -> Result<u64, TranscodeError> {
    let mut input = File::open(source).map_err(|e| TranscodeError::read(source, e))?;
    let mut temp = temp_file_beside(destination)?;
    let bytes = io::copy(&mut input, temp.as_file_mut())
        .map_err(|e| TranscodeError::write(destination, e))?;
    temp.persist(destination)
        .map_err(|e| TranscodeError::write(destination, e.error))?;
    Ok(bytes)
}
