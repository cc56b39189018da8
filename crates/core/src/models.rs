//! Scale-keyed model catalog and weight resolver.
//!
//! One weight file per supported scale factor, fetched on first use and
//! cached under the weights directory. Presence alone is the cache key:
//! there is no manifest and pre-existing files are not re-verified.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::EnhanceError;

/// Supported upscaling factors. Anything else is rejected before model
/// resolution ever happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleFactor {
    X2,
    X4,
    X8,
}

impl ScaleFactor {
    pub const ALL: [ScaleFactor; 3] = [ScaleFactor::X2, ScaleFactor::X4, ScaleFactor::X8];

    pub fn factor(self) -> u32 {
        match self {
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
        }
    }
}

impl TryFrom<u32> for ScaleFactor {
    type Error = EnhanceError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::X2),
            4 => Ok(Self::X4),
            8 => Ok(Self::X8),
            other => Err(EnhanceError::UnsupportedScale(other)),
        }
    }
}

impl std::fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x", self.factor())
    }
}

/// Network family behind a given scale. Selected at construction time; the
/// ONNX graph encodes the architecture, this tag only drives catalog
/// bookkeeping and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchKind {
    /// Residual-in-residual dense-block network (RRDB family, 2x/4x).
    DenseResidual,
    /// Compact sequential-convolution network (SRVGG family, 8x).
    CompactSequential,
}

impl ArchKind {
    pub fn for_scale(scale: ScaleFactor) -> Self {
        match scale {
            ScaleFactor::X2 | ScaleFactor::X4 => Self::DenseResidual,
            ScaleFactor::X8 => Self::CompactSequential,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub scale: ScaleFactor,
    pub arch: ArchKind,
    pub filename: &'static str,
    pub url: &'static str,
    /// No upstream release publishes hashes for these weights, so every
    /// entry is `None` and downloads are not verified. The slot stays so a
    /// hash can be pinned without touching the download path.
    pub sha256: Option<&'static str>,
}

static CATALOG: [ModelSpec; 3] = [
    ModelSpec {
        scale: ScaleFactor::X2,
        arch: ArchKind::DenseResidual,
        filename: "RealESRGAN_x2plus.onnx",
        url: "https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x2plus.onnx",
        sha256: None,
    },
    ModelSpec {
        scale: ScaleFactor::X4,
        arch: ArchKind::DenseResidual,
        filename: "RealESRGAN_x4plus.onnx",
        url: "https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus.onnx",
        sha256: None,
    },
    ModelSpec {
        scale: ScaleFactor::X8,
        arch: ArchKind::CompactSequential,
        filename: "RealESRGAN_x8.onnx",
        url: "https://huggingface.co/ai-forever/Real-ESRGAN/resolve/main/RealESRGAN_x8.onnx",
        sha256: None,
    },
];

pub fn spec_for(scale: ScaleFactor) -> &'static ModelSpec {
    CATALOG
        .iter()
        .find(|spec| spec.scale == scale)
        .expect("catalog covers every ScaleFactor variant")
}

pub fn catalog() -> &'static [ModelSpec] {
    &CATALOG
}

/// Maps a scale factor to a local weight file, downloading on first use.
///
/// Concurrent first-requests for the same uncached scale may both download;
/// the `.part` temp file plus atomic rename keeps that race benign
/// (last-write-wins, both writers produce identical bytes).
pub struct ModelResolver {
    weights_dir: PathBuf,
    resolve_calls: AtomicU64,
    downloads: AtomicU64,
}

impl ModelResolver {
    pub fn new(weights_dir: PathBuf) -> Self {
        Self {
            weights_dir,
            resolve_calls: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
        }
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    /// Number of `resolve` invocations since construction. Lets tests prove
    /// that rejected requests never reached model resolution.
    pub fn resolve_calls(&self) -> u64 {
        self.resolve_calls.load(Ordering::Relaxed)
    }

    /// Number of downloads actually performed (cache misses).
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn local_path(&self, scale: ScaleFactor) -> PathBuf {
        self.weights_dir.join(spec_for(scale).filename)
    }

    pub fn is_cached(&self, scale: ScaleFactor) -> bool {
        self.local_path(scale).is_file()
    }

    /// Ensure the weight file for `scale` exists locally and return its
    /// path. Blocking: performs network I/O on a cache miss, so callers on
    /// an async runtime must offload this.
    pub fn resolve(&self, scale: ScaleFactor) -> std::result::Result<PathBuf, EnhanceError> {
        self.resolve_calls.fetch_add(1, Ordering::Relaxed);

        let spec = spec_for(scale);
        let final_path = self.weights_dir.join(spec.filename);

        if final_path.is_file() {
            return Ok(final_path);
        }

        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.download(spec)
            .map_err(|err| EnhanceError::ModelFetch(format!("{err:#}")))
    }

    fn download(&self, spec: &ModelSpec) -> Result<PathBuf> {
        fs::create_dir_all(&self.weights_dir).with_context(|| {
            format!(
                "failed to create weights directory: {}",
                self.weights_dir.display()
            )
        })?;

        let final_path = self.weights_dir.join(spec.filename);
        let tmp_path = self.weights_dir.join(format!("{}.part", spec.filename));

        info!(scale = %spec.scale, url = %spec.url, "Downloading model weights");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("failed to build HTTP client for weight download")?;

        let mut response = client
            .get(spec.url)
            .send()
            .with_context(|| format!("failed to start download for {}", spec.scale))?;

        if !response.status().is_success() {
            let _ = fs::remove_file(&tmp_path);
            bail!(
                "download for {} returned HTTP {}",
                spec.scale,
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

        if let Err(err) = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("failed while downloading {} from {}", spec.scale, spec.url))
        {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = tmp_file
            .sync_all()
            .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = spec.sha256 {
            info!(scale = %spec.scale, "Verifying SHA256 hash");
            let actual_hash = sha256_file(&tmp_path)?;
            if actual_hash != expected_hash {
                let _ = fs::remove_file(&tmp_path);
                bail!(
                    "SHA256 mismatch for {}: expected {expected_hash}, got {actual_hash}",
                    spec.scale
                );
            }
        } else {
            warn!(scale = %spec.scale, "No SHA256 hash pinned for this model — skipping verification");
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to move {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(scale = %spec.scale, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scale_factor_accepts_supported_values() {
        assert_eq!(ScaleFactor::try_from(2).unwrap(), ScaleFactor::X2);
        assert_eq!(ScaleFactor::try_from(4).unwrap(), ScaleFactor::X4);
        assert_eq!(ScaleFactor::try_from(8).unwrap(), ScaleFactor::X8);
    }

    #[test]
    fn scale_factor_rejects_everything_else() {
        for value in [0u32, 1, 3, 5, 6, 7, 9, 16, 100] {
            let err = ScaleFactor::try_from(value).unwrap_err();
            assert!(matches!(err, EnhanceError::UnsupportedScale(v) if v == value));
        }
    }

    #[test]
    fn scale_factor_display() {
        assert_eq!(ScaleFactor::X2.to_string(), "2x");
        assert_eq!(ScaleFactor::X8.to_string(), "8x");
    }

    #[test]
    fn arch_selection_by_scale() {
        assert_eq!(
            ArchKind::for_scale(ScaleFactor::X2),
            ArchKind::DenseResidual
        );
        assert_eq!(
            ArchKind::for_scale(ScaleFactor::X4),
            ArchKind::DenseResidual
        );
        assert_eq!(
            ArchKind::for_scale(ScaleFactor::X8),
            ArchKind::CompactSequential
        );
    }

    #[test]
    fn catalog_covers_all_scales_with_matching_arch() {
        assert_eq!(catalog().len(), 3);
        for scale in ScaleFactor::ALL {
            let spec = spec_for(scale);
            assert_eq!(spec.scale, scale);
            assert_eq!(spec.arch, ArchKind::for_scale(scale));
            assert!(spec.filename.ends_with(".onnx"));
            assert!(spec.url.starts_with("https://"));
            assert!(spec.sha256.is_none(), "no hash should be invented");
        }
    }

    #[test]
    fn resolver_counts_start_at_zero() {
        let dir = TempDir::new().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf());
        assert_eq!(resolver.resolve_calls(), 0);
        assert_eq!(resolver.downloads(), 0);
    }

    #[test]
    fn cached_weight_file_resolves_without_download() {
        let dir = TempDir::new().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf());

        let path = resolver.local_path(ScaleFactor::X4);
        fs::write(&path, b"fake weights").unwrap();
        assert!(resolver.is_cached(ScaleFactor::X4));

        let resolved = resolver.resolve(ScaleFactor::X4).unwrap();
        assert_eq!(resolved, path);
        assert_eq!(resolver.resolve_calls(), 1);
        assert_eq!(resolver.downloads(), 0, "cache hit must not download");
    }

    #[test]
    fn local_path_is_deterministic_per_scale() {
        let dir = TempDir::new().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf());
        assert_eq!(
            resolver.local_path(ScaleFactor::X2),
            dir.path().join("RealESRGAN_x2plus.onnx")
        );
        assert_eq!(
            resolver.local_path(ScaleFactor::X8),
            dir.path().join("RealESRGAN_x8.onnx")
        );
    }

    #[test]
    fn sha256_file_hashes_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testfile.bin");
        fs::write(&path, b"hello world").unwrap();
        let hash = sha256_file(&path).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn download_failure_reports_model_fetch_without_litter() {
        let dir = TempDir::new().unwrap();
        // A file where the weights directory should be makes directory
        // creation fail before any network traffic.
        let blocked = dir.path().join("weights");
        fs::write(&blocked, b"not a directory").unwrap();

        let resolver = ModelResolver::new(blocked.clone());
        let err = resolver.resolve(ScaleFactor::X2).unwrap_err();
        assert!(matches!(err, EnhanceError::ModelFetch(_)));
        assert_eq!(resolver.resolve_calls(), 1);
        assert_eq!(resolver.downloads(), 1);

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "no .part litter may remain");
    }

    #[test]
    #[ignore]
    fn download_real_weights() {
        let dir = TempDir::new().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf());
        let path = resolver.resolve(ScaleFactor::X4).unwrap();
        assert!(path.is_file());
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.len() > 1_000_000, "downloaded file is too small");
    }
}
