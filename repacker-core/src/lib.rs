use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub mod codec;
pub mod container;
pub mod edits;
pub mod lzkn64;

pub use codec::{CodecKind, Lzkn64, SegmentCodec, Zlib};
pub use container::{Container, Placement, Repacked, SegmentInfo, MARKER};
pub use edits::EditManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepackSettings {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub edits_path: Option<PathBuf>,
    #[serde(default)]
    pub codec: CodecKind,
    /// Hex MD5 the input ROM must match before anything is touched.
    #[serde(default)]
    pub expected_md5: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum RepackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed container: {0}")]
    MalformedContainer(String),
    #[error("segment {id}: {len} bytes at offset 0x{offset:X} are outside its {size} bytes")]
    OutOfBounds {
        id: u32,
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("segment {id} does not exist (the table holds {count})")]
    NoSuchSegment { id: u32, count: usize },
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("repacked data would end at 0x{end:X}, past the limit of 0x{limit:X}")]
    ImageOverflow { end: usize, limit: usize },
    #[error("ROM checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("edit manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("edit manifest: invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, RepackError>;

/// Checks that `image` hashes to `expected` (hex MD5, any case).
pub fn verify_md5(image: &[u8], expected: &str) -> Result<()> {
    let actual = format!("{:x}", md5::compute(image));
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(RepackError::ChecksumMismatch {
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        })
    }
}

fn patch_image<C: SegmentCodec>(
    image: Vec<u8>,
    codec: C,
    manifest: &EditManifest,
) -> Result<Repacked> {
    let mut container = Container::with_codec(image, codec)?;
    let written = manifest.apply(&mut container)?;
    debug!(edits = manifest.len(), bytes = written, "applied edit manifest");
    container.repack()
}

/// Lists the segments of `image`. Nothing is decompressed, so the result
/// does not depend on the segment codec.
pub fn list_segments(image: Vec<u8>) -> Result<Vec<SegmentInfo>> {
    Ok(Container::open(image)?.segments())
}

/// Returns segment `id` of `image`, decompressed unless `raw` is set.
pub fn extract_segment(image: Vec<u8>, codec: CodecKind, id: u32, raw: bool) -> Result<Vec<u8>> {
    fn extract<C: SegmentCodec>(mut container: Container<C>, id: u32, raw: bool) -> Result<Vec<u8>> {
        if raw {
            Ok(container.compressed_segment(id)?.to_vec())
        } else {
            Ok(container.segment_mut(id)?.to_vec())
        }
    }

    match codec {
        CodecKind::Lzkn64 => extract(Container::with_codec(image, Lzkn64)?, id, raw),
        CodecKind::Zlib => extract(Container::with_codec(image, Zlib)?, id, raw),
    }
}

fn render_log(settings: &RepackSettings, manifest: &EditManifest, repacked: &Repacked) -> String {
    let mut log = String::new();

    log.push_str(&format!("input: {}\n", settings.input_path.display()));
    log.push_str(&format!("output: {}\n", settings.output_path.display()));
    log.push_str(&format!("codec: {}\n", settings.codec));
    log.push_str(&format!(
        "edits: {} across segments {:?}\n",
        manifest.len(),
        manifest.segment_ids().collect::<Vec<_>>()
    ));
    log.push_str("segments:\n");

    for p in &repacked.placements {
        let decompressed = match p.decompressed_len {
            Some(len) => format!("{} bytes", len),
            None => "untouched".to_string(),
        };
        log.push_str(&format!(
            "  {:4}: 0x{:06X}-0x{:06X} -> 0x{:06X}-0x{:06X} ({} bytes, decompressed: {})\n",
            p.id,
            p.old_start,
            p.old_end,
            p.start,
            p.end,
            p.end - p.start,
            decompressed,
        ));
    }

    log
}

fn log_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".log");
    PathBuf::from(name)
}

pub fn run(settings: RepackSettings) -> Result<()> {
    if !settings.input_path.is_file() {
        return Err(RepackError::Config(format!(
            "Input ROM does not exist: {}",
            settings.input_path.display()
        )));
    }

    let image = fs::read(&settings.input_path)?;

    if let Some(expected) = &settings.expected_md5 {
        verify_md5(&image, expected)?;
        info!("input ROM checksum verified");
    }

    let manifest = match &settings.edits_path {
        Some(path) => EditManifest::from_json(&fs::read_to_string(path)?)?,
        None => EditManifest::new(),
    };

    let repacked = match settings.codec {
        CodecKind::Lzkn64 => patch_image(image, Lzkn64, &manifest)?,
        CodecKind::Zlib => patch_image(image, Zlib, &manifest)?,
    };

    if let Some(parent) = settings.output_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&settings.output_path, &repacked.image)?;
    info!(
        output = %settings.output_path.display(),
        bytes = repacked.image.len(),
        "wrote patched ROM"
    );

    if settings.debug {
        let log = render_log(&settings, &manifest, &repacked);
        fs::write(log_path(&settings.output_path), log)?;
    }

    Ok(())
}
