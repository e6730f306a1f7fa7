use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use symphonia::core::{
    codecs::DecoderOptions, errors::Error as SymphoniaError, formats::FormatOptions,
    io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::{persistence::write_atomic, sequencer::RenderTrack};

/// Audio files under `directory`, sorted by path, as unmeasured render tracks.
#[instrument(fields(directory = %directory.display()))]
pub fn scan_audio_files(directory: &Path) -> Result<Vec<RenderTrack>> {
    if !directory.is_dir() {
        return Err(anyhow::anyhow!(
            "audio source path is not a directory: {}",
            directory.display()
        ));
    }

    let extensions = supported_audio_extensions();
    let mut files = Vec::new();

    for entry in WalkDir::new(directory).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(?error, "ignoring unreadable entry while scanning audio files");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let extension = entry
            .path()
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase);
        let Some(extension) = extension else {
            continue;
        };
        if extensions.contains(extension.as_str()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    debug!(count = files.len(), "audio scan complete");
    Ok(files.into_iter().map(RenderTrack::new).collect())
}

/// Duration in seconds read locally, without the engine. Uses the container's frame count when
/// present and falls back to decoding the whole stream.
#[allow(clippy::cast_precision_loss)]
#[instrument(fields(path = %path.display()))]
pub fn probe_duration(path: &Path) -> Result<f64> {
    let file = File::open(path)
        .with_context(|| format!("failed to open audio file: {}", path.display()))?;
    let source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|value| value.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default audio track found in {}", path.display()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow::anyhow!("unknown sample rate in {}", path.display()))?;

    if let Some(frames) = track.codec_params.n_frames {
        let duration = frames as f64 / f64::from(sample_rate);
        debug!(frames, sample_rate, duration, "duration from container");
        return Ok(duration);
    }

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;
    let mut frames = 0_u64;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(error)) if error.kind() == ErrorKind::UnexpectedEof => {
                break;
            }
            Err(error) => return Err(error.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => frames += decoded.frames() as u64,
            Err(SymphoniaError::DecodeError(_)) => {}
            Err(error) => return Err(error.into()),
        }
    }

    if frames == 0 {
        return Err(anyhow::anyhow!("decoded zero frames from {}", path.display()));
    }

    let duration = frames as f64 / f64::from(sample_rate);
    debug!(frames, sample_rate, duration, "duration from decode");
    Ok(duration)
}

/// Fills missing lengths by local probing.
pub fn probe_lengths(tracks: &mut [RenderTrack]) -> Result<usize> {
    let mut probed = 0;
    for track in tracks.iter_mut().filter(|track| track.length.is_none()) {
        track.length = Some(probe_duration(&track.file)?);
        probed += 1;
    }
    Ok(probed)
}

/// Measured lengths keyed by a hash of path, size and modification time, so an edited file
/// is measured again.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LengthCache {
    #[serde(skip)]
    path: PathBuf,
    entries: BTreeMap<String, f64>,
}

impl LengthCache {
    /// Opens the cache at `path`; a missing or unreadable file starts an empty cache.
    #[instrument(fields(path = %path.display()))]
    pub fn open(path: &Path) -> Self {
        let entries = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Self>(&bytes) {
                Ok(cache) => cache.entries,
                Err(error) => {
                    warn!(?error, "length cache parse failed, starting empty");
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                warn!(?error, "length cache read failed, starting empty");
                BTreeMap::new()
            }
        };
        debug!(entries = entries.len(), "length cache opened");
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn get(&self, file: &Path) -> Result<Option<f64>> {
        let key = asset_hash(file)?;
        Ok(self.entries.get(&key).copied())
    }

    pub fn insert(&mut self, file: &Path, length: f64) -> Result<()> {
        let key = asset_hash(file)?;
        self.entries.insert(key, length);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("failed to encode length cache")?;
        write_atomic(&self.path, &json)
            .with_context(|| format!("failed to save length cache: {}", self.path.display()))
    }
}

fn asset_hash(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize asset path: {}", path.display()))?;
    let metadata = fs::metadata(&canonical)
        .with_context(|| format!("failed to inspect asset metadata: {}", canonical.display()))?;
    let modified_seconds = metadata
        .modified()
        .ok()
        .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |value| value.as_secs());

    let payload = format!(
        "{}:{}:{}",
        canonical.display(),
        metadata.len(),
        modified_seconds
    );
    let digest = Sha256::digest(payload.as_bytes());
    Ok(format!("{digest:x}"))
}

fn supported_audio_extensions() -> BTreeSet<&'static str> {
    [
        "wav", "flac", "mp3", "ogg", "m4a", "aiff", "aif", "caf", "mkv",
    ]
    .into_iter()
    .collect()
}
