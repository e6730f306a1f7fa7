use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    envelope::{AmplitudeDomain, EnvelopeCurve, build_fade_curve},
    error::SplicerError,
    ewf::{EWF_EXTENSION, VirtualFile, write_virtual_file},
};

/// Upper bound (exclusive) of the random start position picked inside the bed source.
pub const BED_JITTER_SECONDS: f64 = 40.0;
pub const BED_RAMP_SECONDS: f64 = 2.5;
pub const BED_SPAN_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderTrack {
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<f64>,
}

impl RenderTrack {
    #[must_use]
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            length: None,
        }
    }

    #[must_use]
    pub fn with_length(file: impl Into<PathBuf>, length: f64) -> Self {
        Self {
            file: file.into(),
            length: Some(length),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticBed {
    pub source: PathBuf,
    pub amplitude_pct: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShortTrackPolicy {
    /// Tracks shorter than the crossfade abort sequencing.
    #[default]
    Reject,
    /// Overlapping fade windows are passed to the engine unchanged.
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceOptions {
    pub crossfade: f64,
    pub static_bed: Option<StaticBed>,
    pub short_track_policy: ShortTrackPolicy,
}

impl SequenceOptions {
    #[must_use]
    pub fn new(crossfade: f64) -> Self {
        Self {
            crossfade,
            static_bed: None,
            short_track_policy: ShortTrackPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Window {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BedPlacement {
    pub clip: VirtualFile,
    pub curve: EnvelopeCurve,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Placement {
    pub index: usize,
    pub source: PathBuf,
    pub length: f64,
    /// Unclamped `position - crossfade / 2`; negative only for the first track.
    pub overlap_start: f64,
    pub clip: VirtualFile,
    pub fade_in: Window,
    pub fade_out: Window,
    pub curve: EnvelopeCurve,
    pub bed: Option<BedPlacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timeline {
    pub crossfade: f64,
    pub placements: Vec<Placement>,
    /// Running position after the last track.
    pub end_position: f64,
}

impl Timeline {
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.placements
            .iter()
            .map(|placement| placement.fade_out.end)
            .fold(0.0, f64::max)
    }
}

/// One engine chain of a render: its descriptor on disk and the gain curve to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSource {
    pub chain: String,
    pub descriptor: PathBuf,
    pub curve: EnvelopeCurve,
}

#[instrument(skip(tracks, options, rng), fields(tracks = tracks.len(), crossfade = options.crossfade))]
pub fn sequence(
    tracks: &[RenderTrack],
    options: &SequenceOptions,
    rng: &mut fastrand::Rng,
) -> Result<Timeline, SplicerError> {
    let crossfade = options.crossfade;
    if !crossfade.is_finite() || crossfade < 0.0 {
        return Err(SplicerError::configuration(format!(
            "crossfade must be non-negative, got {crossfade}"
        )));
    }
    if options.static_bed.is_some() && crossfade <= 0.0 {
        return Err(SplicerError::configuration(
            "a static bed needs a positive crossfade",
        ));
    }

    let half = crossfade / 2.0;
    let mut position = 0.0_f64;
    let mut placements = Vec::with_capacity(tracks.len());

    for (index, track) in tracks.iter().enumerate() {
        let length = track.length.ok_or_else(|| {
            SplicerError::configuration(format!(
                "track {} has no length; measure it first",
                track.file.display()
            ))
        })?;
        if !length.is_finite() || length <= 0.0 {
            return Err(SplicerError::configuration(format!(
                "track {} has invalid length {length}",
                track.file.display()
            )));
        }
        if length < crossfade {
            match options.short_track_policy {
                ShortTrackPolicy::Reject => {
                    return Err(SplicerError::configuration(format!(
                        "track {} ({length}s) is shorter than the {crossfade}s crossfade",
                        track.file.display()
                    )));
                }
                ShortTrackPolicy::Allow => warn!(
                    index,
                    length, crossfade, "track shorter than crossfade, fade windows overlap"
                ),
            }
        }

        let overlap_start = position - half;
        let offset = if overlap_start < 0.0 {
            position
        } else {
            overlap_start
        };

        let fade_in = Window {
            start: offset,
            end: offset + crossfade,
        };
        let fade_out_start = offset + (length - crossfade);
        let fade_out = Window {
            start: fade_out_start,
            end: fade_out_start + crossfade,
        };
        let curve = build_fade_curve(
            fade_in.start,
            fade_in.end,
            fade_out.start,
            fade_out.end,
            1.0,
            AmplitudeDomain::Unit,
        )?;
        let clip = VirtualFile::builder(&track.file).offset(offset).build()?;

        let bed = match &options.static_bed {
            Some(bed) => Some(place_bed(bed, fade_out, crossfade, rng)?),
            None => None,
        };

        debug!(index, offset, fade_out_start, "track placed");
        placements.push(Placement {
            index,
            source: track.file.clone(),
            length,
            overlap_start,
            clip,
            fade_in,
            fade_out,
            curve,
            bed,
        });

        position += length - half;
    }

    info!(
        placements = placements.len(),
        end_position = position,
        "timeline sequenced"
    );
    Ok(Timeline {
        crossfade,
        placements,
        end_position: position,
    })
}

fn place_bed(
    bed: &StaticBed,
    fade_out: Window,
    crossfade: f64,
    rng: &mut fastrand::Rng,
) -> Result<BedPlacement, SplicerError> {
    let jitter = rng.f64() * BED_JITTER_SECONDS;
    let clip = VirtualFile::builder(&bed.source)
        .offset(fade_out.start)
        .start_position(jitter)
        .length(crossfade)
        .looping(true)
        .build()?;
    let curve = build_fade_curve(
        fade_out.start,
        fade_out.start + BED_RAMP_SECONDS,
        fade_out.start + BED_SPAN_SECONDS - BED_RAMP_SECONDS,
        fade_out.start + BED_SPAN_SECONDS,
        bed.amplitude_pct,
        AmplitudeDomain::Percent,
    )?;
    Ok(BedPlacement { clip, curve })
}

/// Writes one descriptor per chain into `work_dir`, track before bed, in timeline order.
#[instrument(skip(timeline), fields(work_dir = %work_dir.display(), placements = timeline.placements.len()))]
pub fn write_descriptors(
    timeline: &Timeline,
    work_dir: &Path,
) -> Result<Vec<ChainSource>, SplicerError> {
    fs::create_dir_all(work_dir).with_context(|| {
        format!(
            "failed to create render work directory: {}",
            work_dir.display()
        )
    })?;

    let mut sources = Vec::new();
    for placement in &timeline.placements {
        let stem = placement
            .source
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("track");
        let descriptor = work_dir.join(format!(
            "{:03}-{stem}.{EWF_EXTENSION}",
            placement.index + 1
        ));
        write_virtual_file(&descriptor, &placement.clip)?;
        sources.push(ChainSource {
            chain: format!("track-{:03}", placement.index + 1),
            descriptor,
            curve: placement.curve.clone(),
        });

        if let Some(bed) = &placement.bed {
            let descriptor =
                work_dir.join(format!("{:03}-bed.{EWF_EXTENSION}", placement.index + 1));
            write_virtual_file(&descriptor, &bed.clip)?;
            sources.push(ChainSource {
                chain: format!("bed-{:03}", placement.index + 1),
                descriptor,
                curve: bed.curve.clone(),
            });
        }
    }

    debug!(chains = sources.len(), "render descriptors written");
    Ok(sources)
}
