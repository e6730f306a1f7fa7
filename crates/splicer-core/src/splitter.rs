use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    engine::{EngineClient, EngineCommand, PollPolicy},
    error::SplicerError,
};

pub const SPLIT_CHAINSETUP: &str = "split";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitOptions {
    pub output_dir: PathBuf,
    /// Input index selected in the engine before seeking.
    pub input_index: usize,
    /// Also extract the open-ended segment from the last marker to the end of the file.
    pub include_tail: bool,
}

impl SplitOptions {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            input_index: 1,
            include_tail: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    /// Index of the marker the segment starts at; marker 0 never starts a segment.
    pub number: usize,
    pub start: f64,
    pub end: Option<f64>,
    pub output: PathBuf,
}

impl Segment {
    #[must_use]
    pub fn length(&self) -> Option<f64> {
        self.end.map(|end| end - self.start)
    }
}

/// Segments between consecutive markers, skipping marker 0 (the session start).
pub fn plan_segments(
    file: &Path,
    markers: &[f64],
    options: &SplitOptions,
) -> Result<Vec<Segment>, SplicerError> {
    if let Some(bad) = markers.iter().find(|marker| !marker.is_finite() || **marker < 0.0) {
        return Err(SplicerError::configuration(format!(
            "marker {bad} is not a valid position"
        )));
    }
    if markers.windows(2).any(|pair| pair[1] <= pair[0]) {
        return Err(SplicerError::configuration(
            "markers must be strictly increasing",
        ));
    }

    let stem = file
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("segment");
    let output_for = |number: usize| options.output_dir.join(format!("{stem}-{number:02}.wav"));

    let mut segments: Vec<Segment> = (1..markers.len().saturating_sub(1))
        .map(|index| Segment {
            number: index,
            start: markers[index],
            end: Some(markers[index + 1]),
            output: output_for(index),
        })
        .collect();

    if options.include_tail && markers.len() >= 2 {
        let index = markers.len() - 1;
        segments.push(Segment {
            number: index,
            start: markers[index],
            end: None,
            output: output_for(index),
        });
    }

    Ok(segments)
}

#[must_use]
pub fn segment_commands(
    chainsetup: &str,
    file: &Path,
    segment: &Segment,
    input_index: usize,
) -> Vec<EngineCommand> {
    let mut commands = vec![
        EngineCommand::DisconnectChainsetup,
        EngineCommand::AddChainsetup(chainsetup.to_string()),
        EngineCommand::AddChain(SPLIT_CHAINSETUP.to_string()),
        EngineCommand::AddAudioInput(file.display().to_string()),
        EngineCommand::SelectInputIndex(input_index),
        EngineCommand::AddAudioOutput(segment.output.display().to_string()),
        EngineCommand::SetPosition(segment.start),
    ];
    if let Some(length) = segment.length() {
        commands.push(EngineCommand::SetLength(length));
    }
    commands
}

/// Extracts every planned segment in marker order, blocking on each until the engine stops.
#[instrument(skip(engine, markers, options, policy), fields(file = %file.display(), markers = markers.len()))]
pub fn split(
    engine: &mut EngineClient,
    file: &Path,
    markers: &[f64],
    options: &SplitOptions,
    policy: &PollPolicy,
) -> Result<Vec<Segment>, SplicerError> {
    let segments = plan_segments(file, markers, options)?;
    if segments.is_empty() {
        info!("fewer than three markers, nothing to split");
        return Ok(segments);
    }

    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!(
            "failed to create split output directory: {}",
            options.output_dir.display()
        )
    })?;

    for segment in &segments {
        let chainsetup = engine.next_chainsetup(SPLIT_CHAINSETUP);
        engine.run_all(&segment_commands(
            &chainsetup,
            file,
            segment,
            options.input_index,
        ))?;
        engine.execute(&EngineCommand::Start)?;
        engine.wait_until_stopped(policy)?;
        debug!(
            number = segment.number,
            start = segment.start,
            end = ?segment.end,
            "segment written"
        );
    }

    info!(segments = segments.len(), "split complete");
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_zero_never_starts_a_segment() {
        let segments = plan_segments(
            Path::new("show.wav"),
            &[0.0, 10.0, 25.0, 40.0],
            &SplitOptions::new("out"),
        )
        .expect("markers are valid");

        let bounds: Vec<(f64, Option<f64>)> = segments
            .iter()
            .map(|segment| (segment.start, segment.end))
            .collect();
        assert_eq!(bounds, vec![(10.0, Some(25.0)), (25.0, Some(40.0))]);
        assert_eq!(segments[0].output, Path::new("out").join("show-01.wav"));
        assert_eq!(segments[1].number, 2);
    }

    #[test]
    fn tail_segment_runs_to_end_of_file() {
        let mut options = SplitOptions::new("out");
        options.include_tail = true;
        let segments = plan_segments(Path::new("show.wav"), &[0.0, 10.0, 25.0], &options)
            .expect("markers are valid");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start, 25.0);
        assert_eq!(segments[1].length(), None);

        let commands = segment_commands("split-1", Path::new("show.wav"), &segments[1], 1);
        assert!(
            !commands
                .iter()
                .any(|command| matches!(command, EngineCommand::SetLength(_)))
        );
    }

    #[test]
    fn bounded_segments_set_their_length() {
        let segments = plan_segments(
            Path::new("show.wav"),
            &[0.0, 10.0, 25.0],
            &SplitOptions::new("out"),
        )
        .expect("markers are valid");
        let commands = segment_commands("split-1", Path::new("show.wav"), &segments[0], 2);
        assert_eq!(commands[1], EngineCommand::AddChainsetup("split-1".to_string()));
        assert_eq!(commands[4], EngineCommand::SelectInputIndex(2));
        assert_eq!(commands[6], EngineCommand::SetPosition(10.0));
        assert_eq!(commands[7], EngineCommand::SetLength(15.0));
    }

    #[test]
    fn unordered_markers_are_rejected() {
        assert!(
            plan_segments(
                Path::new("show.wav"),
                &[0.0, 20.0, 10.0],
                &SplitOptions::new("out")
            )
            .is_err()
        );
    }

    #[test]
    fn too_few_markers_yield_nothing() {
        let segments = plan_segments(Path::new("show.wav"), &[0.0, 5.0], &SplitOptions::new("o"))
            .expect("markers are valid");
        assert!(segments.is_empty());
    }
}
