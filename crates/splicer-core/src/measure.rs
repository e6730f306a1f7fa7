use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::{
    assets::LengthCache,
    emitter::NULL_SINK,
    engine::{EngineClient, EngineCommand, PollPolicy},
    error::SplicerError,
    sequencer::RenderTrack,
};

pub const MEASURE_CHAINSETUP: &str = "measure";

fn chain_name(index: usize) -> String {
    format!("measure-{:03}", index + 1)
}

/// Setup that plays every file into the null sink, one chain per file.
#[must_use]
pub fn measurement_commands(chainsetup: &str, files: &[PathBuf]) -> Vec<EngineCommand> {
    let mut commands = vec![
        EngineCommand::DisconnectChainsetup,
        EngineCommand::AddChainsetup(chainsetup.to_string()),
    ];
    for (index, file) in files.iter().enumerate() {
        commands.extend([
            EngineCommand::AddChain(chain_name(index)),
            EngineCommand::AddAudioInput(file.display().to_string()),
            EngineCommand::AddAudioOutput(NULL_SINK.to_string()),
        ]);
    }
    commands
}

/// Durations in seconds, in input order. Any file the engine cannot report a positive length
/// for fails the whole pass.
#[instrument(skip(engine, files, policy), fields(files = files.len()))]
pub fn measure(
    engine: &mut EngineClient,
    files: &[PathBuf],
    policy: &PollPolicy,
) -> Result<Vec<f64>, SplicerError> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let chainsetup = engine.next_chainsetup(MEASURE_CHAINSETUP);
    engine.run_all(&measurement_commands(&chainsetup, files))?;
    engine.execute(&EngineCommand::Start)?;
    engine.wait_until_stopped(policy)?;

    let mut lengths = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let length = query_length(engine, index, file)?;
        if !length.is_finite() || length <= 0.0 {
            return Err(SplicerError::Measurement {
                path: file.clone(),
                reason: format!("engine reported length {length}"),
            });
        }
        debug!(path = %file.display(), length, "file measured");
        lengths.push(length);
    }

    info!(measured = lengths.len(), "measurement pass complete");
    Ok(lengths)
}

fn query_length(
    engine: &mut EngineClient,
    index: usize,
    file: &Path,
) -> Result<f64, SplicerError> {
    let as_measurement = |error: SplicerError| match error {
        SplicerError::EngineRejected { command, message } => SplicerError::Measurement {
            path: file.to_path_buf(),
            reason: format!("`{command}` failed: {message}"),
        },
        other => other,
    };

    engine
        .execute(&EngineCommand::SelectChain(chain_name(index)))
        .map_err(as_measurement)?;
    engine
        .execute(&EngineCommand::SelectAudioInput(file.display().to_string()))
        .map_err(as_measurement)?;
    engine.input_length().map_err(as_measurement)
}

/// Fills in every missing track length, consulting and updating `cache` when given.
/// Lengths already present are never re-measured.
#[instrument(skip(engine, tracks, policy, cache), fields(tracks = tracks.len()))]
pub fn fill_lengths(
    engine: &mut EngineClient,
    tracks: &mut [RenderTrack],
    policy: &PollPolicy,
    mut cache: Option<&mut LengthCache>,
) -> Result<usize, SplicerError> {
    if let Some(cache) = cache.as_deref() {
        for track in tracks.iter_mut().filter(|track| track.length.is_none()) {
            match cache.get(&track.file) {
                Ok(Some(length)) => track.length = Some(length),
                Ok(None) => {}
                Err(error) => warn!(path = %track.file.display(), %error, "length cache lookup failed"),
            }
        }
    }

    let missing: Vec<usize> = tracks
        .iter()
        .enumerate()
        .filter(|(_, track)| track.length.is_none())
        .map(|(index, _)| index)
        .collect();
    if missing.is_empty() {
        debug!("all lengths known, skipping measurement");
        return Ok(0);
    }

    let files: Vec<PathBuf> = missing
        .iter()
        .map(|&index| tracks[index].file.clone())
        .collect();
    let lengths = measure(engine, &files, policy)?;

    for (&index, length) in missing.iter().zip(lengths) {
        tracks[index].length = Some(length);
        if let Some(cache) = cache.as_deref_mut()
            && let Err(error) = cache.insert(&tracks[index].file, length)
        {
            warn!(path = %tracks[index].file.display(), %error, "length cache update failed");
        }
    }
    if let Some(cache) = cache {
        cache.save()?;
    }

    Ok(missing.len())
}
