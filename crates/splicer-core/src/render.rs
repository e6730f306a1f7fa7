use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    assets::LengthCache,
    config::RenderConfig,
    context::AppContext,
    emitter,
    engine::{EngineClient, EngineCommand, PollPolicy},
    error::SplicerError,
    measure,
    sequencer::{self, ChainSource, RenderTrack, SequenceOptions, Timeline},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderRequest {
    pub tracks: Vec<RenderTrack>,
    pub output: PathBuf,
    pub options: SequenceOptions,
    pub work_dir: PathBuf,
    /// Seeds the bed jitter; unseeded renders differ run to run.
    pub seed: Option<u64>,
    pub length_cache: Option<PathBuf>,
}

impl RenderRequest {
    /// A request for `tracks` using the render defaults from `config`.
    #[must_use]
    pub fn from_config(tracks: Vec<RenderTrack>, output: PathBuf, config: &RenderConfig) -> Self {
        Self {
            tracks,
            output,
            options: config.sequence_options(),
            work_dir: config.work_dir.clone(),
            seed: None,
            length_cache: config.length_cache.clone(),
        }
    }

    fn rng(&self) -> fastrand::Rng {
        self.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderReport {
    pub timeline: Timeline,
    pub chains: Vec<ChainSource>,
    pub commands: Vec<EngineCommand>,
    pub output: PathBuf,
}

/// Sequences already-measured tracks and writes their descriptors without touching the engine.
/// The planned commands add the chainsetup as plain `render`.
pub fn plan_render(
    request: &RenderRequest,
    render: &RenderConfig,
) -> Result<RenderReport, SplicerError> {
    plan_render_as(emitter::RENDER_CHAINSETUP, request, render)
}

#[instrument(skip(request, render), fields(tracks = request.tracks.len(), output = %request.output.display()))]
fn plan_render_as(
    chainsetup: &str,
    request: &RenderRequest,
    render: &RenderConfig,
) -> Result<RenderReport, SplicerError> {
    let timeline = sequencer::sequence(&request.tracks, &request.options, &mut request.rng())?;
    let chains = sequencer::write_descriptors(&timeline, &request.work_dir)?;
    let commands = emitter::render_commands(chainsetup, &chains, &request.output, render);
    Ok(RenderReport {
        timeline,
        chains,
        commands,
        output: request.output.clone(),
    })
}

/// Measures, sequences and mixes `request` into its output file, blocking until the engine
/// finishes.
#[instrument(skip(context, request), fields(tracks = request.tracks.len(), output = %request.output.display()))]
pub fn render(
    context: &AppContext,
    mut request: RenderRequest,
) -> Result<RenderReport, SplicerError> {
    let policy = context.poll_policy();
    let render = &context.config().render;

    context.with_engine(|engine| {
        let mut cache = request.length_cache.as_deref().map(LengthCache::open);
        let measured =
            measure::fill_lengths(engine, &mut request.tracks, &policy, cache.as_mut())?;
        info!(measured, "track lengths ready");

        let chainsetup = engine.next_chainsetup(emitter::RENDER_CHAINSETUP);
        let report = plan_render_as(&chainsetup, &request, render)?;
        mix(engine, &report, &policy)?;
        info!(
            duration = report.timeline.duration(),
            chains = report.chains.len(),
            "render complete"
        );
        Ok(report)
    })
}

fn mix(
    engine: &mut EngineClient,
    report: &RenderReport,
    policy: &PollPolicy,
) -> Result<(), SplicerError> {
    engine.run_all(&report.commands)?;
    engine.execute(&EngineCommand::Start)?;
    engine.wait_until_stopped(policy)
}
