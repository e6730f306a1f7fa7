pub mod assets;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod emitter;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod ewf;
pub mod fixtures;
pub mod measure;
pub mod persistence;
pub mod render;
pub mod routing;
pub mod sequencer;
pub mod session;
pub mod splitter;

pub use assets::{LengthCache, probe_duration, probe_lengths, scan_audio_files};
pub use config::{AppConfig, CONFIG_FILE_NAME, CONFIG_PATH_ENV};
pub use context::AppContext;
pub use diagnostics::{TelemetryGuard, init_tracing, init_tracing_with_options};
pub use emitter::{render_commands, session_commands};
pub use engine::{
    EngineClient, EngineCommand, EngineProcess, EngineReply, EngineTransport, NetEciTransport,
    PollPolicy,
};
pub use envelope::{AmplitudeDomain, CurveShape, EnvelopeCurve, Keyframe, build_fade_curve};
pub use error::SplicerError;
pub use ewf::{VirtualFile, read_virtual_file, write_virtual_file};
pub use measure::{fill_lengths, measure};
pub use render::{RenderReport, RenderRequest, plan_render, render};
pub use routing::{JackConnectCli, PortGraph, PortRef, RoutingConnection, RoutingQueue};
pub use sequencer::{
    ChainSource, Placement, RenderTrack, SequenceOptions, ShortTrackPolicy, StaticBed, Timeline,
    sequence, write_descriptors,
};
pub use session::{IoSpec, Session, Track};
pub use splitter::{Segment, SplitOptions, plan_segments, split};
