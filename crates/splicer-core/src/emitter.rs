//! Builds ordered engine command lists.
//!
//! Every list starts by disconnecting whatever chainsetup is live and adding a new one under the
//! caller's name, which must be unused on the engine (see `EngineClient::next_chainsetup`).
//! Within a chain the order is always: add chain, audio format, input, operators and
//! controllers, output.

use std::path::Path;

use tracing::{debug, instrument};

use crate::{
    config::{RenderConfig, RoutingConfig},
    engine::EngineCommand,
    envelope::AMPLIFY_PARAMETER,
    error::SplicerError,
    routing::{RoutingConnection, RoutingQueue},
    sequencer::ChainSource,
    session::{IoSpec, Session, Track},
};

pub const RENDER_CHAINSETUP: &str = "render";
pub const NULL_SINK: &str = "null";
/// Amplify operator at unity; the envelope controller drives its gain parameter.
pub const UNITY_AMPLIFY: &str = "-ea:100";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

#[instrument(skip(sources, render), fields(chains = sources.len(), output = %output.display()))]
pub fn render_commands(
    chainsetup: &str,
    sources: &[ChainSource],
    output: &Path,
    render: &RenderConfig,
) -> Vec<EngineCommand> {
    let mut commands = vec![
        EngineCommand::DisconnectChainsetup,
        EngineCommand::AddChainsetup(chainsetup.to_string()),
    ];

    for source in sources {
        commands.extend([
            EngineCommand::AddChain(source.chain.clone()),
            EngineCommand::SetAudioFormat(render.audio_format(render.channels)),
            EngineCommand::AddAudioInput(source.descriptor.display().to_string()),
            EngineCommand::AddChainOperator(UNITY_AMPLIFY.to_string()),
            EngineCommand::AddChainOperatorController(
                source.curve.to_controller(AMPLIFY_PARAMETER),
            ),
        ]);
    }

    commands.extend([
        EngineCommand::SelectAllChains,
        EngineCommand::AddAudioOutput(output.display().to_string()),
        EngineCommand::AttachAudioOutput,
        EngineCommand::SetChainsetupOption("z".to_string(), "mixmode,sum".to_string()),
    ]);

    debug!(commands = commands.len(), "render commands emitted");
    commands
}

/// Emits the live setup for `session`. Resets `routing` first and fills it with the connections
/// to apply once the engine is running; on error the queue is left empty.
#[instrument(skip(session, routing, render, names), fields(session = %session.name, record_enabled))]
pub fn session_commands(
    chainsetup: &str,
    session: &Session,
    record_enabled: bool,
    routing: &mut RoutingQueue,
    render: &RenderConfig,
    names: &RoutingConfig,
) -> Result<Vec<EngineCommand>, SplicerError> {
    routing.reset();
    let result =
        build_session_commands(chainsetup, session, record_enabled, routing, render, names);
    if result.is_err() {
        routing.reset();
    }
    result
}

fn build_session_commands(
    chainsetup: &str,
    session: &Session,
    record_enabled: bool,
    routing: &mut RoutingQueue,
    render: &RenderConfig,
    names: &RoutingConfig,
) -> Result<Vec<EngineCommand>, SplicerError> {
    let mut commands = vec![
        EngineCommand::DisconnectChainsetup,
        EngineCommand::AddChainsetup(chainsetup.to_string()),
    ];

    for track in session.tracks() {
        let recording = record_enabled && track.record;
        let format = render.audio_format(track.channels);

        if track.monitor {
            let live = recording || track.selected_take == 0;
            let input = if live {
                resolve(track, &track.input, Direction::Input, routing, names)?
            } else {
                session
                    .take_path(track, track.selected_take)
                    .display()
                    .to_string()
            };
            let output = resolve(track, &track.output, Direction::Output, routing, names)?;

            commands.push(EngineCommand::AddChain(format!("{}-monitor", track.name)));
            commands.push(EngineCommand::SetAudioFormat(format.clone()));
            commands.push(EngineCommand::AddAudioInput(input));
            commands.extend(
                track
                    .operators
                    .iter()
                    .map(|operator| EngineCommand::AddChainOperator(operator.clone())),
            );
            commands.push(EngineCommand::AddAudioOutput(output));
        }

        if recording {
            let input = resolve(track, &track.input, Direction::Input, routing, names)?;
            let take = session.take_path(track, track.next_take);

            commands.extend([
                EngineCommand::AddChain(format!("{}-record", track.name)),
                EngineCommand::SetAudioFormat(format),
                EngineCommand::AddAudioInput(input),
                EngineCommand::AddAudioOutput(take.display().to_string()),
            ]);
        }
    }

    debug!(
        commands = commands.len(),
        connections = routing.pending().len(),
        "session commands emitted"
    );
    Ok(commands)
}

/// Turns a per-channel spec list into one engine endpoint string, queueing fabric connections
/// for routed endpoints.
fn resolve(
    track: &Track,
    specs: &[IoSpec],
    direction: Direction,
    routing: &mut RoutingQueue,
    names: &RoutingConfig,
) -> Result<String, SplicerError> {
    let label = match direction {
        Direction::Input => "input",
        Direction::Output => "output",
    };

    let Some(first) = specs.first() else {
        return Err(SplicerError::configuration(format!(
            "track {} has no {label} spec",
            track.name
        )));
    };
    if specs.iter().any(|spec| matches!(spec, IoSpec::Loop)) {
        return Err(SplicerError::configuration(format!(
            "track {}: loop {label}s are not supported",
            track.name
        )));
    }

    match first {
        IoSpec::Direct(spec) if specs.len() == 1 => return Ok(spec.clone()),
        IoSpec::File(path) if specs.len() == 1 => return Ok(path.display().to_string()),
        _ => {}
    }

    let channels = usize::from(track.channels.max(1));
    if specs.len() != 1 && specs.len() != channels {
        return Err(SplicerError::configuration(format!(
            "track {} has {} {label} specs for {channels} channels",
            track.name,
            specs.len()
        )));
    }

    let prefix = routing.next_port_name(&track.name);
    for channel in 1..=channels {
        let spec = if specs.len() == 1 {
            first
        } else {
            &specs[channel - 1]
        };
        let (owner, port) = match (spec, direction) {
            (IoSpec::RoutingPort(endpoint), _) => (endpoint.owner.clone(), endpoint.port.clone()),
            (IoSpec::Master, Direction::Output) => (
                names.hardware_owner.clone(),
                format!("{}_{channel}", names.hardware_playback_prefix),
            ),
            (IoSpec::Master, Direction::Input) => {
                return Err(SplicerError::configuration(format!(
                    "track {}: master is an output only",
                    track.name
                )));
            }
            (IoSpec::Direct(_) | IoSpec::File(_), _) => {
                return Err(SplicerError::configuration(format!(
                    "track {}: engine-native {label}s cannot be mixed with routed channels",
                    track.name
                )));
            }
            (IoSpec::Loop, _) => {
                return Err(SplicerError::configuration(format!(
                    "track {}: loop {label}s are not supported",
                    track.name
                )));
            }
        };

        let engine_port = format!("{prefix}_{channel}");
        let connection = match direction {
            Direction::Input => RoutingConnection {
                source_owner: owner,
                source_port: port,
                sink_owner: names.engine_client.clone(),
                sink_port: engine_port,
            },
            Direction::Output => RoutingConnection {
                source_owner: names.engine_client.clone(),
                source_port: engine_port,
                sink_owner: owner,
                sink_port: port,
            },
        };
        routing.queue(connection);
    }

    Ok(format!("jack_generic,{prefix}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        envelope::{AmplitudeDomain, build_fade_curve},
        routing::PortRef,
    };

    fn session_with(track_setup: impl FnOnce(&mut Track)) -> (tempfile::TempDir, Session) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let mut session = Session::open_or_create(temp.path(), "live").expect("session opens");
        let track = session.track_or_create("vox").expect("track is created");
        track.input = vec![IoSpec::RoutingPort(PortRef::new("system", "capture_1"))];
        track.output = vec![IoSpec::Master];
        track_setup(track);
        (temp, session)
    }

    #[test]
    fn render_commands_end_with_summing_output() {
        let curve = build_fade_curve(0.0, 10.0, 90.0, 100.0, 1.0, AmplitudeDomain::Unit)
            .expect("curve should build");
        let sources = vec![ChainSource {
            chain: "track-001".to_string(),
            descriptor: PathBuf::from("work/001-a.ewf"),
            curve,
        }];

        let commands = render_commands(
            "render-1",
            &sources,
            Path::new("out.wav"),
            &RenderConfig::default(),
        );
        let verbs: Vec<String> = commands.iter().map(EngineCommand::to_eci).collect();
        assert_eq!(
            verbs,
            vec![
                "cs-disconnect",
                "cs-add render-1",
                "c-add track-001",
                "cs-set-audio-format s16_le,2,44100",
                "ai-add work/001-a.ewf",
                "cop-add -ea:100",
                "ctrl-add -klg:1,0,100,4,0,0,10,1,90,1,100,0",
                "c-select-all",
                "ao-add out.wav",
                "ao-attach",
                "cs-option -z:mixmode,sum",
            ]
        );
    }

    #[test]
    fn monitor_chain_precedes_record_chain() {
        let (_temp, session) = session_with(|track| {
            track.record = true;
            track.monitor = true;
            track.operators = vec!["-ea:80".to_string()];
        });
        let mut routing = RoutingQueue::default();
        let commands = session_commands(
            "live-1",
            &session,
            true,
            &mut routing,
            &RenderConfig::default(),
            &RoutingConfig::default(),
        )
        .expect("commands should emit");

        let monitor = commands
            .iter()
            .position(|command| *command == EngineCommand::AddChain("vox-monitor".to_string()))
            .expect("monitor chain present");
        let record = commands
            .iter()
            .position(|command| *command == EngineCommand::AddChain("vox-record".to_string()))
            .expect("record chain present");
        assert_eq!(commands[0], EngineCommand::DisconnectChainsetup);
        assert_eq!(commands[1], EngineCommand::AddChainsetup("live-1".to_string()));
        assert_eq!(monitor, 2);
        assert!(monitor < record);
        assert_eq!(
            commands[4],
            EngineCommand::AddAudioInput("jack_generic,vox_1".to_string())
        );
        assert_eq!(
            commands[5],
            EngineCommand::AddChainOperator("-ea:80".to_string())
        );
        assert_eq!(
            commands[6],
            EngineCommand::AddAudioOutput("jack_generic,vox_2".to_string())
        );
        let take = session.directory().join("vox.take-1.wav");
        assert_eq!(
            commands.last(),
            Some(&EngineCommand::AddAudioOutput(take.display().to_string()))
        );
        // monitor in, monitor out, record in
        assert_eq!(routing.pending().len(), 3);
        assert_eq!(routing.pending()[1].sink_port, "playback_1");
    }

    #[test]
    fn monitoring_without_record_plays_the_selected_take() {
        let (_temp, mut session) = session_with(|track| {
            track.monitor = true;
            track.record = true;
            track.selected_take = 2;
            track.next_take = 3;
        });
        let mut routing = RoutingQueue::default();
        let commands = session_commands(
            "live-1",
            &session,
            false,
            &mut routing,
            &RenderConfig::default(),
            &RoutingConfig::default(),
        )
        .expect("commands should emit");

        let take = session.take_path(session.track("vox").expect("track"), 2);
        assert!(commands.contains(&EngineCommand::AddAudioInput(take.display().to_string())));
        assert!(
            !commands.contains(&EngineCommand::AddChain("vox-record".to_string())),
            "global record is off"
        );
        assert_eq!(routing.pending().len(), 1, "only the output is routed");

        session.track_mut("vox").expect("track").monitor = false;
        let commands = session_commands(
            "live-1",
            &session,
            false,
            &mut routing,
            &RenderConfig::default(),
            &RoutingConfig::default(),
        )
        .expect("commands should emit");
        assert_eq!(commands.len(), 2);
        assert!(routing.is_empty(), "queue is reset every pass");
    }

    #[test]
    fn loop_specs_fail_fast() {
        let (_temp, session) = session_with(|track| {
            track.monitor = true;
            track.input = vec![IoSpec::Loop];
        });
        let err = session_commands(
            "live-1",
            &session,
            false,
            &mut RoutingQueue::default(),
            &RenderConfig::default(),
            &RoutingConfig::default(),
        )
        .expect_err("loop input should be rejected");
        assert!(matches!(err, SplicerError::Configuration(_)));
    }

    #[test]
    fn missing_specs_fail_fast() {
        let (_temp, session) = session_with(|track| {
            track.monitor = true;
            track.output.clear();
        });
        assert!(
            session_commands(
                "live-1",
                &session,
                false,
                &mut RoutingQueue::default(),
                &RenderConfig::default(),
                &RoutingConfig::default(),
            )
            .is_err()
        );
    }

    #[test]
    fn stereo_routes_fan_out_one_connection_per_channel() {
        let (_temp, session) = session_with(|track| {
            track.monitor = true;
            track.channels = 2;
            track.input = vec![
                IoSpec::RoutingPort(PortRef::new("synth", "out_l")),
                IoSpec::RoutingPort(PortRef::new("synth", "out_r")),
            ];
            track.output = vec![IoSpec::Direct("alsa,default".to_string())];
        });
        let mut routing = RoutingQueue::default();
        let commands = session_commands(
            "live-1",
            &session,
            false,
            &mut routing,
            &RenderConfig::default(),
            &RoutingConfig::default(),
        )
        .expect("commands should emit");

        assert!(commands.contains(&EngineCommand::SetAudioFormat("s16_le,2,44100".to_string())));
        assert!(commands.contains(&EngineCommand::AddAudioOutput("alsa,default".to_string())));
        let sinks: Vec<&str> = routing
            .pending()
            .iter()
            .map(|connection| connection.sink_port.as_str())
            .collect();
        assert_eq!(sinks, vec!["vox_1_1", "vox_1_2"]);
        assert_eq!(routing.pending()[1].source_port, "out_r");
    }
}
