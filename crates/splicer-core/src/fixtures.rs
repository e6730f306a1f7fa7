use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::Path,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    engine::{EngineReply, EngineTransport, PollPolicy},
    error::SplicerError,
    routing::{PortGraph, PortRef, RoutingConnection},
    session::{IoSpec, Session},
};

/// In-process stand-in for the engine. Clones share one script and one command log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    sent: Vec<String>,
    statuses: VecDeque<String>,
    idle_status: Option<String>,
    lengths: BTreeMap<String, f64>,
    rejected: Vec<String>,
    selected_input: Option<String>,
    chainsetups: BTreeSet<String>,
}

impl ScriptedEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses returned by successive `engine-status` queries before falling back to the idle
    /// status (`finished` unless overridden).
    #[must_use]
    pub fn with_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .statuses
            .extend(statuses.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_idle_status(self, status: impl Into<String>) -> Self {
        self.state.lock().idle_status = Some(status.into());
        self
    }

    /// Length reported for `input` once it has been added or selected.
    #[must_use]
    pub fn with_length(self, input: impl AsRef<Path>, seconds: f64) -> Self {
        self.state
            .lock()
            .lengths
            .insert(input.as_ref().display().to_string(), seconds);
        self
    }

    /// Every command starting with `prefix` gets an error reply.
    #[must_use]
    pub fn rejecting(self, prefix: impl Into<String>) -> Self {
        self.state.lock().rejected.push(prefix.into());
        self
    }

    #[must_use]
    pub fn transport(&self) -> Box<dyn EngineTransport> {
        Box::new(self.clone())
    }

    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    #[must_use]
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|sent| sent.as_str() == command)
            .count()
    }
}

impl EngineTransport for ScriptedEngine {
    fn request(&mut self, command: &str) -> Result<EngineReply, SplicerError> {
        let mut script = self.state.lock();
        script.sent.push(command.to_string());

        if script
            .rejected
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()))
        {
            return Ok(EngineReply::Error(format!("scripted rejection of `{command}`")));
        }

        let (verb, argument) = command.split_once(' ').unwrap_or((command, ""));
        let reply = match verb {
            "engine-status" => {
                let status = match script.statuses.pop_front() {
                    Some(status) => status,
                    None => script
                        .idle_status
                        .clone()
                        .unwrap_or_else(|| "finished".to_string()),
                };
                EngineReply::Text(status)
            }
            "cs-add" if !script.chainsetups.insert(argument.to_string()) => {
                EngineReply::Error(format!("chainsetup `{argument}` already exists"))
            }
            "ai-add" | "ai-select" => {
                script.selected_input = Some(argument.to_string());
                EngineReply::Empty
            }
            "ai-get-length" => {
                let length = script
                    .selected_input
                    .as_ref()
                    .and_then(|input| script.lengths.get(input))
                    .copied();
                length.map_or_else(
                    || EngineReply::Error("no length for selected input".to_string()),
                    EngineReply::Float,
                )
            }
            _ => EngineReply::Empty,
        };
        Ok(reply)
    }
}

/// Port graph that only records what it was asked to connect.
#[derive(Debug, Clone, Default)]
pub struct RecordingPortGraph {
    connections: Arc<Mutex<Vec<RoutingConnection>>>,
}

impl RecordingPortGraph {
    #[must_use]
    pub fn boxed(&self) -> Box<dyn PortGraph> {
        Box::new(self.clone())
    }

    #[must_use]
    pub fn connections(&self) -> Vec<RoutingConnection> {
        self.connections.lock().clone()
    }
}

impl PortGraph for RecordingPortGraph {
    fn connect(&mut self, connection: &RoutingConnection) -> Result<(), SplicerError> {
        self.connections.lock().push(connection.clone());
        Ok(())
    }
}

/// Polling that never sleeps, for scripted engines.
#[must_use]
pub fn instant_poll_policy() -> PollPolicy {
    PollPolicy::immediate(Duration::from_secs(5))
}

/// Two-track session under `root`: an armed, monitored `vox` fed from the first capture port, and
/// a monitored `gtr` playing a DI file. Both go to the master output.
pub fn demo_session(root: &Path) -> Result<Session, SplicerError> {
    let mut session = Session::open_or_create(root, "demo")?;

    let vox = session.track_or_create("vox")?;
    vox.input = vec![IoSpec::RoutingPort(PortRef::new("system", "capture_1"))];
    vox.output = vec![IoSpec::Master];
    vox.record = true;
    vox.monitor = true;

    let gtr = session.track_or_create("gtr")?;
    gtr.input = vec![IoSpec::File(root.join("gtr-di.wav"))];
    gtr.output = vec![IoSpec::Master];
    gtr.operators = vec!["-ea:80".to_string()];
    gtr.monitor = true;

    Ok(session)
}
