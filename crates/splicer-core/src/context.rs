use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    config::AppConfig,
    emitter,
    engine::{
        EngineClient, EngineCommand, EngineProcess, EngineTransport, NetEciTransport, PollPolicy,
    },
    error::SplicerError,
    routing::{JackConnectCli, PortGraph, RoutingQueue},
    session::Session,
};

/// Everything a running splicer holds on to: the engine connection, the open session, and the
/// routing wired up after the last start.
pub struct AppContext {
    config: AppConfig,
    engine: Mutex<Option<EngineClient>>,
    session: Option<Session>,
    routing: RoutingQueue,
    port_graph: Box<dyn PortGraph>,
    record_enabled: bool,
    playing: bool,
}

impl AppContext {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let port_graph = Box::new(JackConnectCli::new(config.routing.connect_binary.clone()));
        Self {
            config,
            engine: Mutex::new(None),
            session: None,
            routing: RoutingQueue::default(),
            port_graph,
            record_enabled: false,
            playing: false,
        }
    }

    #[must_use]
    pub fn with_port_graph(mut self, port_graph: Box<dyn PortGraph>) -> Self {
        self.port_graph = port_graph;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        self.config.polling.policy()
    }

    #[must_use]
    pub fn engine_ready(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// Connects to the configured engine unless a connection already exists.
    #[instrument(skip(self), fields(address = %self.config.engine.address, launch = self.config.engine.launch))]
    pub fn init_engine(&self) -> Result<(), SplicerError> {
        let mut engine = self.engine.lock();
        if engine.is_some() {
            return Ok(());
        }
        *engine = Some(self.connect_engine()?);
        Ok(())
    }

    /// Like `init_engine`, over an already open transport.
    pub fn init_engine_with(&self, transport: Box<dyn EngineTransport>) {
        let mut engine = self.engine.lock();
        if engine.is_none() {
            *engine = Some(EngineClient::new(transport));
            info!("engine attached");
        }
    }

    /// Drops the current connection (and any engine process we launched) and connects again.
    pub fn reinit_engine(&self) -> Result<(), SplicerError> {
        let mut engine = self.engine.lock();
        *engine = None;
        *engine = Some(self.connect_engine()?);
        info!("engine reinitialised");
        Ok(())
    }

    pub fn reinit_engine_with(&self, transport: Box<dyn EngineTransport>) {
        *self.engine.lock() = Some(EngineClient::new(transport));
        info!("engine reattached");
    }

    fn connect_engine(&self) -> Result<EngineClient, SplicerError> {
        let settings = &self.config.engine;
        let connect_timeout = Duration::from_millis(settings.connect_timeout_ms);
        let io_timeout = Duration::from_millis(settings.io_timeout_ms);

        if !settings.launch {
            let transport =
                NetEciTransport::connect(&settings.address, connect_timeout, io_timeout)?;
            return Ok(EngineClient::new(Box::new(transport)));
        }

        let process = EngineProcess::spawn(&settings.binary, settings.port)?;
        let address = format!("127.0.0.1:{}", settings.port);
        let transport = NetEciTransport::connect_with_retry(
            &address,
            connect_timeout,
            io_timeout,
            settings.connect_attempts,
            Duration::from_millis(settings.connect_retry_delay_ms),
        )?;
        Ok(EngineClient::new(Box::new(transport)).with_process(process))
    }

    /// Runs `operation` with exclusive use of the engine.
    pub fn with_engine<T>(
        &self,
        operation: impl FnOnce(&mut EngineClient) -> Result<T, SplicerError>,
    ) -> Result<T, SplicerError> {
        let mut guard = self.engine.lock();
        let engine = guard.as_mut().ok_or_else(|| {
            SplicerError::EngineUnavailable("engine has not been initialised".to_string())
        })?;
        operation(engine)
    }

    /// Opens (or creates) the named session under the configured root and makes it current.
    #[instrument(skip(self))]
    pub fn select_session(&mut self, name: &str) -> Result<&mut Session, SplicerError> {
        if self.playing {
            return Err(SplicerError::configuration(
                "cannot switch sessions while playing",
            ));
        }
        let session = Session::open_or_create(&self.config.session.root, name)?;
        Ok(self.session.insert(session))
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    #[must_use]
    pub fn record_enabled(&self) -> bool {
        self.record_enabled
    }

    pub fn set_record_enabled(&mut self, enabled: bool) {
        self.record_enabled = enabled;
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    #[must_use]
    pub fn routing(&self) -> &RoutingQueue {
        &self.routing
    }

    /// Emits the current session, starts the engine, and wires the routing once it runs. When the
    /// routing cannot be wired the engine is stopped again and the session is left idle.
    #[instrument(skip(self), fields(record_enabled = self.record_enabled))]
    pub fn start_session(&mut self) -> Result<usize, SplicerError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| SplicerError::configuration("no session selected"))?;
        let chainsetup =
            self.with_engine(|engine| Ok(engine.next_chainsetup(&session.name)))?;
        let commands = emitter::session_commands(
            &chainsetup,
            session,
            self.record_enabled,
            &mut self.routing,
            &self.config.render,
            &self.config.routing,
        )?;

        let policy = self.config.polling.policy();
        self.with_engine(|engine| {
            engine.run_all(&commands)?;
            engine.execute(&EngineCommand::Start)?;
            engine.wait_until_running(&policy)
        })?;
        self.playing = true;

        let connected = match self.routing.apply(self.port_graph.as_mut()) {
            Ok(connected) => connected,
            Err(error) => {
                warn!(%error, "routing failed, stopping the engine");
                if let Err(stop_error) =
                    self.with_engine(|engine| engine.execute(&EngineCommand::Stop).map(|_| ()))
                {
                    warn!(error = %stop_error, "engine did not accept stop");
                }
                self.playing = false;
                return Err(error);
            }
        };
        info!(connected, "session started");
        Ok(connected)
    }

    /// Stops the engine. When a session was playing, every armed track's take advances and the
    /// session is saved; returns the names of the tracks that advanced.
    #[instrument(skip(self), fields(playing = self.playing))]
    pub fn stop_session(&mut self) -> Result<Vec<String>, SplicerError> {
        self.with_engine(|engine| engine.execute(&EngineCommand::Stop).map(|_| ()))?;
        if !std::mem::take(&mut self.playing) {
            return Ok(Vec::new());
        }

        let Some(session) = self.session.as_mut() else {
            warn!("stopped without a session");
            return Ok(Vec::new());
        };
        let advanced = session.complete_takes(self.record_enabled)?;
        session.save()?;
        info!(advanced = advanced.len(), "session stopped");
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_access_before_init_is_unavailable() {
        let context = AppContext::new(AppConfig::default());
        assert!(!context.engine_ready());
        let err = context
            .with_engine(|engine| engine.status())
            .expect_err("no engine yet");
        assert!(matches!(err, SplicerError::EngineUnavailable(_)));
    }

    #[test]
    fn starting_without_a_session_is_a_configuration_error() {
        let mut context = AppContext::new(AppConfig::default());
        let err = context.start_session().expect_err("no session selected");
        assert!(matches!(err, SplicerError::Configuration(_)));
    }
}
