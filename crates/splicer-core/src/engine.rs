use std::{
    fmt,
    io::{BufRead, BufReader, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::SplicerError;

/// The only engine status that counts as active playback.
pub const RUNNING_STATUS: &str = "running";

/// Statuses the engine only leaves through a new setup; a start that lands here never runs.
pub const TERMINAL_STATUSES: [&str; 2] = ["finished", "error"];

/// Log level the engine uses for command return values; everything else is log chatter.
const RETURN_VALUE_LEVEL: u32 = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verb", content = "argument", rename_all = "kebab-case")]
pub enum EngineCommand {
    DisconnectChainsetup,
    AddChainsetup(String),
    AddChain(String),
    SelectChain(String),
    SelectAllChains,
    AddAudioInput(String),
    AddAudioOutput(String),
    SelectAudioInput(String),
    GetAudioInputLength,
    SetAudioFormat(String),
    AddChainOperator(String),
    AddChainOperatorController(String),
    SetPosition(f64),
    SetLength(f64),
    SelectInputIndex(usize),
    Start,
    Stop,
    GetEngineStatus,
    SetChainsetupOption(String, String),
    AttachAudioOutput,
}

impl EngineCommand {
    #[must_use]
    pub fn to_eci(&self) -> String {
        match self {
            Self::DisconnectChainsetup => "cs-disconnect".to_string(),
            Self::AddChainsetup(name) => format!("cs-add {name}"),
            Self::AddChain(name) => format!("c-add {name}"),
            Self::SelectChain(name) => format!("c-select {name}"),
            Self::SelectAllChains => "c-select-all".to_string(),
            Self::AddAudioInput(spec) => format!("ai-add {spec}"),
            Self::AddAudioOutput(spec) => format!("ao-add {spec}"),
            Self::SelectAudioInput(spec) => format!("ai-select {spec}"),
            Self::GetAudioInputLength => "ai-get-length".to_string(),
            Self::SetAudioFormat(spec) => format!("cs-set-audio-format {spec}"),
            Self::AddChainOperator(spec) => format!("cop-add {spec}"),
            Self::AddChainOperatorController(spec) => format!("ctrl-add {spec}"),
            Self::SetPosition(seconds) => format!("cs-set-position {seconds}"),
            Self::SetLength(seconds) => format!("cs-set-length {seconds}"),
            Self::SelectInputIndex(index) => format!("ai-iselect {index}"),
            Self::Start => "start".to_string(),
            Self::Stop => "stop".to_string(),
            Self::GetEngineStatus => "engine-status".to_string(),
            Self::SetChainsetupOption(key, value) => format!("cs-option -{key}:{value}"),
            Self::AttachAudioOutput => "ao-attach".to_string(),
        }
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_eci())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineReply {
    Empty,
    Text(String),
    TextList(Vec<String>),
    Integer(i64),
    Float(f64),
    Error(String),
}

impl EngineReply {
    /// Decodes a reply body according to the protocol's return-type tag.
    pub fn decode(kind: &str, body: &str) -> Result<Self, SplicerError> {
        let protocol_error = || {
            SplicerError::EngineUnavailable(format!("malformed `{kind}` reply body: {body:?}"))
        };
        match kind {
            "-" => Ok(Self::Empty),
            "s" => Ok(Self::Text(body.to_string())),
            "S" => Ok(Self::TextList(
                body.split(',')
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            "i" | "li" => body
                .trim()
                .parse()
                .map(Self::Integer)
                .map_err(|_| protocol_error()),
            "f" => body
                .trim()
                .parse()
                .map(Self::Float)
                .map_err(|_| protocol_error()),
            "e" => Ok(Self::Error(body.to_string())),
            other => Err(SplicerError::EngineUnavailable(format!(
                "unknown reply type `{other}`"
            ))),
        }
    }
}

/// Line-oriented request/response channel to the engine.
pub trait EngineTransport: Send {
    fn request(&mut self, command: &str) -> Result<EngineReply, SplicerError>;
}

/// Engine control over the TCP flavour of the engine's command interface.
pub struct NetEciTransport {
    address: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl NetEciTransport {
    #[instrument(fields(address = %address))]
    pub fn connect(
        address: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, SplicerError> {
        let unavailable =
            |error: std::io::Error| SplicerError::EngineUnavailable(format!("{address}: {error}"));

        let socket_address = address
            .to_socket_addrs()
            .map_err(unavailable)?
            .next()
            .ok_or_else(|| {
                SplicerError::EngineUnavailable(format!("{address} did not resolve"))
            })?;
        let stream =
            TcpStream::connect_timeout(&socket_address, connect_timeout).map_err(unavailable)?;
        stream
            .set_read_timeout(Some(io_timeout))
            .map_err(unavailable)?;
        stream
            .set_write_timeout(Some(io_timeout))
            .map_err(unavailable)?;
        let reader = BufReader::new(stream.try_clone().map_err(unavailable)?);

        info!("engine connection established");
        Ok(Self {
            address: address.to_string(),
            reader,
            writer: stream,
        })
    }

    /// Retries `connect` for an engine that is still starting up.
    pub fn connect_with_retry(
        address: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, SplicerError> {
        let mut last_error = None;
        for attempt in 1..=attempts.max(1) {
            match Self::connect(address, connect_timeout, io_timeout) {
                Ok(transport) => return Ok(transport),
                Err(error) => {
                    debug!(attempt, %error, "engine not reachable yet");
                    last_error = Some(error);
                    thread::sleep(delay);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SplicerError::EngineUnavailable(format!("{address}: no connection attempts made"))
        }))
    }

    fn unavailable(&self, error: &std::io::Error) -> SplicerError {
        SplicerError::EngineUnavailable(format!("{}: {error}", self.address))
    }

    fn read_reply(&mut self) -> Result<EngineReply, SplicerError> {
        loop {
            let mut header = String::new();
            let read = self
                .reader
                .read_line(&mut header)
                .map_err(|error| self.unavailable(&error))?;
            if read == 0 {
                return Err(SplicerError::EngineUnavailable(format!(
                    "{}: connection closed by engine",
                    self.address
                )));
            }

            let header = header.trim_end();
            if header.is_empty() {
                continue;
            }
            let mut fields = header.split_whitespace();
            let level = fields.next().and_then(|value| value.parse::<u32>().ok());
            let size = fields.next().and_then(|value| value.parse::<usize>().ok());
            let kind = fields.next().unwrap_or("-").to_string();
            let (Some(level), Some(size)) = (level, size) else {
                return Err(SplicerError::EngineUnavailable(format!(
                    "malformed reply header: {header:?}"
                )));
            };

            let mut body = vec![0_u8; size];
            self.reader
                .read_exact(&mut body)
                .map_err(|error| self.unavailable(&error))?;
            let mut terminator = [0_u8; 4];
            self.reader
                .read_exact(&mut terminator)
                .map_err(|error| self.unavailable(&error))?;
            let body = String::from_utf8_lossy(&body);

            if level != RETURN_VALUE_LEVEL {
                trace!(level, message = %body, "engine log message");
                continue;
            }
            return EngineReply::decode(&kind, &body);
        }
    }
}

impl EngineTransport for NetEciTransport {
    fn request(&mut self, command: &str) -> Result<EngineReply, SplicerError> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|error| self.unavailable(&error))?;
        self.read_reply()
    }
}

/// Engine server launched by us; killed when dropped.
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    #[instrument(fields(binary = %binary.display(), port))]
    pub fn spawn(binary: &Path, port: u16) -> Result<Self, SplicerError> {
        let child = Command::new(binary)
            .args(["--server", &format!("--server-tcp-port={port}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| {
                SplicerError::EngineUnavailable(format!(
                    "failed to spawn {}: {error}",
                    binary.display()
                ))
            })?;
        info!(pid = child.id(), "engine process spawned");
        Ok(Self { child })
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Err(error) = self.child.kill() {
            debug!(?error, "engine process already gone");
        }
        let _ = self.child.wait();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait before the first status query, giving the engine time to leave its idle state.
    pub settle: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3_600),
        }
    }
}

impl PollPolicy {
    #[must_use]
    pub fn immediate(timeout: Duration) -> Self {
        Self {
            settle: Duration::ZERO,
            interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            timeout,
        }
    }
}

pub struct EngineClient {
    transport: Box<dyn EngineTransport>,
    process: Option<EngineProcess>,
    chainsetups_added: u32,
}

impl EngineClient {
    #[must_use]
    pub fn new(transport: Box<dyn EngineTransport>) -> Self {
        Self {
            transport,
            process: None,
            chainsetups_added: 0,
        }
    }

    #[must_use]
    pub fn with_process(mut self, process: EngineProcess) -> Self {
        self.process = Some(process);
        self
    }

    #[must_use]
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    /// A chainsetup name derived from `base` that this client has not handed out before.
    /// The engine refuses to add a chainsetup under a name it already holds, so every pass over
    /// the same connection takes a fresh one.
    pub fn next_chainsetup(&mut self, base: &str) -> String {
        self.chainsetups_added = self.chainsetups_added.wrapping_add(1);
        format!("{base}-{}", self.chainsetups_added)
    }

    #[instrument(skip(self), fields(command = %command))]
    pub fn execute(&mut self, command: &EngineCommand) -> Result<EngineReply, SplicerError> {
        let reply = self.transport.request(&command.to_eci())?;
        match reply {
            EngineReply::Error(message)
                if matches!(command, EngineCommand::DisconnectChainsetup) =>
            {
                debug!(%message, "nothing to disconnect");
                Ok(EngineReply::Empty)
            }
            EngineReply::Error(message) => Err(SplicerError::EngineRejected {
                command: command.to_eci(),
                message,
            }),
            reply => {
                trace!(?reply, "engine replied");
                Ok(reply)
            }
        }
    }

    pub fn run_all(&mut self, commands: &[EngineCommand]) -> Result<(), SplicerError> {
        for command in commands {
            self.execute(command)?;
        }
        debug!(count = commands.len(), "engine commands sent");
        Ok(())
    }

    pub fn status(&mut self) -> Result<String, SplicerError> {
        match self.execute(&EngineCommand::GetEngineStatus)? {
            EngineReply::Text(status) => Ok(status),
            other => Err(SplicerError::EngineUnavailable(format!(
                "unexpected engine-status reply: {other:?}"
            ))),
        }
    }

    pub fn input_length(&mut self) -> Result<f64, SplicerError> {
        match self.execute(&EngineCommand::GetAudioInputLength)? {
            EngineReply::Float(length) => Ok(length),
            #[allow(clippy::cast_precision_loss)]
            EngineReply::Integer(length) => Ok(length as f64),
            other => Err(SplicerError::EngineUnavailable(format!(
                "unexpected ai-get-length reply: {other:?}"
            ))),
        }
    }

    /// Blocks until the engine reports anything other than `running`.
    pub fn wait_until_stopped(&mut self, policy: &PollPolicy) -> Result<(), SplicerError> {
        self.wait_for(policy, false)
    }

    /// Blocks until the engine reports `running`. A terminal status fails at once instead of
    /// waiting out the timeout.
    pub fn wait_until_running(&mut self, policy: &PollPolicy) -> Result<(), SplicerError> {
        self.wait_for(policy, true)
    }

    #[instrument(skip(self, policy), fields(want_running))]
    fn wait_for(&mut self, policy: &PollPolicy, want_running: bool) -> Result<(), SplicerError> {
        thread::sleep(policy.settle);
        let started = Instant::now();
        let mut interval = policy.interval;

        loop {
            let status = self.status()?;
            if (status == RUNNING_STATUS) == want_running {
                debug!(%status, waited = ?started.elapsed(), "engine settled");
                return Ok(());
            }
            if want_running && TERMINAL_STATUSES.contains(&status.as_str()) {
                warn!(%status, "engine ended before it ran");
                return Err(SplicerError::EngineRejected {
                    command: EngineCommand::Start.to_eci(),
                    message: format!("engine reported `{status}` instead of running"),
                });
            }

            let waited = started.elapsed();
            if waited >= policy.timeout {
                warn!(%status, ?waited, "engine did not settle in time");
                return Err(SplicerError::EngineStuck { waited });
            }

            trace!(%status, ?interval, "engine not settled yet");
            thread::sleep(interval.min(policy.timeout - waited));
            interval = (interval * 2).min(policy.max_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_render_as_protocol_verbs() {
        assert_eq!(EngineCommand::DisconnectChainsetup.to_eci(), "cs-disconnect");
        assert_eq!(
            EngineCommand::AddAudioInput("a.ewf".to_string()).to_eci(),
            "ai-add a.ewf"
        );
        assert_eq!(
            EngineCommand::SetChainsetupOption("z".to_string(), "mixmode,sum".to_string())
                .to_eci(),
            "cs-option -z:mixmode,sum"
        );
        assert_eq!(EngineCommand::SetPosition(12.5).to_eci(), "cs-set-position 12.5");
        assert_eq!(EngineCommand::SelectInputIndex(1).to_eci(), "ai-iselect 1");
    }

    #[test]
    fn replies_decode_by_type_tag() {
        assert_eq!(
            EngineReply::decode("f", "183.25").expect("float reply"),
            EngineReply::Float(183.25)
        );
        assert_eq!(
            EngineReply::decode("s", "running").expect("string reply"),
            EngineReply::Text("running".to_string())
        );
        assert_eq!(
            EngineReply::decode("S", "a,b").expect("list reply"),
            EngineReply::TextList(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            EngineReply::decode("li", "44100").expect("long reply"),
            EngineReply::Integer(44_100)
        );
        assert!(EngineReply::decode("f", "abc").is_err());
        assert!(EngineReply::decode("x", "").is_err());
    }
}
