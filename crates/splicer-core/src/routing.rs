use std::{path::PathBuf, process::Command};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::SplicerError;

/// A named endpoint on the routing fabric, e.g. `system:capture_1`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRef {
    pub owner: String,
    pub port: String,
}

impl PortRef {
    #[must_use]
    pub fn new(owner: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            port: port.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingConnection {
    pub source_owner: String,
    pub source_port: String,
    pub sink_owner: String,
    pub sink_port: String,
}

/// Connections waiting for the engine's ports to exist, plus the per-pass port-name counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingQueue {
    pending: Vec<RoutingConnection>,
    last_suffix: u32,
}

impl RoutingQueue {
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_suffix = 0;
    }

    /// `<prefix>_<n>` with `n` counting from 1 since the last reset.
    pub fn next_port_name(&mut self, prefix: &str) -> String {
        self.last_suffix += 1;
        format!("{prefix}_{}", self.last_suffix)
    }

    pub fn queue(&mut self, connection: RoutingConnection) {
        self.pending.push(connection);
    }

    #[must_use]
    pub fn pending(&self) -> &[RoutingConnection] {
        &self.pending
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every queued connection in order; the queue is emptied even if one fails.
    #[instrument(skip(self, graph), fields(pending = self.pending.len()))]
    pub fn apply(&mut self, graph: &mut dyn PortGraph) -> Result<usize, SplicerError> {
        let pending = std::mem::take(&mut self.pending);
        for connection in &pending {
            graph.connect(connection)?;
        }
        info!(connections = pending.len(), "routing applied");
        Ok(pending.len())
    }
}

pub trait PortGraph: Send {
    fn connect(&mut self, connection: &RoutingConnection) -> Result<(), SplicerError>;
}

/// Wires ports by invoking the fabric's command-line connect tool.
#[derive(Debug, Clone)]
pub struct JackConnectCli {
    binary: PathBuf,
}

impl JackConnectCli {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl PortGraph for JackConnectCli {
    fn connect(&mut self, connection: &RoutingConnection) -> Result<(), SplicerError> {
        let source = format!("{}:{}", connection.source_owner, connection.source_port);
        let sink = format!("{}:{}", connection.sink_owner, connection.sink_port);
        let status = Command::new(&self.binary)
            .args([&source, &sink])
            .status()
            .map_err(|error| {
                SplicerError::Io(format!(
                    "failed to spawn {}: {error}",
                    self.binary.display()
                ))
            })?;

        if !status.success() {
            return Err(SplicerError::Io(format!(
                "{} exited with status {status} connecting {source} -> {sink}",
                self.binary.display()
            )));
        }

        debug!(%source, %sink, "ports connected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_suffix_restarts_after_reset() {
        let mut queue = RoutingQueue::default();
        assert_eq!(queue.next_port_name("vox"), "vox_1");
        assert_eq!(queue.next_port_name("gtr"), "gtr_2");
        queue.queue(RoutingConnection {
            source_owner: "system".to_string(),
            source_port: "capture_1".to_string(),
            sink_owner: "ecasound".to_string(),
            sink_port: "vox_1_1".to_string(),
        });

        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.next_port_name("vox"), "vox_1");
    }
}
