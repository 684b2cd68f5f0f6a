use crate::FlowSet;
use std::{ffi::OsString, path::PathBuf, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, instrument};

/// A switch that flows can be installed into.
#[async_trait::async_trait]
pub trait FlowSwitch: Send + Sync {
    /// Installs `rules`, replacing any existing flow with the same table, priority and match.
    ///
    /// Applying the same set twice leaves the switch unchanged.
    async fn apply(&self, rules: &FlowSet) -> Result<(), SwitchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("failed to run {program}: {error}")]
    Spawn {
        program: String,
        #[source]
        error: std::io::Error,
    },

    #[error("ovs-ofctl exited with {status}: {stderr}")]
    Rejected {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Programs a local Open vSwitch bridge with `ovs-ofctl`.
#[derive(Clone, Debug)]
pub struct OvsOfctl {
    program: PathBuf,
    bridge: String,
    protocols: Option<String>,
}

// === impl OvsOfctl ===

impl OvsOfctl {
    pub fn new(program: impl Into<PathBuf>, bridge: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            bridge: bridge.into(),
            protocols: None,
        }
    }

    /// Restricts the OpenFlow versions used to talk to the bridge, e.g. `OpenFlow13`.
    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = Some(protocols.into());
        self
    }

    /// Arguments for reading a batch of flows from stdin.
    fn add_flows_args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(5);
        if let Some(protocols) = &self.protocols {
            args.push("-O".into());
            args.push(protocols.into());
        }
        args.push("add-flows".into());
        args.push(self.bridge.as_str().into());
        args.push("-".into());
        args
    }

    fn spawn_error(&self, error: std::io::Error) -> SwitchError {
        SwitchError::Spawn {
            program: self.program.display().to_string(),
            error,
        }
    }
}

#[async_trait::async_trait]
impl FlowSwitch for OvsOfctl {
    #[instrument(skip_all, fields(bridge = %self.bridge, flows = rules.len()))]
    async fn apply(&self, rules: &FlowSet) -> Result<(), SwitchError> {
        if rules.is_empty() {
            return Ok(());
        }

        let flows = rules.to_string();
        debug!(%flows, "Adding flows");

        // The child is killed if the caller's deadline drops this future.
        let mut child = Command::new(&self.program)
            .args(self.add_flows_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(flows.as_bytes())
                .await
                .map_err(|e| self.spawn_error(e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(SwitchError::Rejected {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
