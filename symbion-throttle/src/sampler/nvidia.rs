//! Accelerator sampling through the vendor CLI

use super::{parse_probe_output, ResourceReading, ResourceSampler};
use crate::error::ProbeError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

pub const DEFAULT_COMMAND: &str =
    "nvidia-smi --query-gpu=index,memory.used,memory.total,utilization.gpu --format=csv,noheader,nounits";

/// Runs the probe command and parses its CSV output
#[derive(Debug, Clone)]
pub struct NvidiaSmiSampler {
    program: String,
    args: Vec<String>,
}

impl NvidiaSmiSampler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a shell-style command line into program and arguments
    pub fn from_command_line(command: &str) -> Result<Self, ProbeError> {
        let mut words = shell_words::split(command).map_err(|e| ProbeError::Malformed {
            line: 0,
            record: command.to_string(),
            reason: e.to_string(),
        })?;
        if words.is_empty() {
            return Err(ProbeError::EmptyCommand);
        }
        let program = words.remove(0);
        Ok(Self::new(program, words))
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ResourceSampler for NvidiaSmiSampler {
    async fn sample(&self) -> Result<Vec<ResourceReading>, ProbeError> {
        debug!("Running probe: {}", self.command_line());

        // Killed if the caller's timeout drops this future
        let output = AsyncCommand::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::ExitStatus {
                command: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| ProbeError::NonUtf8)?;
        parse_probe_output(&stdout)
    }

    fn name(&self) -> &str {
        &self.program
    }
}
