//! Child process back-end.
//!
//! The helper owns the serial line and speaks a line protocol over its
//! stdin/stdout:
//!
//! ```text
//! > MDB_OPEN /dev/ttyAMA0      < OK
//! > MDB_RESET 200              < OK
//! > MDB_TX 0b                  < OK 0b   |  ERR timeout
//! ```

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};
use vender_core::hex;

use crate::error::{HardwareError, Result};

use super::uart::{Uart, copy_response};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct HelperUart {
    program: String,
    proc: Option<HelperProcess>,
}

#[derive(Debug)]
struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Parsed helper reply line.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Ok(Vec<u8>),
    Err(String),
}

impl Reply {
    /// # Errors
    ///
    /// Returns [`HardwareError::PacketInvalid`] for a line that is neither
    /// `OK [hex]` nor `ERR text`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("OK") {
            let data =
                hex::decode(rest.trim()).map_err(|e| HardwareError::packet_invalid(e.to_string()))?;
            return Ok(Self::Ok(data));
        }
        if let Some(rest) = line.strip_prefix("ERR") {
            return Ok(Self::Err(rest.trim().to_string()));
        }
        Err(HardwareError::packet_invalid(format!(
            "helper reply: {line}"
        )))
    }

    /// Map the reply to data or a typed bus error.
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Self::Ok(data) => Ok(data),
            Self::Err(text) => Err(match text.to_ascii_lowercase().as_str() {
                t if t.contains("timeout") => HardwareError::timeout("mdb helper"),
                t if t.contains("nak") => HardwareError::Nak,
                t if t.contains("busy") => HardwareError::Busy,
                _ => HardwareError::bus(text),
            }),
        }
    }
}

impl HelperUart {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            proc: None,
        }
    }

    async fn spawn(&mut self) -> Result<&mut HelperProcess> {
        if self.proc.is_none() {
            let mut child = Command::new(&self.program)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| HardwareError::disconnected("helper stdin"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| HardwareError::disconnected("helper stdout"))?;
            debug!(program = %self.program, "mdb helper started");
            self.proc = Some(HelperProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            });
        }
        self.proc
            .as_mut()
            .ok_or_else(|| HardwareError::disconnected("mdb helper"))
    }

    async fn command(&mut self, line: String) -> Result<Vec<u8>> {
        let proc = self.spawn().await?;
        proc.stdin.write_all(line.as_bytes()).await?;
        proc.stdin.write_all(b"\n").await?;
        proc.stdin.flush().await?;
        let mut reply = String::new();
        let n = tokio::time::timeout(REPLY_TIMEOUT, proc.stdout.read_line(&mut reply))
            .await
            .map_err(|_| HardwareError::timeout("mdb helper reply"))??;
        if n == 0 {
            warn!(program = %self.program, "mdb helper exited");
            self.proc = None;
            return Err(HardwareError::disconnected("mdb helper"));
        }
        Reply::parse(&reply)?.into_result()
    }
}

impl Uart for HelperUart {
    async fn open(&mut self, path: &str) -> Result<()> {
        self.command(format!("MDB_OPEN {path}")).await.map(|_| ())
    }

    async fn tx(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize> {
        let data = self
            .command(format!("MDB_TX {}", hex::encode(request)))
            .await?;
        copy_response(&data, response)
    }

    async fn break_(&mut self, keep: Duration, sleep: Duration) -> Result<()> {
        self.command(format!("MDB_RESET {}", keep.as_millis()))
            .await?;
        tokio::time::sleep(sleep).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut proc) = self.proc.take() {
            proc.child.kill().await?;
        }
        Ok(())
    }
}
