//! External process invocation.
//!
//! Every call to the cluster client goes through [`ProcessInvoker`] so the
//! controller can be driven by a scripted invoker in tests.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{ClusterResource, LogMessage, OutputStream, ProcessResult};

#[async_trait]
pub trait ProcessInvoker: Send + Sync {
    /// Run `command` to completion and capture its output.
    async fn invoke(&self, command: &[String], cancel: &CancellationToken)
    -> Result<ProcessResult>;

    /// Run `command`, forwarding stdout lines to `sink` as they arrive.
    ///
    /// Stderr is buffered and returned in the result; stdout is not.
    async fn attach(
        &self,
        command: &[String],
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult>;
}

/// Destination for live workload output of one resource.
///
/// Also carries the "attached" handshake. It flips to `true` once a logs
/// call for the resource exits successfully, never on partial output.
#[derive(Clone)]
pub struct OutputSink {
    resource: ClusterResource,
    tx: mpsc::Sender<LogMessage>,
    attached: Arc<watch::Sender<bool>>,
    last_forwarded: Arc<watch::Sender<Option<DateTime<Utc>>>>,
}

impl OutputSink {
    pub fn new(
        resource: ClusterResource,
        tx: mpsc::Sender<LogMessage>,
    ) -> (Self, watch::Receiver<bool>) {
        let (attached, rx) = watch::channel(false);
        let (last_forwarded, _) = watch::channel(None);
        (
            Self {
                resource,
                tx,
                attached: Arc::new(attached),
                last_forwarded: Arc::new(last_forwarded),
            },
            rx,
        )
    }

    pub fn resource(&self) -> &ClusterResource {
        &self.resource
    }

    pub fn mark_attached(&self) {
        self.attached.send_replace(true);
    }

    /// Capture time of the last stdout line forwarded, if any.
    pub fn last_forwarded(&self) -> Option<DateTime<Utc>> {
        *self.last_forwarded.borrow()
    }

    /// Forward one line. Returns false once the receiver is gone.
    pub async fn send(&self, stream: OutputStream, line: String) -> bool {
        let timestamp = Utc::now();
        let msg = LogMessage {
            namespace: self.resource.namespace.clone(),
            kind: self.resource.kind.clone(),
            name: self.resource.name.clone(),
            stream,
            line,
            timestamp,
        };
        let delivered = self.tx.send(msg).await.is_ok();
        if delivered && stream == OutputStream::Stdout {
            self.last_forwarded.send_replace(Some(timestamp));
        }
        delivered
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemInvoker {
    envs: Vec<(String, String)>,
}

impl SystemInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable on every spawned process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, command: &[String]) -> Result<tokio::process::Child> {
        let cmdline = command.join(" ");
        let (program, args) = command.split_first().ok_or_else(|| Error::Launch {
            command: cmdline.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| Error::Launch {
            command: cmdline.clone(),
            source,
        })?;
        debug!(command = %cmdline, "Spawned process");
        Ok(child)
    }
}

#[async_trait]
impl ProcessInvoker for SystemInvoker {
    async fn invoke(
        &self,
        command: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        let cmdline = command.join(" ");
        let child = self.spawn(command)?;

        // Dropping the pending wait kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| Error::Launch {
                command: cmdline.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                return Err(Error::interrupted(format!("waiting for '{}'", cmdline)));
            }
        };

        Ok(ProcessResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: join_lines(&output.stdout, " "),
            stderr: join_lines(&output.stderr, "\n"),
        })
    }

    async fn attach(
        &self,
        command: &[String],
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        let cmdline = command.join(" ");
        let mut child = self.spawn(command)?;

        let missing_pipe = || Error::Launch {
            command: cmdline.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "output not captured"),
        };
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;

        // Lines are split on raw bytes so invalid UTF-8 in workload output
        // cannot stop the pipes from being drained.
        let out_lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .map(|l| (OutputStream::Stdout, l));
        let err_lines = SplitStream::new(BufReader::new(stderr).split(b'\n'))
            .map(|l| (OutputStream::Stderr, l));
        let mut lines = std::pin::pin!(out_lines.merge(err_lines));

        let mut stderr_buf = Vec::new();
        let mut receiver_gone = false;
        loop {
            tokio::select! {
                next = lines.next() => match next {
                    Some((OutputStream::Stdout, Ok(raw))) => {
                        let line = decode_line(&raw);
                        if !receiver_gone && !sink.send(OutputStream::Stdout, line).await {
                            debug!(command = %cmdline, "Output receiver closed, discarding lines");
                            receiver_gone = true;
                        }
                    }
                    Some((OutputStream::Stderr, Ok(raw))) => stderr_buf.push(decode_line(&raw)),
                    Some((stream, Err(source))) => {
                        warn!(command = %cmdline, ?stream, "Error reading process output: {}", source);
                        if let Err(e) = child.kill().await {
                            debug!(command = %cmdline, "Could not kill process: {}", e);
                        }
                        return Err(Error::Io {
                            command: cmdline.clone(),
                            source,
                        });
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    return Err(Error::interrupted(format!("attached to '{}'", cmdline)));
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| Error::Launch {
                command: cmdline.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                return Err(Error::interrupted(format!("waiting for '{}'", cmdline)));
            }
        };

        Ok(ProcessResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr: stderr_buf.join("\n"),
        })
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}

fn join_lines(bytes: &[u8], separator: &str) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join(separator)
}
