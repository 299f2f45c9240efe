//! Scripted process invoker for driving the controller without a cluster.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::process::{OutputSink, ProcessInvoker};
use crate::types::{OutputStream, ProcessResult};

#[derive(Debug, Clone)]
pub enum Scripted {
    Exit(ProcessResult),
    LaunchFailure,
    /// Block until cancelled.
    Hang,
    /// Forward the lines, then block until cancelled (a followed log).
    Follow(String),
    /// Cancel the given token (the host terminating the run), then block.
    Cancel(CancellationToken),
}

#[derive(Default)]
struct State {
    calls: Vec<Vec<String>>,
    manifests: Vec<String>,
    queues: HashMap<String, VecDeque<Scripted>>,
    defaults: HashMap<String, Scripted>,
}

/// Responses are keyed by kubectl subcommand (`create`, `logs`, ...).
/// Queued responses are consumed first, then the per-subcommand default,
/// then a plain successful exit.
#[derive(Default)]
pub struct ScriptedInvoker {
    state: Mutex<State>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, subcommand: &str, result: ProcessResult) {
        self.script_response(subcommand, Scripted::Exit(result));
    }

    pub fn script_response(&self, subcommand: &str, response: Scripted) {
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(subcommand.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn default_response(&self, subcommand: &str, response: Scripted) {
        self.state
            .lock()
            .unwrap()
            .defaults
            .insert(subcommand.to_string(), response);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Manifest contents as seen by each `create` call.
    pub fn created_manifests(&self) -> Vec<String> {
        self.state.lock().unwrap().manifests.clone()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.get(1).map(String::as_str) == Some(subcommand))
            .count()
    }

    fn next_response(&self, command: &[String]) -> Scripted {
        let subcommand = command.get(1).cloned().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.to_vec());
        if subcommand == "create"
            && let Some(path) = command.get(3)
        {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            state.manifests.push(content);
        }
        if let Some(queue) = state.queues.get_mut(&subcommand)
            && let Some(response) = queue.pop_front()
        {
            return response;
        }
        state
            .defaults
            .get(&subcommand)
            .cloned()
            .unwrap_or(Scripted::Exit(ProcessResult::default()))
    }
}

pub fn exit(code: i32, stdout: &str) -> ProcessResult {
    ProcessResult {
        exit_code: code,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn launch_failure(command: &[String]) -> Error {
    Error::Launch {
        command: command.join(" "),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
    }
}

#[async_trait]
impl ProcessInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        command: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        if cancel.is_cancelled() {
            self.next_response(command);
            return Err(Error::interrupted("scripted invoke"));
        }
        match self.next_response(command) {
            Scripted::Exit(result) => Ok(result),
            Scripted::LaunchFailure => Err(launch_failure(command)),
            Scripted::Hang | Scripted::Follow(_) => {
                cancel.cancelled().await;
                Err(Error::interrupted("scripted invoke"))
            }
            Scripted::Cancel(token) => {
                token.cancel();
                cancel.cancelled().await;
                Err(Error::interrupted("scripted invoke"))
            }
        }
    }

    async fn attach(
        &self,
        command: &[String],
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        if cancel.is_cancelled() {
            self.next_response(command);
            return Err(Error::interrupted("scripted attach"));
        }
        match self.next_response(command) {
            Scripted::Exit(result) => {
                for line in result.stdout.lines() {
                    sink.send(OutputStream::Stdout, line.to_string()).await;
                }
                Ok(ProcessResult {
                    stdout: String::new(),
                    ..result
                })
            }
            Scripted::LaunchFailure => Err(launch_failure(command)),
            Scripted::Hang => {
                cancel.cancelled().await;
                Err(Error::interrupted("scripted attach"))
            }
            Scripted::Follow(lines) => {
                for line in lines.lines() {
                    sink.send(OutputStream::Stdout, line.to_string()).await;
                }
                cancel.cancelled().await;
                Err(Error::interrupted("scripted attach"))
            }
            Scripted::Cancel(token) => {
                token.cancel();
                cancel.cancelled().await;
                Err(Error::interrupted("scripted attach"))
            }
        }
    }
}
