use std::fmt;

use crate::error::{Error, Result};

/// Kinds that `kubectl logs` can attach to.
const LOG_STREAMABLE_KINDS: [&str; 3] = ["job", "pod", "deployment"];

/// A single object created in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterResource {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ClusterResource {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Parse a `namespace/kind/name` reference. The kind is lower-cased.
    pub fn parse_reference(reference: &str) -> Result<Self> {
        let parts: Vec<&str> = reference.trim().split('/').collect();
        match parts.as_slice() {
            [namespace, kind, name]
                if !namespace.is_empty() && !kind.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(kind.to_lowercase(), *name, *namespace))
            }
            _ => Err(Error::invalid_option(
                "RESOURCE_TO_STREAM",
                format!("expected namespace/kind/name, got '{}'", reference),
            )),
        }
    }

    /// Whether `kubectl logs` can attach to this kind of resource.
    pub fn is_log_streamable(&self) -> bool {
        LOG_STREAMABLE_KINDS
            .iter()
            .any(|k| k.eq_ignore_ascii_case(&self.kind))
    }

    /// `kind/name`, as accepted by kubectl.
    pub fn kind_name(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for ClusterResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Outcome of one external client invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Captured output used in error reports: stdout, then stderr if any.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
            (false, true) => self.stdout.trim().to_string(),
            (true, _) => self.stderr.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of workload output captured from `kubectl logs`.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// High-level behavior selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    CreateOnly,
    DeleteOnly,
    /// create -> stream -> delete
    FullCycle,
}

impl ExecutionMode {
    pub fn from_flags(create_only: bool, delete_only: bool) -> Self {
        if create_only {
            ExecutionMode::CreateOnly
        } else if delete_only {
            ExecutionMode::DeleteOnly
        } else {
            ExecutionMode::FullCycle
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::CreateOnly => "create-only",
            ExecutionMode::DeleteOnly => "delete-only",
            ExecutionMode::FullCycle => "full-cycle",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    ManifestWritten,
    Created,
    Streaming,
    Deleted,
    Done,
    Failed,
}

/// What an interruption of the log-streaming phase means.
///
/// Hosts disagree here: some interrupt the tailer to signal that the job is
/// finished, others interrupt because the task is being killed. The choice is
/// left to the caller until product settles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnStreamInterrupt {
    /// Clean up and surface `Error::Interrupted`.
    #[default]
    Fatal,
    /// Stop tailing and continue with normal deletion.
    TreatAsCompletion,
}

impl std::str::FromStr for OnStreamInterrupt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fatal" => Ok(OnStreamInterrupt::Fatal),
            "completion" | "treat-as-completion" | "treatascompletion" => {
                Ok(OnStreamInterrupt::TreatAsCompletion)
            }
            other => Err(Error::invalid_option(
                "ON_STREAM_INTERRUPT",
                format!("expected 'fatal' or 'completion', got '{}'", other),
            )),
        }
    }
}
