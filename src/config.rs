//! Client configuration and per-execution options.
//!
//! [`ClientConfig`] comes from a YAML file shared by every execution (where
//! kubectl lives, which kubeconfig it uses, retry tuning). Every key is
//! optional and the file itself may be missing.
//!
//! [`ExecutionOptions`] come from the generic info of a single execution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::Kubeconfig;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::NameNormalization;
use crate::streamer::RetryPolicy;
use crate::types::{ClusterResource, ExecutionMode, OnStreamInterrupt};
use crate::waiter::{CompletionPredicate, PollPolicy};

/// Looked up relative to the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config/kubectl-lifecycle.yaml";

/// Name of the rendered manifest inside the work directory.
pub const MANIFEST_FILE_NAME: &str = "k8s-manifest.yml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub kubectl: KubectlSection,
    pub manifest: ManifestSection,
    pub logs: LogsSection,
    pub status: StatusSection,
    pub names: NamesSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubectlSection {
    pub command: String,
    pub config: String,
}

impl Default for KubectlSection {
    fn default() -> Self {
        Self {
            command: "/usr/local/bin/kubectl".to_string(),
            config: "~/.kube/config".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestSection {
    pub work_dir: PathBuf,
}

impl Default for ManifestSection {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    pub retry_interval_ms: u64,
    pub max_attempts: Option<u32>,
    pub max_duration_secs: Option<u64>,
    pub follow: bool,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            max_attempts: None,
            max_duration_secs: None,
            follow: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusSection {
    pub poll_interval_secs: u64,
    pub max_duration_secs: Option<u64>,
    pub attach_grace_secs: u64,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_duration_secs: None,
            attach_grace_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamesSection {
    pub lowercase: bool,
}

impl ClientConfig {
    /// Load from `path` (or [`DEFAULT_CONFIG_FILE`]); a missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        debug!("Load properties from configuration file: {}", path.display());

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Configuration file {} not found. Standard values will be used.",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        Self::from_yaml(&content)
            .map_err(|e| Error::config(format!("invalid {}: {}", path.display(), e)))
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn kubectl_command(&self) -> &str {
        &self.kubectl.command
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        expand_home(&self.kubectl.config)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest.work_dir.join(MANIFEST_FILE_NAME)
    }

    pub fn log_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.logs.retry_interval_ms),
            max_attempts: self.logs.max_attempts,
            max_duration: self.logs.max_duration_secs.map(Duration::from_secs),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.status.poll_interval_secs),
            max_duration: self.status.max_duration_secs.map(Duration::from_secs),
            attach_grace: Duration::from_secs(self.status.attach_grace_secs),
        }
    }

    pub fn name_normalization(&self) -> NameNormalization {
        if self.names.lowercase {
            NameNormalization::Lowercase
        } else {
            NameNormalization::Preserve
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Current context of the kubeconfig kubectl will use, if readable.
pub fn current_context(kubeconfig: &Path) -> Option<String> {
    match Kubeconfig::read_from(kubeconfig) {
        Ok(config) => config.current_context,
        Err(e) => {
            warn!(
                "Could not read kubeconfig {}: {}",
                kubeconfig.display(),
                e
            );
            None
        }
    }
}

pub const CREATE_ONLY: &str = "CREATE_ONLY";
pub const DELETE_ONLY: &str = "DELETE_ONLY";
pub const STREAM_LOGS: &str = "STREAM_LOGS";
pub const RESOURCE_TO_STREAM: &str = "RESOURCE_TO_STREAM";
pub const WAIT_FOR_COMPLETION: &str = "WAIT_FOR_COMPLETION";
pub const COMPLETION_STATES: &str = "COMPLETION_STATES";
pub const ON_STREAM_INTERRUPT: &str = "ON_STREAM_INTERRUPT";

const GENERIC_INFO_PREFIX: &str = "genericInformation_";
const ENGINE_PREFIX: &str = "K8S_";

/// Behavior switches for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub create_only: bool,
    pub delete_only: bool,
    pub stream_logs: bool,
    pub resource_to_stream: Option<ClusterResource>,
    pub wait_for_completion: bool,
    pub completion: CompletionPredicate,
    pub on_stream_interrupt: OnStreamInterrupt,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            create_only: false,
            delete_only: false,
            stream_logs: true,
            resource_to_stream: None,
            wait_for_completion: false,
            completion: CompletionPredicate::Succeeded,
            on_stream_interrupt: OnStreamInterrupt::Fatal,
        }
    }
}

impl ExecutionOptions {
    /// Parse generic info. Keys may be bare (`CREATE_ONLY`), engine-prefixed
    /// (`K8S_CREATE_ONLY`) or carry the host prefix
    /// (`genericInformation_K8S_CREATE_ONLY`).
    pub fn from_generic_info(info: &BTreeMap<String, String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(v) = lookup(info, CREATE_ONLY) {
            options.create_only = parse_bool(v);
        }
        if let Some(v) = lookup(info, DELETE_ONLY) {
            options.delete_only = parse_bool(v);
        }
        if let Some(v) = lookup(info, STREAM_LOGS) {
            options.stream_logs = parse_bool(v);
        }
        if let Some(v) = lookup(info, RESOURCE_TO_STREAM)
            && !v.trim().is_empty()
        {
            options.resource_to_stream = Some(ClusterResource::parse_reference(v)?);
        }
        if let Some(v) = lookup(info, WAIT_FOR_COMPLETION) {
            options.wait_for_completion = parse_bool(v);
        }
        if let Some(v) = lookup(info, COMPLETION_STATES) {
            options.completion = v.parse()?;
        }
        if let Some(v) = lookup(info, ON_STREAM_INTERRUPT) {
            options.on_stream_interrupt = v.parse()?;
        }

        Ok(options)
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.create_only && self.delete_only {
            warn!("Both CREATE_ONLY and DELETE_ONLY are set; CREATE_ONLY takes precedence");
        }
        ExecutionMode::from_flags(self.create_only, self.delete_only)
    }
}

fn lookup<'a>(info: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    let candidates = [
        key.to_string(),
        format!("{}{}", ENGINE_PREFIX, key),
        format!("{}{}", GENERIC_INFO_PREFIX, key),
        format!("{}{}{}", GENERIC_INFO_PREFIX, ENGINE_PREFIX, key),
    ];
    candidates
        .iter()
        .find_map(|k| info.get(k))
        .map(String::as_str)
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
