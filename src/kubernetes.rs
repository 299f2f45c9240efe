use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::process::ProcessInvoker;
use crate::types::ClusterResource;

const CREATE: &str = "create";
const DELETE: &str = "delete";
const LOGS: &str = "logs";
const GET: &str = "get";
const VERSION: &str = "version";

const FILENAME_SWITCH: &str = "-f";
const FOLLOW_SWITCH: &str = "-f";
const NAMESPACE_SWITCH: &str = "-n";
const OUTPUT_SWITCH: &str = "-o";
const SINCE_TIME_SWITCH: &str = "--since-time";

const JSON_OUTPUT: &str = "json";
const STATUS_OUTPUT: &str = "jsonpath={..status}";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("static version pattern"));

/// Builds the literal argument vectors for every kubectl call.
#[derive(Debug, Clone)]
pub struct KubectlCommands {
    kubectl: String,
    manifest: PathBuf,
    follow_logs: bool,
}

impl KubectlCommands {
    pub fn new(kubectl: impl Into<String>, manifest: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
            manifest: manifest.into(),
            follow_logs: true,
        }
    }

    pub fn with_follow_logs(mut self, follow: bool) -> Self {
        self.follow_logs = follow;
        self
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest
    }

    fn base(&self, subcommand: &str) -> Vec<String> {
        vec![self.kubectl.clone(), subcommand.to_string()]
    }

    /// `kubectl create -f <manifest> -o json`
    pub fn create(&self) -> Vec<String> {
        let mut cmd = self.base(CREATE);
        cmd.push(FILENAME_SWITCH.to_string());
        cmd.push(self.manifest.display().to_string());
        cmd.push(OUTPUT_SWITCH.to_string());
        cmd.push(JSON_OUTPUT.to_string());
        cmd
    }

    /// `kubectl delete -f <manifest> --ignore-not-found`
    pub fn delete(&self) -> Vec<String> {
        let mut cmd = self.base(DELETE);
        cmd.push(FILENAME_SWITCH.to_string());
        cmd.push(self.manifest.display().to_string());
        cmd.push("--ignore-not-found".to_string());
        cmd
    }

    /// `kubectl logs <kind>/<name> -n <namespace> [-f]`
    pub fn logs(&self, resource: &ClusterResource) -> Vec<String> {
        let mut cmd = self.base(LOGS);
        cmd.push(resource.kind_name());
        cmd.push(NAMESPACE_SWITCH.to_string());
        cmd.push(resource.namespace.clone());
        if self.follow_logs {
            cmd.push(FOLLOW_SWITCH.to_string());
        }
        cmd
    }

    /// `kubectl logs ... --since-time=<since>`, used to resume a stream
    /// without replaying what was already forwarded.
    pub fn logs_since(&self, resource: &ClusterResource, since: DateTime<Utc>) -> Vec<String> {
        let mut cmd = self.logs(resource);
        cmd.push(format!(
            "{}={}",
            SINCE_TIME_SWITCH,
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        cmd
    }

    /// `kubectl get <kind>/<name> -n <namespace> -o jsonpath={..status}`
    pub fn get_status(&self, resource: &ClusterResource) -> Vec<String> {
        let mut cmd = self.base(GET);
        cmd.push(resource.kind_name());
        cmd.push(NAMESPACE_SWITCH.to_string());
        cmd.push(resource.namespace.clone());
        cmd.push(OUTPUT_SWITCH.to_string());
        cmd.push(STATUS_OUTPUT.to_string());
        cmd
    }

    /// `kubectl version --client`
    pub fn version(&self) -> Vec<String> {
        let mut cmd = self.base(VERSION);
        cmd.push("--client".to_string());
        cmd
    }
}

/// Probe the installed client version, or "Unknown".
pub async fn client_version(invoker: &dyn ProcessInvoker, commands: &KubectlCommands) -> String {
    match invoker
        .invoke(&commands.version(), &CancellationToken::new())
        .await
    {
        Ok(result) if result.success() => match parse_version(&result.stdout) {
            Some(version) => {
                info!("kubectl client version is: {}", version);
                version
            }
            None => "Unknown".to_string(),
        },
        Ok(result) => {
            debug!(exit_code = result.exit_code, "kubectl version exited non-zero");
            "Unknown".to_string()
        }
        Err(e) => {
            debug!("Failed to retrieve kubectl client version: {}", e);
            "Unknown".to_string()
        }
    }
}

fn parse_version(output: &str) -> Option<String> {
    VERSION_RE.find(output).map(|m| m.as_str().to_string())
}
