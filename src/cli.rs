use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{
    COMPLETION_STATES, CREATE_ONLY, DELETE_ONLY, ON_STREAM_INTERRUPT, RESOURCE_TO_STREAM,
    STREAM_LOGS, WAIT_FOR_COMPLETION,
};
use crate::error::{Error, Result};
use crate::render::flatten_variables;
use crate::utils::parse_key_value;

#[derive(Parser)]
#[command(name = "kubectl-lifecycle")]
#[command(
    about = "Create Kubernetes resources from a manifest, stream their logs and clean them up"
)]
pub struct Cli {
    /// Manifest file ('-' reads stdin)
    #[arg(default_value = "-")]
    pub manifest: String,

    /// Only create the resources and leave them running
    #[arg(long)]
    pub create_only: bool,

    /// Only delete the resources described by the manifest
    #[arg(long)]
    pub delete_only: bool,

    /// Do not stream logs; wait for completion instead
    #[arg(long)]
    pub no_stream_logs: bool,

    /// Tail logs in the background while polling status until completion
    #[arg(long)]
    pub wait_for_completion: bool,

    /// Resource whose logs are streamed
    #[arg(short = 'r', long, value_name = "NAMESPACE/KIND/NAME")]
    pub resource_to_stream: Option<String>,

    /// States that end the wait: "succeeded" or "succeeded,active"
    #[arg(long, value_name = "STATES")]
    pub completion_states: Option<String>,

    /// What an interrupted log stream means: "fatal" or "completion"
    #[arg(long, value_name = "POLICY")]
    pub on_stream_interrupt: Option<String>,

    /// Manifest variable, substituted for ${KEY}
    #[arg(short = 'e', long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// YAML or JSON file of manifest variables
    #[arg(long, value_name = "FILE")]
    pub vars_file: Option<PathBuf>,

    /// Generic info option (e.g. K8S_CREATE_ONLY=true)
    #[arg(short = 'i', long = "info", value_name = "KEY=VALUE")]
    pub info: Vec<String>,

    /// Client configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Prefix streamed lines with their capture time
    #[arg(long)]
    pub timestamps: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Generic info from `--info`, overridden by the dedicated flags.
    pub fn generic_info(&self) -> Result<BTreeMap<String, String>> {
        let mut info = BTreeMap::new();
        for pair in &self.info {
            let (k, v) = parse_key_value(pair).map_err(|e| Error::invalid_option("--info", e))?;
            info.insert(k, v);
        }

        if self.create_only {
            info.insert(CREATE_ONLY.to_string(), "true".to_string());
        }
        if self.delete_only {
            info.insert(DELETE_ONLY.to_string(), "true".to_string());
        }
        if self.no_stream_logs {
            info.insert(STREAM_LOGS.to_string(), "false".to_string());
        }
        if self.wait_for_completion {
            info.insert(WAIT_FOR_COMPLETION.to_string(), "true".to_string());
        }
        if let Some(target) = &self.resource_to_stream {
            info.insert(RESOURCE_TO_STREAM.to_string(), target.clone());
        }
        if let Some(states) = &self.completion_states {
            info.insert(COMPLETION_STATES.to_string(), states.clone());
        }
        if let Some(policy) = &self.on_stream_interrupt {
            info.insert(ON_STREAM_INTERRUPT.to_string(), policy.clone());
        }
        Ok(info)
    }

    /// Variables from `--vars-file`, overridden by `--var`.
    pub fn variables(&self) -> Result<BTreeMap<String, String>> {
        let mut vars = match &self.vars_file {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("cannot read {}: {}", path.display(), e))
                })?;
                let doc: serde_yaml::Value = serde_yaml::from_str(&content)
                    .map_err(|e| Error::config(format!("invalid {}: {}", path.display(), e)))?;
                flatten_variables(&doc)?
            }
            None => BTreeMap::new(),
        };

        for pair in &self.vars {
            let (k, v) = parse_key_value(pair).map_err(|e| Error::invalid_option("--var", e))?;
            vars.insert(k, v);
        }
        Ok(vars)
    }
}
