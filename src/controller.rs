//! Lifecycle state machine for one execution.
//!
//! ```text
//! CreateOnly:  Idle -> ManifestWritten -> Created -> Done
//! DeleteOnly:  Idle -> Deleted -> Done
//! FullCycle:   Idle -> ManifestWritten -> Created -> Streaming -> Deleted -> Done
//! ```
//!
//! Any fatal error moves the execution to `Failed` after cleanup. Cleanup
//! (delete the manifest's resources, remove the manifest file) runs at most
//! once per execution, whatever the exit path.
//!
//! Termination is delivered by the host through a [`CancellationToken`].
//! Every client call observes it, so a termination surfaces as
//! `Error::Interrupted` and goes through the same cleanup path as any other
//! failure. Cleanup itself runs under a fresh token.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, ExecutionOptions};
use crate::error::{Error, Result};
use crate::kubernetes::KubectlCommands;
use crate::manifest::ManifestFile;
use crate::process::{OutputSink, ProcessInvoker};
use crate::registry::{NameNormalization, ResourceRegistry, parse_created};
use crate::render::render;
use crate::streamer::{LogStreamer, RetryPolicy};
use crate::types::{
    ClusterResource, ExecutionMode, LifecycleState, LogMessage, OnStreamInterrupt, ProcessResult,
};
use crate::waiter::{CompletionPredicate, PollPolicy, StateWaiter};

/// Input of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub manifest: String,
    pub variables: BTreeMap<String, String>,
    pub options: ExecutionOptions,
}

/// What an execution did.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub mode: ExecutionMode,
    pub created: Vec<ClusterResource>,
    pub streamed: Option<ClusterResource>,
    pub states: Vec<LifecycleState>,
}

/// Mutable state of one execution. Built fresh for every run.
#[derive(Debug)]
pub struct ExecutionContext {
    mode: ExecutionMode,
    options: ExecutionOptions,
    manifest: Option<ManifestFile>,
    registry: ResourceRegistry,
    states: Vec<LifecycleState>,
    cleaned_up: bool,
}

impl ExecutionContext {
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            mode: options.mode(),
            options,
            manifest: None,
            registry: ResourceRegistry::new(),
            states: vec![LifecycleState::Idle],
            cleaned_up: false,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> LifecycleState {
        self.states
            .last()
            .copied()
            .unwrap_or(LifecycleState::Idle)
    }

    pub fn states(&self) -> &[LifecycleState] {
        &self.states
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn has_manifest(&self) -> bool {
        self.manifest.is_some()
    }

    fn advance(&mut self, state: LifecycleState) {
        debug!(from = ?self.state(), to = ?state, "Lifecycle transition");
        self.states.push(state);
    }
}

pub struct LifecycleController {
    invoker: Arc<dyn ProcessInvoker>,
    commands: KubectlCommands,
    retry: RetryPolicy,
    poll: PollPolicy,
    names: NameNormalization,
}

impl LifecycleController {
    pub fn new(invoker: Arc<dyn ProcessInvoker>, commands: KubectlCommands) -> Self {
        Self {
            invoker,
            commands,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            names: NameNormalization::default(),
        }
    }

    pub fn from_config(invoker: Arc<dyn ProcessInvoker>, config: &ClientConfig) -> Self {
        let commands = KubectlCommands::new(config.kubectl_command(), config.manifest_path())
            .with_follow_logs(config.logs.follow);
        Self::new(invoker, commands)
            .with_retry_policy(config.log_retry_policy())
            .with_poll_policy(config.poll_policy())
            .with_name_normalization(config.name_normalization())
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_name_normalization(mut self, names: NameNormalization) -> Self {
        self.names = names;
        self
    }

    pub fn commands(&self) -> &KubectlCommands {
        &self.commands
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.commands.manifest_path().to_path_buf()
    }

    fn streamer(&self) -> LogStreamer {
        LogStreamer::new(
            self.invoker.clone(),
            self.commands.clone(),
            self.retry.clone(),
        )
    }

    fn waiter(&self) -> StateWaiter {
        StateWaiter::new(self.invoker.clone(), self.commands.clone(), self.poll.clone())
    }

    /// Run one execution to completion.
    ///
    /// Streamed workload output is sent to `output`. Cancelling
    /// `termination` aborts the run; resources are still cleaned up.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        output: mpsc::Sender<LogMessage>,
        termination: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let mut ctx = ExecutionContext::new(request.options);
        info!(mode = %ctx.mode, "Starting execution");

        let rendered = render(&request.manifest, &request.variables);
        match self.drive(&mut ctx, &rendered, output, termination).await {
            Ok(report) => {
                info!(mode = %report.mode, "Execution finished");
                Ok(report)
            }
            Err(e) => {
                error!("Execution failed: {}", e);
                if matches!(e, Error::NoResourcesCreated) {
                    // Nothing exists in the cluster; only the file is ours.
                    self.discard_manifest(&mut ctx).await;
                } else {
                    self.cleanup(&mut ctx).await;
                }
                ctx.advance(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &mut ExecutionContext,
        rendered: &str,
        output: mpsc::Sender<LogMessage>,
        termination: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport {
            mode: ctx.mode,
            created: Vec::new(),
            streamed: None,
            states: Vec::new(),
        };

        match ctx.mode {
            ExecutionMode::CreateOnly => {
                self.write_manifest(ctx, rendered).await;
                self.create(ctx, termination).await?;
                report.created = ctx.registry.resources().to_vec();
                self.discard_manifest(ctx).await;
            }
            ExecutionMode::DeleteOnly => {
                // `delete -f` needs the manifest on disk; this is not a
                // lifecycle step of its own.
                self.store_manifest(ctx, rendered).await;
                self.cleanup(ctx).await;
            }
            ExecutionMode::FullCycle => {
                self.write_manifest(ctx, rendered).await;
                self.create(ctx, termination).await?;
                report.created = ctx.registry.resources().to_vec();

                let target = ctx
                    .registry
                    .select_for_streaming(ctx.options.resource_to_stream.as_ref())?;
                ctx.advance(LifecycleState::Streaming);
                self.follow(&ctx.options, &target, output, termination).await?;
                report.streamed = Some(target);

                self.cleanup(ctx).await;
            }
        }

        ctx.advance(LifecycleState::Done);
        report.states = ctx.states.clone();
        Ok(report)
    }

    async fn store_manifest(&self, ctx: &mut ExecutionContext, rendered: &str) -> bool {
        match ManifestFile::write(self.commands.manifest_path(), rendered).await {
            Ok(file) => {
                ctx.manifest = Some(file);
                true
            }
            Err(e) => {
                error!("Failed to write content to kubernetes manifest file: {}", e);
                ctx.manifest = None;
                false
            }
        }
    }

    /// Write the rendered manifest. A write failure is not fatal: the
    /// create call that follows fails on its own.
    pub(crate) async fn write_manifest(&self, ctx: &mut ExecutionContext, rendered: &str) {
        if self.store_manifest(ctx, rendered).await {
            ctx.advance(LifecycleState::ManifestWritten);
        }
    }

    async fn create(
        &self,
        ctx: &mut ExecutionContext,
        termination: &CancellationToken,
    ) -> Result<()> {
        info!("Creating Kubernetes resources from manifest.");
        let command = self.commands.create();
        let result = self.invoker.invoke(&command, termination).await?;

        if !result.success() {
            error!("Could not create the K8S resources successfully.");
            return Err(Error::NonZeroExit {
                command: command.join(" "),
                exit_code: result.exit_code,
                output: result.combined_output(),
            });
        }

        for resource in parse_created(&result.stdout, self.names)? {
            ctx.registry.record(resource);
        }
        ctx.advance(LifecycleState::Created);
        Ok(())
    }

    async fn follow(
        &self,
        options: &ExecutionOptions,
        target: &ClusterResource,
        output: mpsc::Sender<LogMessage>,
        termination: &CancellationToken,
    ) -> Result<()> {
        let outcome = if !options.stream_logs {
            info!("Log streaming disabled, waiting for {} to complete", target);
            self.waiter()
                .wait_for_state(target, options.completion, None, termination)
                .await
                .map(|_| ())
        } else if options.wait_for_completion {
            self.tail_until_complete(target, options.completion, output, termination)
                .await
        } else {
            info!("[Output from kubernetes resource {}:]", target.kind_name());
            let (sink, _attached) = OutputSink::new(target.clone(), output);
            self.streamer().stream_logs(&sink, termination).await
        };

        match outcome {
            Err(e)
                if e.is_interrupted()
                    && options.on_stream_interrupt == OnStreamInterrupt::TreatAsCompletion =>
            {
                warn!(
                    "Streaming of {} was interrupted; treating it as completion",
                    target
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Tail logs in a background task while polling status; stop the tailer
    /// once the resource reaches an accepted state.
    async fn tail_until_complete(
        &self,
        target: &ClusterResource,
        predicate: CompletionPredicate,
        output: mpsc::Sender<LogMessage>,
        termination: &CancellationToken,
    ) -> Result<()> {
        let (sink, attached) = OutputSink::new(target.clone(), output);
        let stop_tailer = termination.child_token();

        let tailer = {
            let streamer = self.streamer();
            let stop = stop_tailer.clone();
            tokio::spawn(async move { streamer.stream_logs(&sink, &stop).await })
        };

        let waited = self
            .waiter()
            .wait_for_state(target, predicate, Some(attached), termination)
            .await;
        stop_tailer.cancel();

        match tailer.await {
            Ok(Ok(())) => debug!("Log tailer for {} finished", target),
            Ok(Err(e)) if e.is_interrupted() => debug!("Log tailer for {} stopped", target),
            Ok(Err(e)) => warn!("Log tailer for {} failed: {}", target, e),
            Err(e) => warn!("Log tailer task for {} did not complete: {}", target, e),
        }

        waited.map(|state| info!("{} completed with state {:?}", target, state))
    }

    /// Delete everything the manifest describes and remove the manifest
    /// file. Idempotent; never fails.
    pub async fn cleanup(&self, ctx: &mut ExecutionContext) {
        if ctx.cleaned_up {
            debug!("Cleanup already performed");
            return;
        }
        ctx.cleaned_up = true;

        let command = self.commands.delete();
        match self.invoker.invoke(&command, &CancellationToken::new()).await {
            Ok(result) if result.success() => {
                info!("Successfully deleted K8S resources: {}", result.stdout);
            }
            Ok(result) if is_not_found(&result) => {
                debug!("Nothing to delete: {}", result.combined_output());
            }
            Ok(result) => warn!(
                exit_code = result.exit_code,
                "Failed to delete K8S resources: {}",
                result.combined_output()
            ),
            Err(e) => warn!("Failed to delete K8S resources: {}", e),
        }

        ctx.registry.clear();
        if let Some(manifest) = ctx.manifest.take() {
            manifest.remove().await;
        }
        ctx.advance(LifecycleState::Deleted);
    }

    async fn discard_manifest(&self, ctx: &mut ExecutionContext) {
        if let Some(manifest) = ctx.manifest.take() {
            manifest.remove().await;
        }
        ctx.cleaned_up = true;
    }
}

fn is_not_found(result: &ProcessResult) -> bool {
    let output = result.combined_output();
    output.contains("NotFound") || output.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ScriptedInvoker, exit};

    fn controller(invoker: &Arc<ScriptedInvoker>, dir: &std::path::Path) -> LifecycleController {
        LifecycleController::new(
            invoker.clone(),
            KubectlCommands::new("kubectl", dir.join("k8s-manifest.yml")),
        )
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new());
        let controller = controller(&invoker, dir.path());

        let mut ctx = ExecutionContext::new(ExecutionOptions::default());
        controller.write_manifest(&mut ctx, "kind: Pod\n").await;
        assert!(ctx.has_manifest());
        assert!(controller.manifest_path().exists());

        controller.cleanup(&mut ctx).await;
        controller.cleanup(&mut ctx).await;

        assert_eq!(invoker.count("delete"), 1);
        assert!(!ctx.has_manifest());
        assert!(!controller.manifest_path().exists());
        assert_eq!(
            ctx.states(),
            &[
                LifecycleState::Idle,
                LifecycleState::ManifestWritten,
                LifecycleState::Deleted
            ]
        );
    }

    #[tokio::test]
    async fn delete_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("delete", exit(1, "error: connection refused"));
        let controller = controller(&invoker, dir.path());

        let mut ctx = ExecutionContext::new(ExecutionOptions::default());
        controller.write_manifest(&mut ctx, "kind: Pod\n").await;
        controller.cleanup(&mut ctx).await;

        assert_eq!(ctx.state(), LifecycleState::Deleted);
        assert!(!controller.manifest_path().exists());
    }

    #[test]
    fn not_found_detection() {
        let result = ProcessResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Error from server (NotFound): jobs.batch \"pi\" not found".to_string(),
        };
        assert!(is_not_found(&result));
        assert!(!is_not_found(&exit(1, "forbidden")));
    }
}
