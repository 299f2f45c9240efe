//! Log attachment with fixed-interval retries.
//!
//! Whether a workload is ready to produce logs cannot be observed from the
//! creation call, so `kubectl logs` itself is used as the readiness probe: a
//! non-zero exit means "not yet" (e.g. the container is still being created)
//! and the call is repeated after [`RetryPolicy::interval`]. A retry after
//! output already reached the sink resumes with `--since-time` so the stream
//! is not replayed from the start.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kubernetes::KubectlCommands;
use crate::process::{OutputSink, ProcessInvoker};
use crate::types::OutputStream;

/// Retry bounds for an operation that is expected to fail until the cluster
/// catches up. No backoff growth; unbounded unless limits are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_attempts: None,
            max_duration: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    fn exhausted(&self, attempt: u32, started: Instant) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
            || self.max_duration.is_some_and(|max| started.elapsed() >= max)
    }
}

#[derive(Clone)]
pub struct LogStreamer {
    invoker: Arc<dyn ProcessInvoker>,
    commands: KubectlCommands,
    policy: RetryPolicy,
}

impl LogStreamer {
    pub fn new(
        invoker: Arc<dyn ProcessInvoker>,
        commands: KubectlCommands,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            invoker,
            commands,
            policy,
        }
    }

    /// Stream the logs of the sink's resource until one `kubectl logs` call
    /// exits successfully.
    pub async fn stream_logs(&self, sink: &OutputSink, cancel: &CancellationToken) -> Result<()> {
        let resource = sink.resource().clone();
        let started = Instant::now();
        let mut attempt = 0u32;

        debug!("Log streaming of {} started", resource);
        loop {
            attempt += 1;

            // Once output reached the sink, a retry resumes after it.
            let command = match sink.last_forwarded() {
                Some(since) => {
                    info!("Resuming log streaming of {} from {}", resource, since);
                    self.commands.logs_since(&resource, since)
                }
                None => self.commands.logs(&resource),
            };

            match self.invoker.attach(&command, sink, cancel).await {
                Ok(result) if result.success() => {
                    sink.mark_attached();
                    for line in result.stderr.lines() {
                        sink.send(OutputStream::Stderr, line.to_string()).await;
                    }
                    info!("[End of output from {}]", resource.kind_name());
                    return Ok(());
                }
                Ok(result) => {
                    debug!(
                        attempt,
                        exit_code = result.exit_code,
                        stderr = %result.stderr,
                        "{} is not ready for log streaming",
                        resource
                    );
                }
                Err(e) if e.is_interrupted() => {
                    warn!(
                        "Interrupted while streaming logs of {}. Stopping log streaming.",
                        resource
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, "Error when streaming logs of {}: {}", resource, e);
                }
            }

            if self.policy.exhausted(attempt, started) {
                return Err(Error::RetriesExhausted {
                    operation: format!("streaming logs of {}", resource),
                    attempts: attempt,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {}
                _ = cancel.cancelled() => {
                    warn!(
                        "Interrupted while waiting to stream logs of {}. Stopping log streaming.",
                        resource
                    );
                    return Err(Error::interrupted(format!("waiting for logs of {}", resource)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Scripted, ScriptedInvoker, exit};
    use crate::types::{ClusterResource, LogMessage, ProcessResult};
    use tokio::sync::mpsc;

    fn setup(
        invoker: &Arc<ScriptedInvoker>,
        policy: RetryPolicy,
    ) -> (
        LogStreamer,
        OutputSink,
        tokio::sync::watch::Receiver<bool>,
        mpsc::Receiver<LogMessage>,
    ) {
        let streamer = LogStreamer::new(
            invoker.clone(),
            KubectlCommands::new("kubectl", "k8s-manifest.yml"),
            policy,
        );
        let (tx, rx) = mpsc::channel(64);
        let (sink, attached) = OutputSink::new(ClusterResource::new("job", "pi", "default"), tx);
        (streamer, sink, attached, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_logs_are_available() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("logs", exit(1, ""));
        invoker.script("logs", exit(1, ""));
        invoker.script("logs", exit(0, "3.14159"));
        let (streamer, sink, attached, mut rx) = setup(&invoker, RetryPolicy::default());

        let started = Instant::now();
        streamer
            .stream_logs(&sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(invoker.count("logs"), 3);
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert!(*attached.borrow());
        assert_eq!(rx.recv().await.unwrap().line, "3.14159");
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failures_are_transient() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script_response("logs", Scripted::LaunchFailure);
        invoker.script("logs", exit(0, ""));
        let (streamer, sink, _attached, _rx) = setup(&invoker, RetryPolicy::default());

        streamer
            .stream_logs(&sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(invoker.count("logs"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stderr_is_forwarded_only_on_success() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script(
            "logs",
            ProcessResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "container \"pi\" is waiting to start: ContainerCreating".to_string(),
            },
        );
        invoker.script(
            "logs",
            ProcessResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: "warning: deprecated".to_string(),
            },
        );
        let (streamer, sink, _attached, mut rx) = setup(&invoker, RetryPolicy::default());

        streamer
            .stream_logs(&sink, &CancellationToken::new())
            .await
            .unwrap();
        drop(sink);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.stream, OutputStream::Stderr);
        assert_eq!(msg.line, "warning: deprecated");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.default_response("logs", Scripted::Exit(exit(1, "")));
        let (streamer, sink, _attached, _rx) =
            setup(&invoker, RetryPolicy::default().with_max_attempts(4));

        let err = streamer
            .stream_logs(&sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(invoker.count("logs"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_duration() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.default_response("logs", Scripted::Exit(exit(1, "")));
        let (streamer, sink, _attached, _rx) = setup(
            &invoker,
            RetryPolicy::default().with_max_duration(Duration::from_secs(10)),
        );

        let err = streamer
            .stream_logs(&sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { .. }));
        assert_eq!(invoker.count("logs"), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.default_response("logs", Scripted::Hang);
        let (streamer, sink, _attached, _rx) = setup(&invoker, RetryPolicy::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let err = streamer.stream_logs(&sink, &cancel).await.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(invoker.count("logs"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_resumes_after_forwarded_output() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("logs", exit(1, "partial-line"));
        invoker.script("logs", exit(0, "full-line"));
        let (streamer, sink, attached, mut rx) = setup(&invoker, RetryPolicy::default());

        streamer
            .stream_logs(&sink, &CancellationToken::new())
            .await
            .unwrap();
        drop(sink);

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].iter().any(|a| a.starts_with("--since-time")));
        assert!(calls[1].last().unwrap().starts_with("--since-time="));
        assert!(*attached.borrow());

        let mut lines = Vec::new();
        while let Some(msg) = rx.recv().await {
            lines.push(msg.line);
        }
        assert_eq!(lines, vec!["partial-line", "full-line"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_does_not_attach() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("logs", exit(1, "partial-line"));
        invoker.default_response("logs", Scripted::Hang);
        let (streamer, sink, attached, _rx) = setup(&invoker, RetryPolicy::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let err = streamer.stream_logs(&sink, &cancel).await.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(invoker.count("logs"), 2);
        assert!(sink.last_forwarded().is_some());
        assert!(!*attached.borrow());
    }
}
