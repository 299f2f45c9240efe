//! Status polling until a resource reaches an accepted state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kubernetes::KubectlCommands;
use crate::process::ProcessInvoker;
use crate::types::ClusterResource;

/// Which status values end the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPredicate {
    #[default]
    Succeeded,
    SucceededOrActive,
}

/// The state that satisfied the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMatch {
    Succeeded,
    Active,
}

impl CompletionPredicate {
    pub fn evaluate(self, status: &str) -> Option<StateMatch> {
        let status = status.to_lowercase();
        if status.contains("succeeded") {
            Some(StateMatch::Succeeded)
        } else if self == CompletionPredicate::SucceededOrActive && status.contains("active") {
            Some(StateMatch::Active)
        } else {
            None
        }
    }
}

impl std::str::FromStr for CompletionPredicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut states: Vec<String> = s
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        states.sort();
        states.dedup();
        match states.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["succeeded"] => Ok(CompletionPredicate::Succeeded),
            ["active", "succeeded"] => Ok(CompletionPredicate::SucceededOrActive),
            _ => Err(Error::invalid_option(
                "COMPLETION_STATES",
                format!("expected 'succeeded' or 'succeeded,active', got '{}'", s),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_duration: Option<Duration>,
    /// Upper bound on waiting for a concurrent log tailer to attach once the
    /// resource has succeeded.
    pub attach_grace: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_duration: None,
            attach_grace: Duration::from_secs(3),
        }
    }
}

pub struct StateWaiter {
    invoker: Arc<dyn ProcessInvoker>,
    commands: KubectlCommands,
    policy: PollPolicy,
}

impl StateWaiter {
    pub fn new(
        invoker: Arc<dyn ProcessInvoker>,
        commands: KubectlCommands,
        policy: PollPolicy,
    ) -> Self {
        Self {
            invoker,
            commands,
            policy,
        }
    }

    /// Poll the status of `resource` until `predicate` accepts it.
    ///
    /// When `attached` is given and the resource succeeded, the wait also
    /// covers the tailer's first attachment (bounded by the attach grace) so
    /// stopping the tailer afterwards does not lose the output.
    pub async fn wait_for_state(
        &self,
        resource: &ClusterResource,
        predicate: CompletionPredicate,
        attached: Option<watch::Receiver<bool>>,
        cancel: &CancellationToken,
    ) -> Result<StateMatch> {
        let command = self.commands.get_status(resource);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.invoker.invoke(&command, cancel).await {
                Ok(result) if result.success() => {
                    debug!(status = %result.stdout, "Polled status of {}", resource);
                    if let Some(state) = predicate.evaluate(&result.stdout) {
                        info!("{} reached state {:?}", resource, state);
                        if state == StateMatch::Succeeded
                            && let Some(attached) = attached
                        {
                            self.await_attached(attached, cancel).await?;
                        }
                        return Ok(state);
                    }
                }
                Ok(result) => {
                    debug!(
                        attempt,
                        exit_code = result.exit_code,
                        "Status poll of {} failed: {}",
                        resource,
                        result.combined_output()
                    );
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => warn!(attempt, "Could not poll status of {}: {}", resource, e),
            }

            if let Some(max) = self.policy.max_duration
                && started.elapsed() >= max
            {
                return Err(Error::RetriesExhausted {
                    operation: format!("waiting for {} to complete", resource),
                    attempts: attempt,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::interrupted(format!("waiting for {} to complete", resource)));
                }
            }
        }
    }

    async fn await_attached(
        &self,
        mut attached: watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let grace = self.policy.attach_grace;
        let handshake = async move { attached.wait_for(|a| *a).await.is_ok() };

        tokio::select! {
            res = tokio::time::timeout(grace, handshake) => match res {
                Ok(true) => debug!("Log tailer attached"),
                Ok(false) => debug!("Log tailer finished before attaching"),
                Err(_) => warn!("Log tailer did not attach within {:?}", grace),
            },
            _ = cancel.cancelled() => {
                return Err(Error::interrupted("waiting for the log tailer to attach"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Scripted, ScriptedInvoker, exit};

    fn waiter(invoker: &Arc<ScriptedInvoker>, policy: PollPolicy) -> StateWaiter {
        StateWaiter::new(
            invoker.clone(),
            KubectlCommands::new("kubectl", "k8s-manifest.yml"),
            policy,
        )
    }

    fn job() -> ClusterResource {
        ClusterResource::new("job", "pi", "default")
    }

    #[test]
    fn predicates_match_case_insensitively() {
        let succeeded = r#"{"completionTime":"2024-01-01T00:00:00Z","Succeeded":1}"#;
        let active = r#"{"active":1,"startTime":"2024-01-01T00:00:00Z"}"#;
        assert_eq!(
            CompletionPredicate::Succeeded.evaluate(succeeded),
            Some(StateMatch::Succeeded)
        );
        assert_eq!(CompletionPredicate::Succeeded.evaluate(active), None);
        assert_eq!(
            CompletionPredicate::SucceededOrActive.evaluate(active),
            Some(StateMatch::Active)
        );
    }

    #[test]
    fn parses_completion_states() {
        assert_eq!(
            "succeeded".parse::<CompletionPredicate>().unwrap(),
            CompletionPredicate::Succeeded
        );
        assert_eq!(
            "Active, succeeded".parse::<CompletionPredicate>().unwrap(),
            CompletionPredicate::SucceededOrActive
        );
        assert!("failed".parse::<CompletionPredicate>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_succeeded() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("get", exit(0, r#"{"active":1}"#));
        invoker.script("get", exit(1, ""));
        invoker.script_response("get", Scripted::LaunchFailure);
        invoker.script("get", exit(0, r#"{"succeeded":1}"#));

        let started = Instant::now();
        let state = waiter(&invoker, PollPolicy::default())
            .wait_for_state(
                &job(),
                CompletionPredicate::Succeeded,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state, StateMatch::Succeeded);
        assert_eq!(invoker.count("get"), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn active_is_accepted_by_relaxed_predicate() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("get", exit(0, r#"{"active":1}"#));

        let state = waiter(&invoker, PollPolicy::default())
            .wait_for_state(
                &job(),
                CompletionPredicate::SucceededOrActive,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(state, StateMatch::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeded_waits_for_tailer_up_to_grace() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("get", exit(0, r#"{"succeeded":1}"#));
        let (_tx, rx) = watch::channel(false);

        let started = Instant::now();
        waiter(&invoker, PollPolicy::default())
            .wait_for_state(
                &job(),
                CompletionPredicate::Succeeded,
                Some(rx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn attached_tailer_skips_the_grace() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.script("get", exit(0, r#"{"succeeded":1}"#));
        let (tx, rx) = watch::channel(true);

        let started = Instant::now();
        waiter(&invoker, PollPolicy::default())
            .wait_for_state(
                &job(),
                CompletionPredicate::Succeeded,
                Some(rx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.default_response("get", Scripted::Exit(exit(0, r#"{"active":1}"#)));
        let policy = PollPolicy {
            max_duration: Some(Duration::from_secs(20)),
            ..PollPolicy::default()
        };

        let err = waiter(&invoker, policy)
            .wait_for_state(
                &job(),
                CompletionPredicate::Succeeded,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_polling() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.default_response("get", Scripted::Exit(exit(0, r#"{"active":1}"#)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let err = waiter(&invoker, PollPolicy::default())
            .wait_for_state(&job(), CompletionPredicate::Succeeded, None, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(invoker.count("get"), 3);
    }
}
