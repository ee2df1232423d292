use crate::core::config::BatchConfig;
use crate::core::error::BatchError;
use crate::core::state::BatchProgress;
use crate::core::store::ProjectStore;
use crate::services::generation::GenerationClient;
use crate::services::prompts;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Retries after the first attempt; an entry gets `max_retries + 1` attempts.
    pub max_retries: u32,
    /// Base backoff, multiplied by the number of failed attempts so far.
    pub retry_delay: Duration,
    /// Pause after a written episode when more entries remain.
    pub pacing_delay: Duration,
}

impl From<&BatchConfig> for BatchPolicy {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            pacing_delay: config.pacing_delay(),
        }
    }
}

impl BatchPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before the attempt after failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Skip the failed entry and go on with the next one.
    Continue,
    /// Stop the batch, keeping everything written so far.
    Abort,
}

/// Raised when an entry ran out of attempts. The batch waits until it is answered.
#[derive(Debug)]
pub struct DecisionRequest {
    pub number: u32,
    /// Entries after this one that have not been processed yet.
    pub remaining: usize,
    responder: oneshot::Sender<Decision>,
}

impl DecisionRequest {
    pub fn respond(self, decision: Decision) {
        // A closed channel means the batch is gone already.
        let _ = self.responder.send(decision);
    }
}

#[derive(Debug)]
pub enum BatchEvent {
    Started { total: usize },
    Progress(BatchProgress),
    EpisodeWritten { number: u32 },
    AttemptFailed { number: u32, attempt: u32, kind: &'static str },
    DecisionRequired(DecisionRequest),
    Finished(BatchReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub written: Vec<u32>,
    pub skipped: Vec<u32>,
    pub aborted: bool,
    pub progress: BatchProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing was pending; no calls were made.
    AllComplete,
    Ran(BatchReport),
}

enum EntryOutcome {
    Written,
    Exhausted,
    /// The entry was removed from the plan while the batch was running.
    Vanished,
}

/// Writes every pending episode, one at a time, in plan order.
pub struct BatchRunner {
    client: GenerationClient,
    store: ProjectStore,
    policy: BatchPolicy,
}

impl BatchRunner {
    pub fn new(client: GenerationClient, store: ProjectStore, policy: BatchPolicy) -> Self {
        Self { client, store, policy }
    }

    /// Runs one batch over the entries that have no text yet.
    ///
    /// Each written episode is committed to the store before the next entry is
    /// attempted. When an entry exhausts its attempts a [`BatchEvent::DecisionRequired`]
    /// is sent and the run suspends until it is answered; a dropped request or a
    /// closed event channel counts as [`Decision::Abort`].
    pub async fn run(&self, events: mpsc::UnboundedSender<BatchEvent>) -> Result<BatchOutcome, BatchError> {
        self.client.check_credential().map_err(BatchError::Configuration)?;

        let pending = self.store.read(|p| p.pending_numbers());
        if pending.is_empty() {
            if self.store.batch_progress().is_some() {
                return Err(BatchError::AlreadyRunning);
            }
            info!("All planned episodes are written, nothing to do");
            return Ok(BatchOutcome::AllComplete);
        }
        if !self.store.begin_batch(pending.len()) {
            return Err(BatchError::AlreadyRunning);
        }

        let result = self.process(&pending, &events).await;
        self.store.end_batch();
        result.map(BatchOutcome::Ran)
    }

    async fn process(
        &self,
        pending: &[u32],
        events: &mpsc::UnboundedSender<BatchEvent>,
    ) -> Result<BatchReport, BatchError> {
        let total = pending.len();
        let mut report = BatchReport {
            written: Vec::new(),
            skipped: Vec::new(),
            aborted: false,
            progress: BatchProgress { current: 0, total },
        };

        info!("Starting batch: {} episodes pending {:?}", total, pending);
        let _ = events.send(BatchEvent::Started { total });
        let _ = events.send(BatchEvent::Progress(report.progress));

        for (index, &number) in pending.iter().enumerate() {
            let remaining = total - index - 1;
            let written = match self.generate_entry(number, events).await? {
                EntryOutcome::Written => {
                    report.written.push(number);
                    true
                }
                EntryOutcome::Vanished => {
                    warn!("Episode {} is no longer in the plan, skipping", number);
                    report.skipped.push(number);
                    false
                }
                EntryOutcome::Exhausted => match self.ask(number, remaining, events).await {
                    Decision::Continue => {
                        info!("Skipping episode {}", number);
                        report.skipped.push(number);
                        false
                    }
                    Decision::Abort => {
                        info!("Batch aborted at episode {}", number);
                        report.aborted = true;
                        let _ = events.send(BatchEvent::Progress(report.progress));
                        break;
                    }
                },
            };

            report.progress.current += 1;
            self.store.set_batch_progress(report.progress);
            let _ = events.send(BatchEvent::Progress(report.progress));

            if written && remaining > 0 {
                tokio::time::sleep(self.policy.pacing_delay).await;
            }
        }

        info!(
            "Batch finished: {} written, {} skipped{}",
            report.written.len(),
            report.skipped.len(),
            if report.aborted { ", aborted" } else { "" }
        );
        let _ = events.send(BatchEvent::Finished(report.clone()));
        Ok(report)
    }

    async fn generate_entry(
        &self,
        number: u32,
        events: &mpsc::UnboundedSender<BatchEvent>,
    ) -> Result<EntryOutcome, BatchError> {
        let max_attempts = self.policy.max_attempts();

        for attempt in 1..=max_attempts {
            // Rebuilt each attempt from the committed store; identical inputs give an identical prompt.
            let request = self.store.read(|p| {
                p.episode_plan().get(number).map(|entry| {
                    prompts::episode_script(p.outline(), p.characters(), entry, p.previous_content(number))
                })
            });
            let Some(request) = request else {
                return Ok(EntryOutcome::Vanished);
            };

            match self.client.text(&request).await {
                Ok(text) => {
                    self.store
                        .update(|p| p.put_episode(number, text))
                        .await
                        .map_err(BatchError::Fatal)?;
                    info!("Episode {} written (attempt {})", number, attempt);
                    let _ = events.send(BatchEvent::EpisodeWritten { number });
                    return Ok(EntryOutcome::Written);
                }
                Err(e) => {
                    warn!(
                        "Episode {} attempt {}/{} failed [{}]: {}",
                        number,
                        attempt,
                        max_attempts,
                        e.kind(),
                        e
                    );
                    let _ = events.send(BatchEvent::AttemptFailed {
                        number,
                        attempt,
                        kind: e.kind(),
                    });
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        Ok(EntryOutcome::Exhausted)
    }

    async fn ask(&self, number: u32, remaining: usize, events: &mpsc::UnboundedSender<BatchEvent>) -> Decision {
        let (responder, answer) = oneshot::channel();
        let request = DecisionRequest {
            number,
            remaining,
            responder,
        };
        if events.send(BatchEvent::DecisionRequired(request)).is_err() {
            warn!("Nobody is listening for batch decisions, aborting");
            return Decision::Abort;
        }
        answer.await.unwrap_or(Decision::Abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GenerationError;
    use crate::core::io::tests::FlakyStorage;
    use crate::core::plan::EpisodePlanEntry;
    use crate::core::state::Project;
    use crate::services::generation::tests::{text_response, ScriptedLlm};
    use crate::services::llm::{GenerationRequest, LlmClient, RawResponse};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    fn project(plan_len: u32, written: &[u32]) -> Project {
        let mut project = Project::default();
        project.set_outline("一个关于记忆的故事");
        let entries = (1..=plan_len)
            .map(|n| EpisodePlanEntry::new(n, format!("第{}集", n), format!("摘要{}", n)))
            .collect();
        project.replace_plan(entries).unwrap();
        for &n in written {
            project.put_episode(n, format!("已有剧本{}", n));
        }
        project
    }

    fn fail() -> Result<RawResponse, GenerationError> {
        Err(GenerationError::Transport("503 Service Unavailable".to_string()))
    }

    fn runner(llm: Arc<dyn LlmClient>, store: &ProjectStore) -> BatchRunner {
        BatchRunner::new(
            GenerationClient::new(llm, Some("key".to_string())),
            store.clone(),
            BatchPolicy::default(),
        )
    }

    #[derive(Debug, Default)]
    struct Observed {
        progress: Vec<BatchProgress>,
        decisions: Vec<(u32, usize)>,
        failures: Vec<(u32, u32, &'static str)>,
        written: Vec<u32>,
        finished: Option<BatchReport>,
    }

    /// Drains events, answering decision requests from `answers` in order.
    fn observe(mut rx: mpsc::UnboundedReceiver<BatchEvent>, answers: Vec<Decision>) -> JoinHandle<Observed> {
        tokio::spawn(async move {
            let mut seen = Observed::default();
            let mut answers = answers.into_iter();
            while let Some(event) = rx.recv().await {
                match event {
                    BatchEvent::Started { .. } => {}
                    BatchEvent::Progress(p) => seen.progress.push(p),
                    BatchEvent::EpisodeWritten { number } => seen.written.push(number),
                    BatchEvent::AttemptFailed { number, attempt, kind } => seen.failures.push((number, attempt, kind)),
                    BatchEvent::DecisionRequired(request) => {
                        seen.decisions.push((request.number, request.remaining));
                        if let Some(decision) = answers.next() {
                            request.respond(decision);
                        }
                    }
                    BatchEvent::Finished(report) => seen.finished = Some(report),
                }
            }
            seen
        })
    }

    async fn run_batch(runner: &BatchRunner, answers: Vec<Decision>) -> (Result<BatchOutcome, BatchError>, Observed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = observe(rx, answers);
        let outcome = runner.run(tx).await;
        (outcome, handle.await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_only_missing_entries() {
        let store = ProjectStore::new(project(4, &[1, 2]));
        let llm = Arc::new(ScriptedLlm::new(vec![text_response("剧本3"), text_response("剧本4")]));

        let (outcome, seen) = run_batch(&runner(llm.clone(), &store), vec![]).await;

        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch run");
        };
        assert_eq!(report.written, vec![3, 4]);
        assert_eq!(report.progress, BatchProgress { current: 2, total: 2 });
        assert_eq!(seen.written, vec![3, 4]);
        assert_eq!(store.read(|p| p.episodes().keys().copied().collect::<Vec<_>>()), vec![1, 2, 3, 4]);
        assert_eq!(store.read(|p| p.episode(3).map(str::to_string)), Some("剧本3".to_string()));
        assert!(store.batch_progress().is_none());

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("已有剧本2"));
        assert!(prompts[1].contains("剧本3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded_then_decision_required() {
        let store = ProjectStore::new(project(2, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![fail(), fail(), fail(), text_response("剧本2")]));

        let started = Instant::now();
        let (outcome, seen) = run_batch(&runner(llm.clone(), &store), vec![Decision::Continue]).await;

        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch run");
        };
        assert_eq!(seen.failures, vec![(1, 1, "transport"), (1, 2, "transport"), (1, 3, "transport")]);
        assert_eq!(seen.decisions, vec![(1, 1)]);
        assert_eq!(report.skipped, vec![1]);
        assert_eq!(report.written, vec![2]);
        // Backoff of 3s then 6s; no pacing after the final entry.
        assert_eq!(started.elapsed(), Duration::from_secs(9));

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 4);
        assert_eq!(prompts[0], prompts[1]);
        assert_eq!(prompts[1], prompts[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_needs_no_decision() {
        let store = ProjectStore::new(project(1, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(RawResponse::default()),
            text_response("剧本1"),
        ]));

        let (outcome, seen) = run_batch(&runner(llm, &store), vec![]).await;

        assert!(matches!(outcome.unwrap(), BatchOutcome::Ran(_)));
        assert!(seen.decisions.is_empty());
        assert_eq!(seen.failures.len(), 1);
        assert_eq!(seen.failures[0].2, "empty_output");
        assert!(store.read(|p| p.episode(1).is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_keeps_order_and_accounting() {
        let store = ProjectStore::new(project(5, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![
            text_response("剧本1"),
            text_response("剧本2"),
            fail(),
            fail(),
            fail(),
            text_response("剧本4"),
            text_response("剧本5"),
        ]));

        let (outcome, seen) = run_batch(&runner(llm, &store), vec![Decision::Continue]).await;

        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch run");
        };
        assert_eq!(store.read(|p| p.episodes().keys().copied().collect::<Vec<_>>()), vec![1, 2, 4, 5]);
        assert_eq!(seen.decisions, vec![(3, 2)]);
        assert_eq!(report.progress, BatchProgress { current: 5, total: 5 });
        assert_eq!(seen.progress.last(), Some(&BatchProgress { current: 5, total: 5 }));
        assert_eq!(report.skipped, vec![3]);
        assert!(!report.aborted);
        assert_eq!(seen.finished, Some(report));
        assert_eq!(store.read(|p| p.pending_numbers()), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_preserves_written_episodes() {
        let store = ProjectStore::new(project(4, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![text_response("剧本1"), fail(), fail(), fail()]));

        let (outcome, seen) = run_batch(&runner(llm.clone(), &store), vec![Decision::Abort]).await;

        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch run");
        };
        assert!(report.aborted);
        assert_eq!(report.written, vec![1]);
        assert_eq!(report.progress, BatchProgress { current: 1, total: 4 });
        assert_eq!(seen.decisions, vec![(2, 2)]);
        assert_eq!(llm.prompts.lock().unwrap().len(), 4);
        assert_eq!(store.read(|p| p.pending_numbers()), vec![2, 3, 4]);
        assert!(store.batch_progress().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_decision_aborts() {
        let store = ProjectStore::new(project(2, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![fail(), fail(), fail()]));

        // No answers scripted: the request is dropped by the observer.
        let (outcome, _) = run_batch(&runner(llm, &store), vec![]).await;

        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch run");
        };
        assert!(report.aborted);
        assert!(report.written.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_successes() {
        let store = ProjectStore::new(project(3, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![text_response("a"), text_response("b"), text_response("c")]));

        let started = Instant::now();
        let (outcome, _) = run_batch(&runner(llm, &store), vec![]).await;

        assert!(outcome.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_nothing_pending_reports_all_complete() {
        let store = ProjectStore::new(project(2, &[1, 2]));
        let llm = Arc::new(ScriptedLlm::new(vec![]));

        let (outcome, seen) = run_batch(&runner(llm.clone(), &store), vec![]).await;

        assert_eq!(outcome.unwrap(), BatchOutcome::AllComplete);
        assert!(seen.progress.is_empty());
        assert!(llm.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_to_start_twice() {
        let store = ProjectStore::new(project(2, &[]));
        assert!(store.begin_batch(2));
        let llm = Arc::new(ScriptedLlm::new(vec![]));

        let (outcome, _) = run_batch(&runner(llm.clone(), &store), vec![]).await;

        assert!(matches!(outcome, Err(BatchError::AlreadyRunning)));
        assert!(llm.prompts.lock().unwrap().is_empty());
        // The guard belongs to the other run.
        assert!(store.batch_progress().is_some());
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_start() {
        let store = ProjectStore::new(project(2, &[]));
        let llm = Arc::new(ScriptedLlm::new(vec![text_response("unused")]));
        let runner = BatchRunner::new(GenerationClient::new(llm.clone(), None), store.clone(), BatchPolicy::default());

        let (outcome, seen) = run_batch(&runner, vec![]).await;

        assert!(matches!(outcome, Err(BatchError::Configuration(GenerationError::Configuration(_)))));
        assert!(seen.progress.is_empty());
        assert!(llm.prompts.lock().unwrap().is_empty());
        assert!(store.batch_progress().is_none());
    }

    /// Records which episodes are committed each time it is called.
    struct ObservingLlm {
        store: ProjectStore,
        seen: Mutex<Vec<Vec<u32>>>,
    }

    impl std::fmt::Debug for ObservingLlm {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ObservingLlm").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl LlmClient for ObservingLlm {
        async fn generate(&self, _api_key: &str, _request: &GenerationRequest) -> Result<RawResponse, GenerationError> {
            let keys: Vec<u32> = self.store.read(|p| p.episodes().keys().copied().collect());
            self.seen.lock().unwrap().push(keys);
            text_response("剧本")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_episode_is_visible_before_the_next_attempt() {
        let store = ProjectStore::new(project(4, &[]));
        let llm = Arc::new(ObservingLlm {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });

        let (outcome, _) = run_batch(&runner(llm.clone(), &store), vec![]).await;

        assert!(outcome.is_ok());
        let seen = llm.seen.lock().unwrap();
        assert_eq!(*seen, vec![vec![], vec![1], vec![1, 2], vec![1, 2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_fatal() {
        let storage = Arc::new(FlakyStorage::default());
        let store = ProjectStore::open(storage.clone(), "project.json").await.unwrap();
        let seeded = project(3, &[]);
        store
            .update(|p| {
                p.set_outline(seeded.outline());
                p.replace_plan(seeded.episode_plan().entries().to_vec())
            })
            .await
            .unwrap()
            .unwrap();
        storage.set_broken(true);

        let llm = Arc::new(ScriptedLlm::new(vec![text_response("剧本1"), text_response("剧本2")]));
        let (outcome, seen) = run_batch(&runner(llm.clone(), &store), vec![]).await;

        assert!(matches!(outcome, Err(BatchError::Fatal(_))));
        assert!(seen.decisions.is_empty());
        assert!(seen.finished.is_none());
        assert_eq!(llm.prompts.lock().unwrap().len(), 1);
        assert!(store.batch_progress().is_none());
    }

    #[test]
    fn test_policy_saturates_on_extreme_values() {
        let policy = BatchPolicy {
            max_retries: u32::MAX,
            retry_delay: Duration::MAX,
            pacing_delay: Duration::ZERO,
        };
        assert_eq!(policy.max_attempts(), u32::MAX);
        assert_eq!(policy.backoff(1), Duration::MAX);
        assert_eq!(policy.backoff(3), Duration::MAX);

        let policy = BatchPolicy::default();
        assert_eq!(policy.max_attempts(), policy.max_retries + 1);
        assert_eq!(policy.backoff(2), policy.retry_delay * 2);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = BatchPolicy::from(&BatchConfig {
            max_retries: 4,
            retry_delay_ms: 500,
            pacing_delay_ms: 1200,
        });
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.retry_delay, Duration::from_millis(500));
        assert_eq!(policy.pacing_delay, Duration::from_millis(1200));
    }
}
