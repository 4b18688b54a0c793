//! Orchestrator
//!
//! Drives groups → batches → credential → client → decoder → resolver → sink
//! in a single logical pass. A failed batch degrades its own items and the
//! run continues; only pool-wide daily-quota exhaustion stops the run, and a
//! checkpoint is flushed first. Between batches the external stop signal is
//! honored cooperatively — no call in flight is ever interrupted.

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::{
    batching::{self, Batch, SplitOutcome},
    checkpoint::Checkpoint,
    client::{ChatBackend, InferenceClient, PromptOutcome},
    credentials::CredentialPool,
    decoder,
    error::{AppError, AppResult},
    model::{group_by_context, ClassifiedComment, CommentRecord, DecodeStatus, Label},
    prompt,
    resolver::LabelResolver,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchTally {
    pub succeeded: usize,
    pub refused: usize,
    pub decode_failed: usize,
    pub ambiguous: usize,
}

impl BatchTally {
    fn record(&mut self, result: &ClassifiedComment) {
        match result.label {
            Label::Anti | Label::Pro | Label::Unrelated => self.succeeded += 1,
            Label::Refused => self.refused += 1,
            Label::DecodeFailed => self.decode_failed += 1,
        }
        if result.ambiguous {
            self.ambiguous += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub labeled: usize,
    pub resumed: usize,
    pub succeeded: usize,
    pub refused: usize,
    pub decode_failed: usize,
    pub ambiguous: usize,
    pub unlabeled: usize,
    pub quota_exhausted: bool,
    pub stopped: bool,
}

pub struct RunReport {
    /// Results in input order; items never reached (stop/quota) are absent.
    pub results: Vec<ClassifiedComment>,
    pub summary: RunSummary,
}

pub struct RunSettings {
    pub batch_token_budget: usize,
    pub checkpoint_every: usize,
    pub checkpoint_path: PathBuf,
}

pub struct Orchestrator<B: ChatBackend> {
    client: InferenceClient<B>,
    pool: CredentialPool,
    resolver: LabelResolver,
    settings: RunSettings,
    stop: CancellationToken,
}

fn refused_comment(id: u64) -> ClassifiedComment {
    ClassifiedComment {
        id,
        label: Label::Refused,
        confidence: 0.0,
        ambiguous: false,
        decode_status: DecodeStatus::Refused,
    }
}

fn failed_comment(id: u64) -> ClassifiedComment {
    ClassifiedComment {
        id,
        label: Label::DecodeFailed,
        confidence: 0.0,
        ambiguous: true,
        decode_status: DecodeStatus::Placeholder,
    }
}

impl<B: ChatBackend> Orchestrator<B> {
    pub fn new(
        client: InferenceClient<B>,
        pool: CredentialPool,
        mut settings: RunSettings,
        stop: CancellationToken,
    ) -> Self {
        settings.checkpoint_every = settings.checkpoint_every.max(1);
        Self {
            client,
            pool,
            resolver: LabelResolver::new(),
            settings,
            stop,
        }
    }

    pub async fn run(
        &mut self,
        records: Vec<CommentRecord>,
        mut checkpoint: Checkpoint,
    ) -> AppResult<RunReport> {
        let total = records.len();
        let resumed = records.iter().filter(|r| checkpoint.contains(r.id)).count();
        if resumed > 0 {
            tracing::info!("resuming from checkpoint: {resumed} items already labeled");
        }

        let pending_records: Vec<CommentRecord> = records
            .iter()
            .filter(|r| !checkpoint.contains(r.id))
            .cloned()
            .collect();
        let groups = group_by_context(pending_records);
        let system = prompt::system_prompt();

        let mut batches_done = 0usize;
        let mut quota_exhausted = false;
        let mut stopped = false;

        'groups: for group in groups {
            let overhead = prompt::prompt_overhead(group.context.as_deref());
            let mut pending: VecDeque<Batch> = batching::build_batches(
                &group.items,
                self.settings.batch_token_budget,
                overhead,
            )
            .into();

            while let Some(batch) = pending.pop_front() {
                if self.stop.is_cancelled() {
                    tracing::info!("stop requested, flushing checkpoint and exiting");
                    stopped = true;
                    break 'groups;
                }

                let user_prompt = prompt::batch_prompt(group.context.as_deref(), &batch.items);
                let outcome = match self
                    .client
                    .classify(&mut self.pool, &system, &user_prompt, batch.estimated_tokens)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(AppError::QuotaExceeded) => {
                        quota_exhausted = true;
                        break 'groups;
                    }
                    Err(e) => return Err(e),
                };

                match outcome {
                    PromptOutcome::Completed(text) => {
                        let ids: Vec<u64> = batch.items.iter().map(|i| i.id).collect();
                        let decoded = decoder::decode(&text, &ids);

                        let mut tally = BatchTally::default();
                        for item in &batch.items {
                            let result = &decoded[&item.id];
                            let resolution = self.resolver.resolve(&item.text, result);
                            let classified = ClassifiedComment {
                                id: item.id,
                                label: resolution.label,
                                confidence: resolution.confidence,
                                ambiguous: resolution.ambiguous,
                                decode_status: result.strategy,
                            };
                            tally.record(&classified);
                            checkpoint.insert(classified);
                        }

                        batches_done += 1;
                        tracing::info!(
                            batch = batches_done,
                            items = batch.items.len(),
                            succeeded = tally.succeeded,
                            refused = tally.refused,
                            decode_failed = tally.decode_failed,
                            ambiguous = tally.ambiguous,
                            "batch finished"
                        );
                    }
                    PromptOutcome::Refused => {
                        for item in &batch.items {
                            checkpoint.insert(refused_comment(item.id));
                        }
                        batches_done += 1;
                        tracing::warn!(items = batch.items.len(), "batch refused by provider");
                    }
                    PromptOutcome::Oversized => {
                        match batching::split_on_reject(batch, overhead) {
                            SplitOutcome::Halves(a, b) => {
                                tracing::info!(
                                    left = a.items.len(),
                                    right = b.items.len(),
                                    "splitting rejected batch"
                                );
                                pending.push_front(b);
                                pending.push_front(a);
                            }
                            SplitOutcome::Truncated(t) => {
                                tracing::info!(id = t.items[0].id, "truncated oversized item");
                                pending.push_front(t);
                            }
                            SplitOutcome::Exhausted(b) => {
                                for item in &b.items {
                                    checkpoint.insert(failed_comment(item.id));
                                }
                                batches_done += 1;
                                tracing::warn!(
                                    id = b.items[0].id,
                                    "item still oversized after truncation, degraded"
                                );
                            }
                        }
                    }
                    PromptOutcome::Exhausted => {
                        for item in &batch.items {
                            checkpoint.insert(failed_comment(item.id));
                        }
                        batches_done += 1;
                        tracing::warn!(
                            items = batch.items.len(),
                            "batch degraded after retry exhaustion"
                        );
                    }
                }

                if batches_done > 0 && batches_done % self.settings.checkpoint_every == 0 {
                    checkpoint.save(&self.settings.checkpoint_path)?;
                    tracing::debug!(labeled = checkpoint.len(), "checkpoint flushed");
                }
            }
        }

        checkpoint.save(&self.settings.checkpoint_path)?;

        let results: Vec<ClassifiedComment> = records
            .iter()
            .filter_map(|r| checkpoint.get(r.id).cloned())
            .collect();

        let mut summary = RunSummary {
            total,
            labeled: results.len(),
            resumed,
            unlabeled: total - results.len(),
            quota_exhausted,
            stopped,
            ..RunSummary::default()
        };
        let mut tally = BatchTally::default();
        for result in &results {
            tally.record(result);
        }
        summary.succeeded = tally.succeeded;
        summary.refused = tally.refused;
        summary.decode_failed = tally.decode_failed;
        summary.ambiguous = tally.ambiguous;

        if quota_exhausted {
            tracing::error!(
                unlabeled = summary.unlabeled,
                "run aborted: all credentials exhausted their daily quota"
            );
        }

        Ok(RunReport { results, summary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app_config::QuotaLimits,
        client::ClientError,
        credentials::SystemClock,
        pacing::Pacer,
    };
    use std::{
        collections::VecDeque as Deque,
        path::PathBuf,
        sync::{Arc, Mutex},
    };

    #[derive(Clone)]
    struct ScriptedBackend {
        script: Arc<Mutex<Deque<Result<String, ClientError>>>>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<String, ClientError>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ChatBackend for ScriptedBackend {
        async fn complete(
            &self,
            _system: &str,
            user: &str,
            _api_key: &str,
        ) -> Result<String, ClientError> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("backend called more times than scripted")
        }
    }

    fn record(id: u64, text: &str, context_key: Option<&str>) -> CommentRecord {
        CommentRecord {
            id,
            text: text.to_string(),
            context_key: context_key.map(String::from),
        }
    }

    fn temp_checkpoint(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "stanceclerk-orch-{name}-{}.json",
            std::process::id()
        ))
    }

    fn orchestrator(
        backend: ScriptedBackend,
        rpd: u32,
        checkpoint_path: PathBuf,
    ) -> Orchestrator<ScriptedBackend> {
        let pool = CredentialPool::new(
            vec!["orch-key-a".into(), "orch-key-b".into()],
            QuotaLimits {
                requests_per_minute: 100,
                requests_per_day: rpd,
                tokens_per_minute: 1_000_000,
            },
            Arc::new(SystemClock),
        );
        let client = InferenceClient::new(backend, Pacer::new(1, 1_000_000), 3);
        Orchestrator::new(
            client,
            pool,
            RunSettings {
                batch_token_budget: 2_000,
                checkpoint_every: 10,
                checkpoint_path,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_run_labels_every_item() {
        let backend = ScriptedBackend::new(vec![
            Ok("1|ANTI\n2|PRO".into()),
            Ok("3|UNRELATED".into()),
        ]);
        let path = temp_checkpoint("happy");
        let mut orch = orchestrator(backend.clone(), 1000, path.clone());

        let records = vec![
            record(1, "down with it all", Some("post-a")),
            record(2, "love to see it", Some("post-a")),
            record(3, "nice weather today", None),
        ];
        let report = orch
            .run(records, Checkpoint::new("t".into()))
            .await
            .unwrap();

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[0].label, Label::Anti);
        assert_eq!(report.results[1].label, Label::Pro);
        assert_eq!(report.results[2].label, Label::Unrelated);
        assert_eq!(report.summary.succeeded, 3);
        assert_eq!(report.summary.unlabeled, 0);
        assert!(path.exists());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_refused_batch_degrades_without_aborting() {
        let backend = ScriptedBackend::new(vec![
            Err(ClientError::Blocked("policy".into())),
            Ok("3|PRO".into()),
        ]);
        let path = temp_checkpoint("refused");
        let mut orch = orchestrator(backend.clone(), 1000, path.clone());

        let records = vec![
            record(1, "first", Some("post-a")),
            record(2, "second", Some("post-a")),
            record(3, "third", Some("post-b")),
        ];
        let report = orch
            .run(records, Checkpoint::new("t".into()))
            .await
            .unwrap();

        assert_eq!(report.summary.refused, 2);
        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.results[0].decode_status, DecodeStatus::Refused);
        // Refused is terminal, never merged into the default class.
        assert_eq!(report.results[0].label, Label::Refused);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_resume_skips_already_labeled_items() {
        let backend = ScriptedBackend::new(vec![Ok("2|PRO".into())]);
        let path = temp_checkpoint("resume");
        let mut orch = orchestrator(backend.clone(), 1000, path.clone());

        let mut checkpoint = Checkpoint::new("t".into());
        checkpoint.insert(ClassifiedComment {
            id: 1,
            label: Label::Anti,
            confidence: 1.0,
            ambiguous: false,
            decode_status: DecodeStatus::Strict,
        });

        let records = vec![
            record(1, "already done", Some("post-a")),
            record(2, "still pending", Some("post-a")),
        ];
        let report = orch.run(records, checkpoint).await.unwrap();

        assert_eq!(report.summary.resumed, 1);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].label, Label::Anti);
        assert_eq!(report.results[1].label, Label::Pro);

        let prompts = backend.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].contains("1|already done"));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_oversized_batch_splits_and_recovers() {
        let backend = ScriptedBackend::new(vec![
            Err(ClientError::Oversized("too big".into())),
            Ok("1|ANTI".into()),
            Ok("2|PRO".into()),
        ]);
        let path = temp_checkpoint("split");
        let mut orch = orchestrator(backend.clone(), 1000, path.clone());

        let records = vec![
            record(1, "first comment", Some("post-a")),
            record(2, "second comment", Some("post-a")),
        ];
        let report = orch
            .run(records, Checkpoint::new("t".into()))
            .await
            .unwrap();

        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(backend.prompts.lock().unwrap().len(), 3);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_quota_exhaustion_flushes_and_reports() {
        let backend = ScriptedBackend::new(vec![Ok("1|ANTI".into()), Ok("2|PRO".into())]);
        let path = temp_checkpoint("quota");
        // Two credentials with one request each: the first two batches use
        // them up, the third finds the pool day-capped.
        let mut orch = orchestrator(backend.clone(), 1, path.clone());

        let records = vec![
            record(1, "first", Some("post-a")),
            record(2, "second", Some("post-b")),
            record(3, "third", Some("post-c")),
        ];
        let report = orch
            .run(records, Checkpoint::new("t".into()))
            .await
            .unwrap();

        assert!(report.summary.quota_exhausted);
        assert_eq!(report.summary.labeled, 2);
        assert_eq!(report.summary.unlabeled, 1);
        // Partial results were persisted before aborting.
        assert!(path.exists());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_stop_signal_exits_between_batches() {
        let backend = ScriptedBackend::new(vec![]);
        let path = temp_checkpoint("stop");
        let mut orch = orchestrator(backend.clone(), 1000, path.clone());
        orch.stop.cancel();

        let records = vec![record(1, "never sent", None)];
        let report = orch
            .run(records, Checkpoint::new("t".into()))
            .await
            .unwrap();

        assert!(report.summary.stopped);
        assert_eq!(report.summary.labeled, 0);
        assert!(backend.prompts.lock().unwrap().is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_every_item_reaches_a_terminal_state() {
        // One clean batch, one garbage response, one refusal: every item must
        // still end in one of the five terminal labels.
        let backend = ScriptedBackend::new(vec![
            Ok("1|ANTI\n2|PRO".into()),
            Ok("complete nonsense".into()),
            Err(ClientError::Blocked("policy".into())),
        ]);
        let path = temp_checkpoint("terminal");
        let mut orch = orchestrator(backend.clone(), 1000, path.clone());

        let records = vec![
            record(1, "first", Some("a")),
            record(2, "second", Some("a")),
            record(3, "third", Some("b")),
            record(4, "fourth", Some("c")),
        ];
        let report = orch
            .run(records, Checkpoint::new("t".into()))
            .await
            .unwrap();

        assert_eq!(report.results.len(), 4);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.decode_failed, 1);
        assert_eq!(report.summary.refused, 1);

        std::fs::remove_file(&path).ok();
    }
}
