use crate::{
    dedup::DedupStore,
    enrich::{DetailEnricher, EnrichError},
    guard::{Pause, ResilienceGuard},
    images::ImageStore,
    judge::{Judge, MARKER_NOT_CONFIGURED, MARKER_SKIPPED},
    models::{
        DetailRecord, Judgement, LedgerEntry, Listing, ListingKey, NotificationEvent, StageReport,
        Task, TaskRunSummary,
    },
    notify::NotificationFanout,
    source::{ListingSource, SourceError},
};
use serde_json::{Value, json};
use std::{future::Future, path::PathBuf, sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

const SKIP_REASON: &str = "AI analysis skipped by operator; notifying directly";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub ledger_dir: PathBuf,
    pub skip_ai: bool,
    pub pc_url_to_mobile: bool,
    pub task_timeout: Duration,
}

/// Everything one task needs for a run. Each task gets its own instance, so
/// no two runners ever share a ledger, guard, or scratch directory.
pub struct TaskRunner {
    source: Box<dyn ListingSource>,
    enricher: Box<dyn DetailEnricher>,
    judge: Arc<dyn Judge>,
    fanout: Arc<NotificationFanout>,
    guard: Arc<ResilienceGuard>,
    images: ImageStore,
    options: RunnerOptions,
}

enum ListingOutcome {
    Recorded { notified: bool },
    Skipped,
}

impl TaskRunner {
    pub fn new(
        source: Box<dyn ListingSource>,
        enricher: Box<dyn DetailEnricher>,
        judge: Arc<dyn Judge>,
        fanout: Arc<NotificationFanout>,
        guard: Arc<ResilienceGuard>,
        images: ImageStore,
        options: RunnerOptions,
    ) -> Self {
        Self {
            source,
            enricher,
            judge,
            fanout,
            guard,
            images,
            options,
        }
    }

    pub fn guard(&self) -> &ResilienceGuard {
        &self.guard
    }

    /// One complete pass over `task`. The scratch image directory is removed
    /// whether the run succeeds, fails, or times out.
    ///
    /// A confirmed challenge is cooled down after the run has stopped, outside
    /// the task timeout; only shutdown cuts the cooldown short.
    pub async fn run(&self, task: &Task) -> Result<TaskRunSummary, TaskError> {
        self.guard.reset();
        let outcome = tokio::time::timeout(self.options.task_timeout, self.run_inner(task)).await;
        self.images.cleanup().await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(TaskError::new(
                TaskErrorKind::Timeout,
                "run",
                format!("exceeded {}s", self.options.task_timeout.as_secs()),
            )),
        };
        match result {
            Err(err) if matches!(err.kind(), TaskErrorKind::BotChallenge | TaskErrorKind::AccountRisk) => {
                let confirmed = self.guard.confirm_bot_challenge(err.detail()).await;
                Err(TaskError::new(err.kind(), err.stage(), confirmed.to_string()))
            }
            other => other,
        }
    }

    async fn run_inner(&self, task: &Task) -> Result<TaskRunSummary, TaskError> {
        if task.keyword.trim().is_empty() {
            return Err(TaskError::config("validate", "task keyword is empty"));
        }
        let mut stages = Vec::new();
        let mut summary = TaskRunSummary {
            task_name: task.task_name.clone(),
            ..TaskRunSummary::default()
        };

        let mut ledger = self
            .capture_stage("load_ledger", &mut stages, async {
                let store = DedupStore::load(&self.options.ledger_dir, &task.keyword)
                    .await
                    .map_err(|err| TaskError::new(TaskErrorKind::Ledger, "load_ledger", err.to_string()))?;
                let output = json!({ "path": store.path().display().to_string(), "seen": store.len() });
                Ok::<_, TaskError>(StageOutcome::new(store, output))
            })
            .await?;

        'pages: for page_no in 1..=task.max_pages.max(1) {
            if page_no > 1 {
                self.guard.pause(Pause::PageTurn).await;
            }
            let page = self
                .capture_stage("search", &mut stages, async {
                    let page = self
                        .source
                        .fetch(task, page_no)
                        .await
                        .map_err(|err| self.search_failure(err))?;
                    let output = json!({
                        "page": page_no,
                        "source": self.source.name(),
                        "listings": page.listings.len(),
                    });
                    Ok::<_, TaskError>(StageOutcome::new(page, output))
                })
                .await?;
            if page.listings.is_empty() {
                info!(target = "argus.pipeline", task = %task.task_name, page = page_no, "no_more_listings");
                break;
            }

            for listing in page.listings {
                let key = ListingKey::from_link(&listing.link);
                if !ledger.is_new(&key) {
                    summary.already_seen += 1;
                    crate::metrics::listing_outcome("already_seen");
                    continue;
                }
                if task.debug_limit > 0 && summary.processed >= task.debug_limit {
                    info!(
                        target = "argus.pipeline",
                        task = %task.task_name,
                        limit = task.debug_limit,
                        "debug_limit_reached"
                    );
                    break 'pages;
                }

                self.guard.pause(Pause::Item).await;
                match self.process_listing(task, listing, &mut ledger, &mut stages).await? {
                    ListingOutcome::Recorded { notified } => {
                        summary.processed += 1;
                        if notified {
                            summary.notified += 1;
                        }
                    }
                    ListingOutcome::Skipped => summary.skipped += 1,
                }
                self.guard.pause(Pause::PostItem).await;
            }
        }

        info!(
            target = "argus.pipeline",
            task = %task.task_name,
            processed = summary.processed,
            already_seen = summary.already_seen,
            skipped = summary.skipped,
            notified = summary.notified,
            "task_run_finished"
        );
        summary.stages = stages;
        Ok(summary)
    }

    async fn process_listing(
        &self,
        task: &Task,
        listing: Listing,
        ledger: &mut DedupStore,
        stages: &mut Vec<StageReport>,
    ) -> Result<ListingOutcome, TaskError> {
        let enriched = self
            .capture_stage("enrich", stages, async {
                let outcome = self.enricher.enrich(task, &listing).await;
                let output = json!({ "id": listing.id, "ok": outcome.is_ok() });
                Ok(StageOutcome::new(outcome, output))
            })
            .await?;
        let record = match enriched {
            Ok(record) => record,
            Err(EnrichError::AccountRisk(marker)) => {
                return Err(TaskError::new(TaskErrorKind::AccountRisk, "enrich", marker));
            }
            Err(err) => {
                warn!(target = "argus.pipeline", link = %listing.link, error = %err, "listing_skipped");
                crate::metrics::listing_outcome("skipped");
                return Ok(ListingOutcome::Skipped);
            }
        };

        let judgement = self
            .capture_stage("judge", stages, async {
                let judgement = self.judge_record(task, &record).await;
                let output = match &judgement {
                    Judgement::Verdict { verdict } => json!({
                        "validated": verdict.validated,
                        "recommended": verdict.is_recommended(),
                        "risk_tags": verdict.risk_tags(),
                    }),
                    Judgement::Error { error_marker } => json!({ "error_marker": error_marker }),
                };
                Ok(StageOutcome::new(judgement, output))
            })
            .await?;

        let reason = match &judgement {
            Judgement::Verdict { verdict } if verdict.is_recommended() => Some(verdict.reason()),
            Judgement::Error { error_marker } if error_marker == MARKER_SKIPPED => Some(SKIP_REASON.to_string()),
            _ => None,
        };
        let notified = if let Some(reason) = reason {
            let event = NotificationEvent::from_record(&record, &reason, self.options.pc_url_to_mobile);
            self.capture_stage("notify", stages, async {
                let report = self.fanout.notify(&event).await;
                let output = serde_json::to_value(&report).unwrap_or(Value::Null);
                Ok(StageOutcome::new((), output))
            })
            .await?;
            true
        } else {
            false
        };

        let entry = LedgerEntry { record, judgement };
        self.capture_stage("record", stages, async {
            ledger
                .record(&entry)
                .await
                .map_err(|err| TaskError::new(TaskErrorKind::Ledger, "record", err.to_string()))?;
            Ok::<_, TaskError>(StageOutcome::new((), json!({ "key": entry.key().to_string() })))
        })
        .await?;
        crate::metrics::listing_outcome(if notified { "notified" } else { "recorded" });
        Ok(ListingOutcome::Recorded { notified })
    }

    async fn judge_record(&self, task: &Task, record: &DetailRecord) -> Judgement {
        if self.options.skip_ai {
            return Judgement::error(MARKER_SKIPPED);
        }
        if !self.judge.is_enabled() || task.ai_prompt_text.trim().is_empty() {
            return Judgement::error(MARKER_NOT_CONFIGURED);
        }
        let paths = self
            .images
            .download_all(&record.listing.id, &record.listing.image_urls)
            .await;
        let encoded = ImageStore::encode_all(&paths).await;
        let outcome = self.judge.judge(record, &encoded, &task.ai_prompt_text).await;
        ImageStore::remove(&paths).await;
        outcome.into_judgement()
    }

    fn search_failure(&self, err: SourceError) -> TaskError {
        let kind = match &err {
            SourceError::RateLimited(_) => TaskErrorKind::RateLimited,
            SourceError::BotChallenge(_) => TaskErrorKind::BotChallenge,
            SourceError::Blocked(_) => TaskErrorKind::Blocked,
            SourceError::Transport(_) | SourceError::Upstream(_) | SourceError::Browser(_) => {
                TaskErrorKind::Upstream
            }
        };
        let message = match err {
            SourceError::BotChallenge(marker) => marker,
            other => other.to_string(),
        };
        TaskError::new(kind, "search", message)
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, TaskError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, TaskError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct TaskError {
    stage: &'static str,
    message: String,
    kind: TaskErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    RateLimited,
    BotChallenge,
    Blocked,
    AccountRisk,
    Upstream,
    Ledger,
    Timeout,
    Config,
}

impl TaskErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskErrorKind::RateLimited => "rate_limited",
            TaskErrorKind::BotChallenge => "bot_challenge",
            TaskErrorKind::Blocked => "blocked",
            TaskErrorKind::AccountRisk => "account_risk",
            TaskErrorKind::Upstream => "upstream",
            TaskErrorKind::Ledger => "ledger",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Config => "config",
        }
    }
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn config(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Config, stage, message)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::{
        config::GuardConfig,
        guard::NoSolver,
        judge::{JudgeOutcome, fixtures as verdicts},
        models::{SellerProfile, UNKNOWN, Verdict},
        notify::{NotificationChannel, NotifyError},
        source::SearchPage,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio_util::sync::CancellationToken;

    pub fn listing(id: &str) -> Listing {
        Listing {
            id: id.into(),
            title: format!("Sony A7M4 #{id}"),
            price: "¥11000".into(),
            original_price: UNKNOWN.into(),
            wants: "3".into(),
            seller_name: "seller".into(),
            area: "Shanghai".into(),
            link: format!("https://www.goofish.com/item?id={id}&categoryId=1"),
            publish_time: UNKNOWN.into(),
            tags: vec![],
            image_urls: vec![],
        }
    }

    pub fn task() -> Task {
        serde_json::from_value(json!({
            "task_name": "Sony A7M4",
            "keyword": "A7M4",
            "max_pages": 1,
            "ai_prompt_text": "Recommend bodies with under 5k shutter count."
        }))
        .expect("task")
    }

    pub struct PagedSource {
        pub pages: Mutex<Vec<Result<SearchPage, SourceError>>>,
    }

    impl PagedSource {
        pub fn new(pages: Vec<Result<SearchPage, SourceError>>) -> Self {
            Self {
                pages: Mutex::new(pages),
            }
        }

        pub fn one_page(listings: Vec<Listing>) -> Self {
            Self::new(vec![Ok(SearchPage {
                listings,
                markers: vec![],
            })])
        }
    }

    #[async_trait]
    impl ListingSource for PagedSource {
        fn name(&self) -> &'static str {
            "paged"
        }

        async fn fetch(&self, _task: &Task, _page: u32) -> Result<SearchPage, SourceError> {
            let mut pages = self.pages.lock().expect("lock");
            if pages.is_empty() {
                Ok(SearchPage::default())
            } else {
                pages.remove(0)
            }
        }
    }

    #[derive(Default)]
    pub struct CountingEnricher {
        pub calls: Arc<AtomicUsize>,
        pub risk_on: Option<String>,
        pub transient_on: Option<String>,
    }

    #[async_trait]
    impl DetailEnricher for CountingEnricher {
        async fn enrich(&self, task: &Task, listing: &Listing) -> Result<DetailRecord, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.risk_on.as_deref() == Some(listing.id.as_str()) {
                return Err(EnrichError::AccountRisk("FAIL_SYS_USER_VALIDATE".into()));
            }
            if self.transient_on.as_deref() == Some(listing.id.as_str()) {
                return Err(EnrichError::Transient("HTTP_ERROR::502".into()));
            }
            Ok(DetailRecord {
                capture_time: Utc::now(),
                task_name: task.task_name.clone(),
                keyword: task.keyword.clone(),
                listing: listing.clone(),
                seller_profile: SellerProfile {
                    tenure: "2 years, 3 months".into(),
                    ..SellerProfile::default()
                },
            })
        }
    }

    pub struct FixedJudge {
        pub calls: Arc<AtomicUsize>,
        pub outcome: JudgeOutcome,
    }

    impl FixedJudge {
        pub fn recommending(recommended: bool) -> Self {
            Self {
                calls: Arc::default(),
                outcome: JudgeOutcome::Verdict(Verdict {
                    validated: true,
                    body: verdicts::verdict(recommended),
                }),
            }
        }
    }

    #[async_trait]
    impl Judge for FixedJudge {
        fn is_enabled(&self) -> bool {
            true
        }

        async fn judge(&self, _record: &DetailRecord, _images: &[String], _rubric: &str) -> JudgeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    pub struct RecordingChannel {
        pub sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
            self.sent.lock().expect("lock").push(event.link.clone());
            Ok(())
        }
    }

    pub fn guard() -> Arc<ResilienceGuard> {
        Arc::new(ResilienceGuard::new(
            GuardConfig::for_tests(),
            Box::new(NoSolver),
            CancellationToken::new(),
        ))
    }

    pub fn options(ledger_dir: PathBuf) -> RunnerOptions {
        RunnerOptions {
            ledger_dir,
            skip_ai: false,
            pc_url_to_mobile: false,
            task_timeout: Duration::from_secs(10),
        }
    }

    pub fn runner(
        dir: &std::path::Path,
        source: PagedSource,
        enricher: CountingEnricher,
        judge: Arc<dyn Judge>,
        sent: Arc<Mutex<Vec<String>>>,
    ) -> TaskRunner {
        TaskRunner::new(
            Box::new(source),
            Box::new(enricher),
            judge,
            Arc::new(NotificationFanout::new(vec![Box::new(RecordingChannel { sent })])),
            guard(),
            ImageStore::new(reqwest::Client::new(), &dir.join("images"), "Sony A7M4"),
            options(dir.join("jsonl")),
        )
    }
}
