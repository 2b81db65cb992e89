use crate::{
    config::SchedulerConfig,
    models::{Task, TaskRunSummary},
    pipeline::{TaskErrorKind, TaskRunner},
    retry::capped_exponential,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Disabled,
    Scheduled,
    Running {
        run_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        summary: TaskRunSummary,
    },
    Failed {
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        error: String,
        stage: Option<String>,
        kind: String,
    },
}

#[derive(Clone, Serialize)]
pub struct TaskStatus {
    pub task_name: String,
    pub runs: u64,
    pub consecutive_failures: u32,
    pub next_run_in_secs: Option<u64>,
    #[serde(flatten)]
    pub state: TaskState,
}

/// Last known state of every task, shared with the status server.
#[derive(Clone, Default)]
pub struct StatusBoard {
    statuses: Arc<Mutex<HashMap<String, TaskStatus>>>,
}

impl StatusBoard {
    pub async fn get(&self, task_name: &str) -> Option<TaskStatus> {
        let guard = self.statuses.lock().await;
        guard.get(task_name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<TaskStatus> {
        let guard = self.statuses.lock().await;
        let mut all: Vec<TaskStatus> = guard.values().cloned().collect();
        all.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        all
    }

    async fn update(&self, task_name: &str, apply: impl FnOnce(&mut TaskStatus)) {
        let mut guard = self.statuses.lock().await;
        let status = guard.entry(task_name.to_string()).or_insert_with(|| TaskStatus {
            task_name: task_name.to_string(),
            runs: 0,
            consecutive_failures: 0,
            next_run_in_secs: None,
            state: TaskState::Scheduled,
        });
        apply(status);
    }
}

/// Runs every enabled task as its own tokio task, on its own cadence.
pub struct Scheduler {
    config: SchedulerConfig,
    board: StatusBoard,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            board: StatusBoard::default(),
            shutdown,
        }
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub async fn spawn_all(&self, units: Vec<(Task, Arc<TaskRunner>)>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (task, runner) in units {
            if !task.enabled {
                self.board
                    .update(&task.task_name, |s| s.state = TaskState::Disabled)
                    .await;
                info!(target = "argus.scheduler", task = %task.task_name, "task_disabled");
                continue;
            }
            self.board.update(&task.task_name, |_| {}).await;
            let config = self.config.clone();
            let board = self.board.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(drive(task, runner, config, board, shutdown)));
        }
        handles
    }
}

async fn drive(
    task: Task,
    runner: Arc<TaskRunner>,
    config: SchedulerConfig,
    board: StatusBoard,
    shutdown: CancellationToken,
) {
    let name = task.task_name.clone();
    loop {
        let run_id = Uuid::new_v4();
        board
            .update(&name, |s| {
                s.state = TaskState::Running {
                    run_id,
                    started_at: Utc::now(),
                };
                s.next_run_in_secs = None;
            })
            .await;
        info!(target = "argus.scheduler", task = %name, run_id = %run_id, "task_run_started");

        // A panic inside one run must not take the schedule down with it.
        let attempt = {
            let task = task.clone();
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&task).await })
        };
        let failure = match attempt.await {
            Ok(Ok(summary)) => {
                crate::metrics::task_finished(&name, "succeeded");
                board
                    .update(&name, |s| {
                        s.runs += 1;
                        s.consecutive_failures = 0;
                        s.state = TaskState::Succeeded {
                            run_id,
                            finished_at: Utc::now(),
                            summary,
                        };
                    })
                    .await;
                None
            }
            Ok(Err(err)) => {
                warn!(
                    target = "argus.scheduler",
                    task = %name,
                    stage = err.stage(),
                    kind = err.kind().as_str(),
                    error = %err,
                    "task_run_failed"
                );
                crate::metrics::task_finished(&name, err.kind().as_str());
                board
                    .update(&name, |s| {
                        s.runs += 1;
                        s.consecutive_failures += 1;
                        s.state = TaskState::Failed {
                            run_id,
                            finished_at: Utc::now(),
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                            kind: err.kind().as_str().to_string(),
                        };
                    })
                    .await;
                Some(err.kind())
            }
            Err(join_err) => {
                error!(target = "argus.scheduler", task = %name, error = %join_err, "task_run_panicked");
                crate::metrics::task_finished(&name, "panicked");
                board
                    .update(&name, |s| {
                        s.runs += 1;
                        s.consecutive_failures += 1;
                        s.state = TaskState::Failed {
                            run_id,
                            finished_at: Utc::now(),
                            error: join_err.to_string(),
                            stage: None,
                            kind: "panicked".into(),
                        };
                    })
                    .await;
                Some(TaskErrorKind::Upstream)
            }
        };

        if config.run_once || shutdown.is_cancelled() {
            break;
        }
        let failures = board.get(&name).await.map(|s| s.consecutive_failures).unwrap_or(0);
        let delay = next_delay(&config, failure, failures);
        board
            .update(&name, |s| s.next_run_in_secs = Some(delay.as_secs()))
            .await;
        info!(
            target = "argus.scheduler",
            task = %name,
            delay_secs = delay.as_secs(),
            "task_next_run_scheduled"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    info!(target = "argus.scheduler", task = %name, "task_schedule_stopped");
}

/// Delay before the next run given how the last one ended.
pub fn next_delay(
    config: &SchedulerConfig,
    failure: Option<TaskErrorKind>,
    consecutive_failures: u32,
) -> Duration {
    match failure {
        Some(TaskErrorKind::RateLimited) => {
            let (min, max) = (config.rate_limit_backoff_min, config.rate_limit_backoff_max);
            if max <= min {
                min
            } else {
                Duration::from_secs_f64(
                    rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64()),
                )
            }
        }
        Some(TaskErrorKind::Blocked | TaskErrorKind::BotChallenge | TaskErrorKind::AccountRisk) => {
            capped_exponential(config.backoff_base, config.backoff_max, consecutive_failures)
        }
        _ => config.run_interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::fakes::{CountingEnricher, FixedJudge, PagedSource, listing, runner, task},
        source::SourceError,
    };
    use futures::future::join_all;
    use std::sync::Mutex as StdMutex;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            run_interval: Duration::from_secs(900),
            task_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
            rate_limit_backoff_min: Duration::from_secs(1800),
            rate_limit_backoff_max: Duration::from_secs(3600),
            run_once: true,
        }
    }

    #[test]
    fn blocked_backoff_doubles_up_to_cap() {
        let cfg = config();
        let blocked = Some(TaskErrorKind::Blocked);
        assert_eq!(next_delay(&cfg, blocked, 1), Duration::from_secs(60));
        assert_eq!(next_delay(&cfg, blocked, 2), Duration::from_secs(120));
        assert_eq!(next_delay(&cfg, blocked, 3), Duration::from_secs(240));
        assert_eq!(next_delay(&cfg, blocked, 4), Duration::from_secs(300));
        assert_eq!(next_delay(&cfg, None, 0), Duration::from_secs(900));
    }

    #[test]
    fn rate_limit_uses_long_window() {
        let delay = next_delay(&config(), Some(TaskErrorKind::RateLimited), 1);
        assert!(delay >= Duration::from_secs(1800));
        assert!(delay <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn sibling_tasks_are_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let healthy = Arc::new(runner(
            &dir.path().join("a"),
            PagedSource::one_page(vec![listing("1")]),
            CountingEnricher::default(),
            Arc::new(FixedJudge::recommending(false)),
            Arc::new(StdMutex::new(Vec::new())),
        ));
        let limited = Arc::new(runner(
            &dir.path().join("b"),
            PagedSource::new(vec![Err(SourceError::RateLimited("RGV587_ERROR".into()))]),
            CountingEnricher::default(),
            Arc::new(FixedJudge::recommending(false)),
            Arc::new(StdMutex::new(Vec::new())),
        ));
        let mut second = task();
        second.task_name = "Limited".into();
        let mut disabled = task();
        disabled.task_name = "Off".into();
        disabled.enabled = false;

        let scheduler = Scheduler::new(config(), CancellationToken::new());
        let handles = scheduler
            .spawn_all(vec![
                (task(), healthy.clone()),
                (second, limited),
                (disabled, healthy),
            ])
            .await;
        assert_eq!(handles.len(), 2);
        join_all(handles).await;

        let board = scheduler.board();
        let ok = board.get("Sony A7M4").await.expect("status");
        assert!(matches!(ok.state, TaskState::Succeeded { ref summary, .. } if summary.processed == 1));
        let failed = board.get("Limited").await.expect("status");
        assert_eq!(failed.consecutive_failures, 1);
        assert!(matches!(failed.state, TaskState::Failed { ref kind, .. } if kind == "rate_limited"));
        assert!(matches!(board.get("Off").await.expect("status").state, TaskState::Disabled));
        assert_eq!(board.snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unit = Arc::new(runner(
            dir.path(),
            PagedSource::new(vec![]),
            CountingEnricher::default(),
            Arc::new(FixedJudge::recommending(false)),
            Arc::new(StdMutex::new(Vec::new())),
        ));
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(
            SchedulerConfig {
                run_once: false,
                ..config()
            },
            shutdown.clone(),
        );
        let handles = scheduler.spawn_all(vec![(task(), unit)]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), join_all(handles))
            .await
            .expect("scheduler stopped");
        let status = scheduler.board().get("Sony A7M4").await.expect("status");
        assert_eq!(status.runs, 1);
        assert_eq!(status.next_run_in_secs, Some(900));
    }
}
