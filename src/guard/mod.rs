//! Upstream hostility detection and the block / intervention state machine.
//!
//! [`GuardState::on`] is the pure transition table. [`ResilienceGuard`] drives it
//! from page probes, runs the optional [`ChallengeSolver`], waits for a human in
//! observable mode, and owns every randomized pause and cooldown so that one
//! cancellation token can cut them all short at shutdown.

pub mod browser_surface;
pub mod solver;

use crate::config::{DelayRange, GuardConfig};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use solver::{ChallengeSolver, GridSolver, NoSolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Clear,
    Suspected,
    Blocked,
    Intervening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardEvent {
    Scan { hostile: bool },
    RemediationExhausted,
    InterventionCleared,
    InterventionTimedOut,
    ConfirmedChallenge,
}

impl GuardState {
    pub fn on(self, event: GuardEvent, headless: bool) -> GuardState {
        use GuardEvent::*;
        use GuardState::*;
        match (self, event) {
            (_, ConfirmedChallenge) => Blocked,
            (Blocked, _) => Blocked,
            (Clear | Suspected, Scan { hostile: false }) => Clear,
            (Clear | Suspected, Scan { hostile: true }) => Suspected,
            (Suspected, RemediationExhausted) if headless => Blocked,
            (Suspected, RemediationExhausted) => Intervening,
            (Intervening, InterventionCleared) => Clear,
            (Intervening, InterventionTimedOut) => Blocked,
            (state, _) => state,
        }
    }
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GuardState::Clear => "clear",
            GuardState::Suspected => "suspected",
            GuardState::Blocked => "blocked",
            GuardState::Intervening => "intervening",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("upstream blocked this run: {0}")]
    Blocked(String),
    #[error("bot challenge confirmed: {0}")]
    BotChallenge(String),
    #[error("page probe failed: {0}")]
    Surface(String),
}

/// Raw facts read off a rendered page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageProbe {
    #[serde(default)]
    pub visible_selectors: Vec<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub script_errors: Vec<String>,
    #[serde(default)]
    pub body_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// What the guard can do to a rendered page.
#[async_trait]
pub trait PageSurface: Send + Sync {
    async fn probe(&self, selectors: &[String]) -> Result<PageProbe, GuardError>;

    /// Box of the first visible element among `selectors`.
    async fn element_box(&self, selectors: &[String]) -> Option<BoundingBox>;

    async fn click_at(&self, x: f64, y: f64) -> Result<(), GuardError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub signals: Vec<String>,
    pub normal_marker: bool,
}

impl Observation {
    pub fn hostile(&self) -> bool {
        !self.signals.is_empty()
    }
}

pub fn detect(config: &GuardConfig, probe: &PageProbe) -> Observation {
    let mut signals: Vec<String> = probe
        .visible_selectors
        .iter()
        .map(|sel| format!("selector:{sel}"))
        .collect();

    let title = probe.title.to_lowercase();
    let url = probe.url.to_lowercase();
    for keyword in &config.page_keywords {
        let needle = keyword.to_lowercase();
        if title.contains(&needle) || url.contains(&needle) {
            signals.push(format!("page:{keyword}"));
        }
    }

    for error in &probe.script_errors {
        let lowered = error.to_lowercase();
        if config
            .script_error_keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()))
        {
            signals.push(format!("script:{error}"));
        }
    }

    for text in &config.challenge_texts {
        if probe.body_text.contains(text.as_str()) {
            signals.push(format!("text:{text}"));
        }
    }

    Observation {
        signals,
        normal_marker: probe.body_text.contains(config.normal_marker.as_str()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    PageLoad,
    Item,
    PostItem,
    PageTurn,
}

pub struct ResilienceGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
    solver: Box<dyn ChallengeSolver>,
    shutdown: CancellationToken,
}

impl ResilienceGuard {
    pub fn new(
        config: GuardConfig,
        solver: Box<dyn ChallengeSolver>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState::Clear),
            solver,
            shutdown,
        }
    }

    pub fn state(&self) -> GuardState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A fresh invocation starts unsuspicious.
    pub fn reset(&self) {
        self.set(GuardState::Clear);
    }

    fn set(&self, next: GuardState) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != next {
            info!(target = "argus.guard", from = %*state, to = %next, "guard_transition");
        }
        *state = next;
    }

    fn apply(&self, event: GuardEvent) -> GuardState {
        let next = self.state().on(event, self.config.headless);
        self.set(next);
        next
    }

    async fn scan(&self, surface: &dyn PageSurface) -> Result<Observation, GuardError> {
        let probe = surface.probe(&self.config.dom_selectors).await?;
        Ok(detect(&self.config, &probe))
    }

    /// Checks the page and, when hostile, walks remediation and intervention.
    /// Returns `Err(Blocked)` when the run must stop.
    pub async fn inspect(&self, surface: &dyn PageSurface) -> Result<(), GuardError> {
        if self.state() == GuardState::Blocked {
            return Err(GuardError::Blocked("guard already blocked".into()));
        }
        let observation = self.scan(surface).await?;
        if self.apply(GuardEvent::Scan { hostile: observation.hostile() }) == GuardState::Clear {
            debug!(target = "argus.guard", "page_clear");
            return Ok(());
        }
        warn!(
            target = "argus.guard",
            signals = ?observation.signals,
            headless = self.config.headless,
            "hostility_detected"
        );

        // Automated solving only runs where an operator could take over.
        for attempt in 1..=self.config.max_remediation_attempts {
            if self.config.headless || !self.solver.is_active() {
                break;
            }
            let solved = self.solver.solve(surface).await;
            info!(
                target = "argus.guard",
                solver = self.solver.name(),
                attempt,
                solved,
                "remediation_attempted"
            );
            let after = self.scan(surface).await?;
            if self.apply(GuardEvent::Scan { hostile: after.hostile() }) == GuardState::Clear {
                return Ok(());
            }
        }

        match self.apply(GuardEvent::RemediationExhausted) {
            GuardState::Intervening => self.await_intervention(surface).await,
            _ => Err(GuardError::Blocked(observation.signals.join(", "))),
        }
    }

    /// Polls until the challenge disappears and the page looks normal again,
    /// or the wait budget runs out.
    async fn await_intervention(&self, surface: &dyn PageSurface) -> Result<(), GuardError> {
        let started = Instant::now();
        let budget = self.config.intervention_max_wait;
        warn!(
            target = "argus.guard",
            max_wait_secs = budget.as_secs(),
            "manual_intervention_required"
        );
        while started.elapsed() < budget {
            let observation = self.scan(surface).await?;
            if !observation.hostile() {
                self.sleep_cancellable(self.config.stabilization_delay).await;
                let settled = self.scan(surface).await?;
                if !settled.hostile() && settled.normal_marker {
                    self.apply(GuardEvent::InterventionCleared);
                    info!(
                        target = "argus.guard",
                        waited_ms = started.elapsed().as_millis() as u64,
                        "intervention_cleared"
                    );
                    return Ok(());
                }
                debug!(target = "argus.guard", "intervention_page_not_settled");
            }
            if self.sleep_cancellable(self.config.intervention_check_interval).await {
                break;
            }
        }
        self.apply(GuardEvent::InterventionTimedOut);
        Err(GuardError::Blocked("intervention wait budget exhausted".into()))
    }

    /// Account-level risk: wait out a long random cooldown, then block the run.
    pub async fn confirm_bot_challenge(&self, marker: &str) -> GuardError {
        let cooldown = random_between(self.config.cooldown_min, self.config.cooldown_max);
        warn!(
            target = "argus.guard",
            marker,
            cooldown_secs = cooldown.as_secs(),
            "bot_challenge_cooldown"
        );
        let interrupted = self.sleep_cancellable(cooldown).await;
        if interrupted {
            info!(target = "argus.guard", "cooldown_interrupted_by_shutdown");
        }
        self.apply(GuardEvent::ConfirmedChallenge);
        GuardError::BotChallenge(marker.to_string())
    }

    pub async fn pause(&self, kind: Pause) {
        let range = match kind {
            Pause::PageLoad => self.config.page_load_delay,
            Pause::Item => self.config.item_delay,
            Pause::PostItem => self.config.post_item_delay,
            Pause::PageTurn => self.config.page_turn_delay,
        };
        self.sleep_cancellable(sample(range)).await;
    }

    /// Returns `true` when shutdown interrupted the sleep.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }
}

fn sample(range: DelayRange) -> Duration {
    if range.max_secs <= range.min_secs {
        return Duration::from_secs_f64(range.min_secs.max(0.0));
    }
    Duration::from_secs_f64(rand::rng().random_range(range.min_secs..=range.max_secs))
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    Duration::from_millis(rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64))
}
