use super::PageSurface;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::time::Duration;
use tracing::{debug, warn};

/// Optional automated attempt at a challenge. Success only means the attempt ran;
/// the guard re-probes the page to decide whether it actually worked.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_active(&self) -> bool {
        true
    }

    async fn solve(&self, surface: &dyn PageSurface) -> bool;
}

pub struct NoSolver;

#[async_trait]
impl ChallengeSolver for NoSolver {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_active(&self) -> bool {
        false
    }

    async fn solve(&self, _surface: &dyn PageSurface) -> bool {
        false
    }
}

type Cell = (u8, u8);

/// Clicks the cells of a 3x3 challenge grid in one of a few fixed orders.
/// The click orders are guesses and have never been verified against the live challenge.
pub struct GridSolver {
    containers: Vec<String>,
    click_pause: Duration,
    settle: Duration,
}

const PATTERNS: [[Cell; 9]; 4] = [
    [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2), (2, 0), (2, 1), (2, 2)],
    [(0, 0), (0, 1), (0, 2), (1, 2), (1, 1), (1, 0), (2, 0), (2, 1), (2, 2)],
    [(0, 0), (0, 1), (0, 2), (1, 2), (2, 2), (2, 1), (2, 0), (1, 0), (1, 1)],
    [(0, 0), (1, 1), (2, 2), (0, 2), (2, 0), (0, 1), (1, 0), (1, 2), (2, 1)],
];

impl GridSolver {
    pub fn new() -> Self {
        Self {
            containers: [
                "div[class*='captcha']",
                "div[class*='verify']",
                "div[class*='puzzle']",
                "div[class*='baxia-dialog']",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            click_pause: Duration::from_millis(500),
            settle: Duration::from_secs(3),
        }
    }

    #[cfg(test)]
    pub fn with_pauses(mut self, click_pause: Duration, settle: Duration) -> Self {
        self.click_pause = click_pause;
        self.settle = settle;
        self
    }
}

impl Default for GridSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChallengeSolver for GridSolver {
    fn name(&self) -> &'static str {
        "grid"
    }

    async fn solve(&self, surface: &dyn PageSurface) -> bool {
        let Some(area) = surface.element_box(&self.containers).await else {
            debug!(target = "argus.guard", "grid_container_missing");
            return false;
        };
        let pattern = PATTERNS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(PATTERNS[0]);
        let cell_w = area.width / 3.0;
        let cell_h = area.height / 3.0;
        for (row, col) in pattern {
            let x = area.x + f64::from(col) * cell_w + cell_w / 2.0;
            let y = area.y + f64::from(row) * cell_h + cell_h / 2.0;
            if let Err(err) = surface.click_at(x, y).await {
                warn!(target = "argus.guard", row, col, error = %err, "grid_click_failed");
            }
            tokio::time::sleep(self.click_pause).await;
        }
        tokio::time::sleep(self.settle).await;
        true
    }
}
