use std::collections::BTreeMap;

use burn::train::renderer::{MetricState, MetricsRenderer, TrainingProgress};
use tracing::{debug, info};

/// Line-oriented replacement for the terminal dashboard: per-iteration
/// progress at debug level, one summary line per finished epoch.
#[derive(Default)]
pub struct LogRenderer {
    train: BTreeMap<String, String>,
    valid: BTreeMap<String, String>,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn summary(metrics: &BTreeMap<String, String>) -> String {
        metrics.values().cloned().collect::<Vec<_>>().join(" - ")
    }
}

fn entry(state: MetricState) -> (String, String) {
    match state {
        MetricState::Generic(entry) => (entry.name, entry.formatted),
        MetricState::Numeric(entry, _) => (entry.name, entry.formatted),
    }
}

fn finished(item: &TrainingProgress) -> bool {
    item.progress.items_processed >= item.progress.items_total
}

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, state: MetricState) {
        let (name, formatted) = entry(state);
        self.train.insert(name, formatted);
    }

    fn update_valid(&mut self, state: MetricState) {
        let (name, formatted) = entry(state);
        self.valid.insert(name, formatted);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        debug!(
            "Epoch {}/{} [{}/{}] {}",
            item.epoch,
            item.epoch_total,
            item.progress.items_processed,
            item.progress.items_total,
            Self::summary(&self.train)
        );
        if finished(&item) {
            info!("Epoch {}/{} train: {}", item.epoch, item.epoch_total, Self::summary(&self.train));
        }
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        if finished(&item) {
            info!("Epoch {}/{} valid: {}", item.epoch, item.epoch_total, Self::summary(&self.valid));
        }
    }
}
