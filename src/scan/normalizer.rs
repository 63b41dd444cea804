//! Incident-flux normaliser.
//!
//! Samples a reference counter every `interval` into a circular buffer
//! covering `window`, and publishes `factor = first / mean(buffer)` where
//! `first` is the reading taken when the normaliser started. Multiplying a
//! count by the factor corrects it for beam intensity drift.

use ringbuf::{HeapRb, Rb};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::hardware::Counter;

/// Running normalisation factor fed by a background task
pub struct Normalizer {
    factor: watch::Receiver<f64>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Normalizer {
    /// Start sampling `reference`; without one the factor stays 1.0
    pub fn start(reference: Option<Arc<dyn Counter>>, interval: Duration, window: Duration) -> Self {
        let (factor_tx, factor_rx) = watch::channel(1.0);
        let Some(reference) = reference else {
            return Self {
                factor: factor_rx,
                stop: None,
                task: None,
            };
        };

        let capacity = ((window.as_secs_f64() / interval.as_secs_f64()).round() as usize).max(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(sample(reference, interval, capacity, factor_tx, stop_rx));
        Self {
            factor: factor_rx,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Latest factor
    pub fn factor(&self) -> f64 {
        *self.factor.borrow()
    }

    /// Stop sampling and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Normalizer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn sample(
    reference: Arc<dyn Counter>,
    interval: Duration,
    capacity: usize,
    factor: watch::Sender<f64>,
    mut stop: oneshot::Receiver<()>,
) {
    let first = match reference.value().await {
        Ok(value) if value > 0.0 => value,
        Ok(value) => {
            warn!(reference = %reference.name(), value, "Reference reads zero, not normalising");
            return;
        }
        Err(e) => {
            warn!(reference = %reference.name(), error = %e, "Cannot read reference, not normalising");
            return;
        }
    };
    debug!(reference = %reference.name(), first, capacity, "Normalizer started");

    let mut buffer = HeapRb::<f64>::new(capacity);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                match reference.value().await {
                    Ok(value) => {
                        buffer.push_overwrite(value);
                        let (sum, count) = buffer.iter().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                        let mean = sum / count as f64;
                        if mean > 0.0 {
                            factor.send_replace(first / mean);
                        }
                    }
                    Err(e) => debug!(error = %e, "Skipping reference sample"),
                }
            }
        }
    }
}
