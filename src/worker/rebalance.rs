//! Worker load balancing.
//!
//! A coordinator task samples each worker's load once per period into an
//! N-sample moving average. When the spread between the busiest and the
//! quietest worker exceeds the threshold, the busiest worker is asked to
//! move sessions to the quietest. The move itself happens on the busy
//! worker's tick, never in the middle of event processing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{WorkerHandle, WorkerMessage};

/// Sample worker loads once per period and post a move request whenever
/// the spread exceeds the threshold. Runs for the lifetime of the process.
pub async fn run_coordinator(
    handles: Arc<Vec<WorkerHandle>>,
    window: usize,
    threshold: u32,
    period: Duration,
) {
    if threshold == 0 || handles.len() < 2 {
        return;
    }

    let mut averages: Vec<AverageN> = handles.iter().map(|_| AverageN::new(window)).collect();
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        for (handle, average) in handles.iter().zip(averages.iter_mut()) {
            average.add_value(handle.load());
        }
        balance_workers(&handles, &averages, threshold);
    }
}

/// Fixed-window moving average of load samples
#[derive(Debug, Clone)]
pub struct AverageN {
    window: usize,
    samples: std::collections::VecDeque<u32>,
}

impl AverageN {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: std::collections::VecDeque::new(),
        }
    }

    pub fn add_value(&mut self, sample: u32) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn value(&self) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().map(|&s| s as u64).sum();
        (sum / self.samples.len() as u64) as u32
    }
}

/// One balancing round over the current averages. Returns true when a move
/// was requested.
pub fn balance_workers(
    handles: &[WorkerHandle],
    averages: &[AverageN],
    threshold: u32,
) -> bool {
    if threshold == 0 || handles.len() < 2 {
        return false;
    }

    let mut min_load = u32::MAX;
    let mut max_load = 0;
    let mut to = 0usize;
    let mut from = 0usize;

    for (i, avg) in averages.iter().enumerate() {
        let load = avg.value();
        if load < min_load {
            min_load = load;
            to = i;
        }
        if load > max_load {
            max_load = load;
            from = i;
        }
    }

    let diff = max_load.saturating_sub(min_load);
    if diff <= threshold || from == to {
        return false;
    }

    info!(
        diff,
        max_load,
        min_load,
        threshold,
        from,
        to,
        "Load difference between workers exceeds the rebalance threshold, moving work"
    );

    if handles[from]
        .send(WorkerMessage::Rebalance { to, sessions: 1 })
        .is_err()
    {
        warn!("Could not post rebalance request, load balancing skipped");
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_window() {
        let mut avg = AverageN::new(3);
        assert_eq!(avg.value(), 0);

        avg.add_value(30);
        avg.add_value(60);
        assert_eq!(avg.value(), 45);

        avg.add_value(90);
        assert_eq!(avg.value(), 60);

        // Window full: oldest sample rolls off
        avg.add_value(90);
        assert_eq!(avg.value(), 80);
    }

    #[test]
    fn test_average_window_of_one() {
        let mut avg = AverageN::new(1);
        avg.add_value(10);
        avg.add_value(70);
        assert_eq!(avg.value(), 70);
    }
}
