use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::trace;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressView {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub percent: f32,
}

impl ProgressView {
    pub fn new(position_ms: u64, duration_ms: u64) -> Self {
        let percent = if duration_ms == 0 {
            0.0
        } else {
            (position_ms.min(duration_ms) as f64 / duration_ms as f64 * 100.0) as f32
        };
        Self {
            position_ms,
            duration_ms,
            percent,
        }
    }

    /// `"1:05 / 3:20"`
    pub fn label(&self) -> String {
        format!(
            "{} / {}",
            format_time(self.position_ms),
            format_time(self.duration_ms)
        )
    }
}

/// Renders milliseconds as `m:ss`.
pub fn format_time(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

/// Client-side position estimate while a track is confirmed playing. Each tick adds
/// [`TICK_INTERVAL`] to the baseline; the next authoritative snapshot replaces it.
/// Dropping the clock stops it.
pub struct ProgressClock {
    position_ms: Arc<AtomicU64>,
    duration_ms: u64,
    task: Option<JoinHandle<()>>,
}

impl ProgressClock {
    pub fn start<F>(baseline_ms: u64, duration_ms: u64, on_tick: F) -> Self
    where
        F: Fn(ProgressView) + Send + 'static,
    {
        let position_ms = Arc::new(AtomicU64::new(baseline_ms));
        let position = Arc::clone(&position_ms);
        let first_tick = Instant::now() + TICK_INTERVAL;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(first_tick, TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut next = position.load(Ordering::Relaxed) + TICK_INTERVAL.as_millis() as u64;
                if duration_ms > 0 {
                    next = next.min(duration_ms);
                }
                position.store(next, Ordering::Relaxed);
                trace!(position_ms = next, "progress: tick");
                on_tick(ProgressView::new(next, duration_ms));
            }
        });
        Self {
            position_ms,
            duration_ms,
            task: Some(task),
        }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn view(&self) -> ProgressView {
        ProgressView::new(self.position_ms.load(Ordering::Relaxed), self.duration_ms)
    }
}

impl Drop for ProgressClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn format_time_pads_seconds() {
        assert_eq!(format_time(0), "0:00");
        assert_eq!(format_time(999), "0:00");
        assert_eq!(format_time(65_000), "1:05");
        assert_eq!(format_time(200_000), "3:20");
        assert_eq!(format_time(3_600_000), "60:00");
    }

    #[test]
    fn view_percent_handles_zero_duration() {
        assert_eq!(ProgressView::new(5_000, 0).percent, 0.0);
        assert_eq!(ProgressView::new(50_000, 200_000).percent, 25.0);
        assert_eq!(ProgressView::new(250_000, 200_000).percent, 100.0);
        assert_eq!(ProgressView::new(65_000, 200_000).label(), "1:05 / 3:20");
    }

    #[tokio::test(start_paused = true)]
    async fn clock_advances_one_second_per_tick() {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let clock = ProgressClock::start(10_000, 200_000, move |view| {
            sink.lock().expect("ticks").push(view.position_ms);
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(*ticks.lock().expect("ticks"), vec![11_000, 12_000, 13_000]);
        assert_eq!(clock.view().position_ms, 13_000);
        assert!(clock.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn clock_stops_at_track_end() {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let _clock = ProgressClock::start(198_500, 200_000, move |view| {
            sink.lock().expect("ticks").push(view.position_ms);
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(*ticks.lock().expect("ticks"), vec![199_500, 200_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_clock_no_longer_ticks() {
        let ticks = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&ticks);
        let mut clock = ProgressClock::start(0, 60_000, move |_| {
            *sink.lock().expect("ticks") += 1;
        });

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        clock.stop();
        assert!(!clock.is_running());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*ticks.lock().expect("ticks"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_clock_cancels_it() {
        let ticks = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&ticks);
        let clock = ProgressClock::start(0, 60_000, move |_| {
            *sink.lock().expect("ticks") += 1;
        });
        drop(clock);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*ticks.lock().expect("ticks"), 0);
    }
}
