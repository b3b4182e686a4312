use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use indicatif::{ProgressDrawTarget, ProgressStyle};

/// Receives the number of iterations completed by the worker threads.
///
/// Implementations are called concurrently from all workers.
pub trait ProgressReporter: Send + Sync {
    /// Add `iterations` to the completed count. Output is refreshed if
    /// enough time passed since the last refresh, or if `force` is set.
    fn update(&self, iterations: u64, force: bool);

    fn report(&self, iterations: u64) {
        self.update(iterations, false)
    }
}

/// Discards all progress reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn update(&self, _iterations: u64, _force: bool) {}
}

/// Progress of a single update or sample call.
#[derive(Debug, Clone, Copy)]
pub struct ProgressState {
    pub iterations_done: u64,
    pub iterations_total: u64,
    pub start_time: Instant,
    pub last_update_time: Instant,
}

impl ProgressState {
    pub fn new(total: u64) -> Self {
        let now = Instant::now();
        Self {
            iterations_done: 0,
            iterations_total: total,
            start_time: now,
            last_update_time: now,
        }
    }

    /// Time between the start and the last refresh.
    pub fn elapsed(&self) -> Duration {
        self.last_update_time.duration_since(self.start_time)
    }
}

/// Estimated seconds until `total` iterations are done, infinite if nothing
/// is done yet.
pub fn remaining_seconds(done: u64, total: u64, elapsed: Duration) -> f64 {
    if done == 0 {
        return f64::INFINITY;
    }
    let per_iteration = elapsed.as_secs_f64() / done as f64;
    total.saturating_sub(done) as f64 * per_iteration
}

fn format_seconds(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "inf".to_string();
    }
    let seconds = seconds.round() as u64;
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

pub fn render(header: &str, done: u64, total: u64, elapsed: Duration) -> String {
    format!(
        "{}iterations {} of {}, elapsed {}, remaining {}",
        header,
        done,
        total,
        format_seconds(elapsed.as_secs_f64()),
        format_seconds(remaining_seconds(done, total, elapsed)),
    )
}

/// Draws per second that `refresh` allows on the terminal.
fn draw_rate(refresh: Duration) -> u8 {
    (1. / refresh.as_secs_f64()).ceil().clamp(1., 20.) as u8
}

/// Progress display on the terminal, drawn with `indicatif`.
///
/// The line is re-rendered at most once per `refresh` unless an update is
/// forced. The final line stays on screen when the bar is dropped.
pub struct ProgressBar {
    bar: indicatif::ProgressBar,
    state: Mutex<ProgressState>,
    header: String,
    refresh: Duration,
}

impl ProgressBar {
    pub fn stdout(total: u64, header: impl Into<String>, refresh: Duration) -> Self {
        let target = ProgressDrawTarget::stdout_with_hz(draw_rate(refresh));
        Self::with_draw_target(total, header, refresh, target)
    }

    pub fn with_draw_target(
        total: u64,
        header: impl Into<String>,
        refresh: Duration,
        target: ProgressDrawTarget,
    ) -> Self {
        let bar = indicatif::ProgressBar::with_draw_target(Some(total), target);
        if let Ok(style) = ProgressStyle::with_template("[{bar:30}] {msg}") {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self {
            bar,
            state: Mutex::new(ProgressState::new(total)),
            header: header.into(),
            refresh,
        }
    }

    pub fn state(&self) -> ProgressState {
        *self.state.lock().expect("Poisoned lock")
    }

    /// The line shown after the last refresh.
    pub fn message(&self) -> String {
        self.bar.message()
    }
}

impl ProgressBar {
    fn refresh(&self, state: &mut ProgressState, iterations: u64, force: bool) {
        state.iterations_done += iterations;
        let now = Instant::now();
        if force || now.duration_since(state.last_update_time) >= self.refresh {
            state.last_update_time = now;
            self.bar.set_position(state.iterations_done);
            self.bar.set_message(render(
                &self.header,
                state.iterations_done,
                state.iterations_total,
                state.elapsed(),
            ));
        }
    }
}

impl ProgressReporter for ProgressBar {
    fn update(&self, iterations: u64, force: bool) {
        let mut state = self.state.lock().expect("Poisoned lock");
        self.refresh(&mut state, iterations, force);
    }
}

impl Drop for ProgressBar {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            self.refresh(&mut state, 0, true);
        }
        self.bar.finish();
    }
}

/// Build the progress reporter for one update call.
pub fn progress_reporter(
    enabled: bool,
    total: u64,
    header: &str,
    refresh: Duration,
) -> Box<dyn ProgressReporter> {
    if enabled {
        Box::new(ProgressBar::stdout(total, header, refresh))
    } else {
        Box::new(NoProgress)
    }
}
