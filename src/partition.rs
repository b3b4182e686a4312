use std::time::{Duration, Instant};

/// Splits a number of iterations into batches that each take roughly
/// `period` to run.
///
/// The time per iteration is estimated from all batches completed so far.
/// The caller runs each batch between two calls to `next`, so the first
/// batch has size one and later batches grow or shrink to the measured rate.
///
/// The clock returns the time since an arbitrary fixed point.
pub struct ConstTimePartition<C> {
    clock: C,
    period: Duration,
    total: u64,
    left: u64,
    next: u64,
    start: Option<Duration>,
    pending: Option<u64>,
}

/// Partition `iterations` using the monotonic system clock.
pub fn const_time_partition(
    iterations: u64,
    period: Duration,
) -> ConstTimePartition<impl FnMut() -> Duration> {
    let origin = Instant::now();
    ConstTimePartition::with_clock(iterations, period, move || origin.elapsed())
}

impl<C: FnMut() -> Duration> ConstTimePartition<C> {
    pub fn with_clock(iterations: u64, period: Duration, clock: C) -> Self {
        Self {
            clock,
            period,
            total: iterations,
            left: iterations,
            next: 1,
            start: None,
            pending: None,
        }
    }

    /// Number of iterations not yet handed out.
    pub fn remaining(&self) -> u64 {
        self.left - self.pending.unwrap_or(0)
    }
}

impl<C: FnMut() -> Duration> Iterator for ConstTimePartition<C> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let start = *self.start.get_or_insert_with(&mut self.clock);

        if let Some(previous) = self.pending.take() {
            self.left -= previous;
            let elapsed = (self.clock)().saturating_sub(start);
            let done = self.total - self.left;
            let next = if elapsed.is_zero() {
                previous.saturating_mul(2)
            } else {
                (self.period.as_secs_f64() * done as f64 / elapsed.as_secs_f64()).floor() as u64
            };
            self.next = next.clamp(1, self.left.max(1));
        }

        if self.left == 0 {
            return None;
        }
        let batch = self.next.clamp(1, self.left);
        self.pending = Some(batch);
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn fixed_clock(now: Rc<Cell<Duration>>) -> impl FnMut() -> Duration {
        move || now.get()
    }

    #[test]
    fn empty_partition() {
        let batches: Vec<_> = const_time_partition(0, Duration::from_secs(1)).collect();
        assert!(batches.is_empty());
    }

    #[test]
    fn single_iteration() {
        let batches: Vec<_> = const_time_partition(1, Duration::from_secs(1)).collect();
        assert_eq!(batches, vec![1]);
    }

    #[test]
    fn doubles_without_measurable_time() {
        let now = Rc::new(Cell::new(Duration::ZERO));
        let batches: Vec<_> =
            ConstTimePartition::with_clock(20, Duration::from_secs(1), fixed_clock(now)).collect();
        assert_eq!(batches, vec![1, 2, 4, 8, 5]);
    }

    #[test]
    fn follows_measured_rate() {
        let now = Rc::new(Cell::new(Duration::ZERO));
        let mut partition = ConstTimePartition::with_clock(
            1000,
            Duration::from_secs(5),
            fixed_clock(now.clone()),
        );

        // One iteration takes 250ms, so five seconds fit 20 iterations.
        assert_eq!(partition.next(), Some(1));
        now.set(Duration::from_millis(250));
        assert_eq!(partition.next(), Some(20));
        now.set(Duration::from_millis(5250));
        assert_eq!(partition.next(), Some(20));
        assert_eq!(partition.remaining(), 959);
    }

    #[test]
    fn slow_iterations_still_progress() {
        let now = Rc::new(Cell::new(Duration::ZERO));
        let mut partition = ConstTimePartition::with_clock(
            3,
            Duration::from_millis(10),
            fixed_clock(now.clone()),
        );
        let mut batches = vec![];
        while let Some(batch) = partition.next() {
            batches.push(batch);
            now.set(now.get() + Duration::from_secs(batch));
        }
        assert_eq!(batches, vec![1, 1, 1]);
    }

    proptest! {
        #[test]
        fn batches_sum_to_total(
            total in 0u64..5000,
            period_ms in 1u64..10_000,
            steps in proptest::collection::vec(0u64..50, 1..64),
        ) {
            let now = Rc::new(Cell::new(Duration::ZERO));
            let partition = ConstTimePartition::with_clock(
                total,
                Duration::from_millis(period_ms),
                fixed_clock(now.clone()),
            );
            let mut sum = 0;
            let mut count = 0u64;
            for (i, batch) in partition.enumerate() {
                prop_assert!(batch >= 1);
                sum += batch;
                count += 1;
                now.set(now.get() + Duration::from_millis(steps[i % steps.len()]));
            }
            prop_assert_eq!(sum, total);
            prop_assert!(count <= total);
        }
    }
}
