use crate::core::config::LadderConfig;
use std::collections::VecDeque;

/// Outcome of one synthesis task as seen by the controller.
#[derive(Debug, Clone, Copy)]
pub struct TaskSample {
    pub success: bool,
    pub retries: u32,
    /// The task exhausted its retry budget and still failed.
    pub hit_ceiling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Up(usize),
    Down(usize),
}

/// Adaptive concurrency controller for the TTS pool. A ring buffer of the
/// most recent task results decides, at task-completion boundaries only,
/// whether the worker target grows or shrinks.
pub struct Ladder {
    config: LadderConfig,
    max_workers: usize,
    current: usize,
    window: VecDeque<TaskSample>,
    processed_since_scale: usize,
}

impl Ladder {
    pub fn new(config: &LadderConfig, max_workers: usize) -> Self {
        let max_workers = max_workers.max(config.min_workers);
        Self {
            config: config.clone(),
            max_workers,
            current: config.min_workers.min(max_workers),
            window: VecDeque::new(),
            processed_since_scale: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|s| s.success).count();
        ok as f64 / self.window.len() as f64
    }

    fn scale_down(&mut self) -> Option<Scale> {
        let target = ((self.current as f64 * self.config.scale_down_factor).floor() as usize)
            .max(self.config.min_workers);
        // The window emptied so one bad burst is judged once.
        self.window.clear();
        self.processed_since_scale = 0;
        if target < self.current {
            self.current = target;
            Some(Scale::Down(target))
        } else {
            None
        }
    }

    /// Records one finished task and returns the scale decision, if any.
    pub fn record(&mut self, sample: TaskSample) -> Option<Scale> {
        self.window.push_back(sample);
        if self.window.len() > self.config.sample_size {
            self.window.pop_front();
        }
        self.processed_since_scale += 1;

        if self.window.iter().any(|s| s.hit_ceiling) {
            return self.scale_down();
        }

        if self.window.len() >= self.config.sample_size {
            if self.success_rate() < self.config.success_threshold {
                return self.scale_down();
            }
            if self.processed_since_scale >= self.config.sample_size
                && self.current < self.max_workers
            {
                self.current =
                    (self.current + self.config.scale_up_increment).min(self.max_workers);
                self.processed_since_scale = 0;
                return Some(Scale::Up(self.current));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LadderConfig {
        LadderConfig {
            min_workers: 2,
            sample_size: 5,
            success_threshold: 0.8,
            scale_down_factor: 0.5,
            scale_up_increment: 1,
        }
    }

    fn ok() -> TaskSample {
        TaskSample {
            success: true,
            retries: 0,
            hit_ceiling: false,
        }
    }

    fn soft_fail() -> TaskSample {
        TaskSample {
            success: false,
            retries: 2,
            hit_ceiling: false,
        }
    }

    fn hard_fail() -> TaskSample {
        TaskSample {
            success: false,
            retries: 4,
            hit_ceiling: true,
        }
    }

    #[test]
    fn starts_at_min_workers() {
        let ladder = Ladder::new(&config(), 8);
        assert_eq!(ladder.current(), 2);
    }

    #[test]
    fn scales_up_after_full_healthy_sample() {
        let mut ladder = Ladder::new(&config(), 8);
        for _ in 0..4 {
            assert_eq!(ladder.record(ok()), None);
        }
        assert_eq!(ladder.record(ok()), Some(Scale::Up(3)));
        // Needs another full sample before the next raise.
        for _ in 0..4 {
            assert_eq!(ladder.record(ok()), None);
        }
        assert_eq!(ladder.record(ok()), Some(Scale::Up(4)));
    }

    #[test]
    fn scale_up_respects_max() {
        let mut ladder = Ladder::new(&config(), 3);
        for _ in 0..5 {
            ladder.record(ok());
        }
        assert_eq!(ladder.current(), 3);
        for _ in 0..10 {
            ladder.record(ok());
        }
        assert_eq!(ladder.current(), 3);
    }

    #[test]
    fn hard_failure_halves_workers() {
        let mut ladder = Ladder::new(&config(), 8);
        for _ in 0..10 {
            ladder.record(ok());
        }
        assert_eq!(ladder.current(), 4);
        let decision = ladder.record(hard_fail());
        assert_eq!(decision, Some(Scale::Down(2)));
        assert_eq!(ladder.current(), 2);
    }

    #[test]
    fn hard_failure_never_goes_below_min() {
        let mut ladder = Ladder::new(&config(), 8);
        assert_eq!(ladder.record(hard_fail()), None);
        assert_eq!(ladder.current(), 2);
    }

    #[test]
    fn low_success_rate_scales_down() {
        let mut ladder = Ladder::new(&config(), 8);
        for _ in 0..10 {
            ladder.record(ok());
        }
        assert_eq!(ladder.current(), 4);
        // One soft failure leaves the rate at the threshold, a second dips
        // below it.
        assert_eq!(ladder.record(soft_fail()), None);
        let decision = ladder.record(soft_fail());
        assert_eq!(decision, Some(Scale::Down(2)));
    }

    #[test]
    fn one_bad_burst_is_judged_once() {
        let mut ladder = Ladder::new(&config(), 8);
        for _ in 0..10 {
            ladder.record(ok());
        }
        let before = ladder.current();
        ladder.record(hard_fail());
        let after_first = ladder.current();
        assert!(after_first < before);
        // The same failure sample must not trigger repeated shrinks.
        ladder.record(ok());
        assert_eq!(ladder.current(), after_first);
    }
}
