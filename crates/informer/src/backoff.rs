//! Jittered exponential backoff for reconnects.

use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        let current = cfg.initial.min(cfg.max);
        Self { cfg, current, attempts: 0 }
    }

    pub fn attempts(&self) -> u32 { self.attempts }

    /// Next delay, never above the configured maximum; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let jitter = self.cfg.jitter.clamp(0.0, 1.0);
        let delay = base * (1.0 + jitter * rand::random::<f64>());
        let max = self.cfg.max.as_secs_f64();
        self.current = Duration::from_secs_f64((base * self.cfg.factor.max(1.0)).min(max));
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_secs_f64(delay.min(max))
    }

    pub fn reset(&mut self) {
        self.current = self.cfg.initial.min(self.cfg.max);
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(jitter: f64) -> BackoffConfig {
        BackoffConfig { initial: Duration::from_millis(100), max: Duration::from_millis(1000), factor: 2.0, jitter }
    }

    #[test]
    fn doubles_until_capped() {
        let mut b = Backoff::new(cfg(0.0));
        let seq: Vec<u128> = (0..6).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(seq, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(b.attempts(), 6);
        b.reset();
        assert_eq!(b.next_delay().as_millis(), 100);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut b = Backoff::new(cfg(0.5));
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(1000));
        }
    }
}
