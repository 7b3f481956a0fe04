//! Engine configuration with environment overlays.

use std::time::Duration;

/// Exponential backoff bounds for reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Extra random delay as a fraction of the base delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(800), max: Duration::from_secs(30), factor: 2.0, jitter: 0.2 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InformerConfig {
    /// Periodic re-delivery of the cached state; `None` disables it.
    pub resync_period: Option<Duration>,
    pub backoff: BackoffConfig,
    /// Queue depth that triggers a warning log.
    pub queue_warn_len: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self { resync_period: None, backoff: BackoffConfig::default(), queue_warn_len: 2048 }
    }
}

impl InformerConfig {
    /// Defaults overlaid with `PODWATCH_*` environment variables.
    pub fn from_env() -> Self { Self::from_vars(|k| std::env::var(k).ok()) }

    /// Like [`from_env`](Self::from_env) with an injectable lookup. Unparseable
    /// values are ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<u64>().ok());
        let mut cfg = Self::default();
        if let Some(secs) = num("PODWATCH_RESYNC_SECS") {
            cfg.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = num("PODWATCH_WATCH_BACKOFF_INITIAL_MS") {
            cfg.backoff.initial = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = num("PODWATCH_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff.max = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = num("PODWATCH_QUEUE_WARN") {
            cfg.queue_warn_len = n.max(1) as usize;
        }
        cfg
    }

    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overlays_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("PODWATCH_RESYNC_SECS", "30"),
            ("PODWATCH_WATCH_BACKOFF_MAX_SECS", "nope"),
            ("PODWATCH_QUEUE_WARN", "10"),
        ]
        .into_iter()
        .collect();
        let cfg = InformerConfig::from_vars(|k| vars.get(k).map(|s| s.to_string()));
        assert_eq!(cfg.resync_period, Some(Duration::from_secs(30)));
        assert_eq!(cfg.backoff.max, Duration::from_secs(30));
        assert_eq!(cfg.queue_warn_len, 10);
    }

    #[test]
    fn zero_resync_disables() {
        let cfg = InformerConfig::from_vars(|k| (k == "PODWATCH_RESYNC_SECS").then(|| "0".to_string()));
        assert_eq!(cfg.resync_period, None);
        assert_eq!(InformerConfig::default().with_resync_period(Some(Duration::ZERO)).resync_period, None);
    }
}
