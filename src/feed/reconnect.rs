//! Upstream reconnection policy.
//!
//! The feed does not reconnect unless told to. `fixed` mode waits the same
//! delay (with a little jitter) before every attempt.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// A connect or read failure stops the feed for the rest of the run.
    None,
    /// Reconnect after a fixed delay.
    Fixed,
}

impl FromStr for ReconnectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown reconnect mode '{}', expected none or fixed", other)),
        }
    }
}

impl fmt::Display for ReconnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub mode: ReconnectMode,
    pub delay: Duration,
    /// Jitter as a fraction of `delay` (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Consecutive attempts allowed (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::None,
            delay: Duration::from_secs(5),
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` when the feed should give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.mode == ReconnectMode::None {
            return None;
        }

        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;
        Some(self.apply_jitter(self.config.delay))
    }

    /// Called after a session was established.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }

        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((base_millis + jitter).max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(delay_ms: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            mode: ReconnectMode::Fixed,
            delay: Duration::from_millis(delay_ms),
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn test_none_mode_never_retries() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 0);
    }

    #[test]
    fn test_fixed_mode_uses_same_delay() {
        let mut policy = ReconnectPolicy::new(fixed(250, 0));
        for _ in 0..10 {
            assert_eq!(policy.next_delay(), Some(Duration::from_millis(250)));
        }
        assert_eq!(policy.attempt_count(), 10);
    }

    #[test]
    fn test_fixed_mode_respects_max_attempts() {
        let mut policy = ReconnectPolicy::new(fixed(100, 2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.next_delay().is_some());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                jitter_factor: 0.1,
                ..fixed(1000, 0)
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {}ms outside ±10%", millis);
        }
    }

    #[test]
    fn test_reconnect_mode_parsing() {
        assert_eq!("none".parse::<ReconnectMode>(), Ok(ReconnectMode::None));
        assert_eq!("FIXED".parse::<ReconnectMode>(), Ok(ReconnectMode::Fixed));
        assert!("exponential".parse::<ReconnectMode>().is_err());
    }
}
