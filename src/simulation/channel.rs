//! Reference lossy channel.
//!
//! Every payload is independently lost with a fixed probability; delivered
//! payloads get a one-way delay drawn from a normal distribution, clamped to a
//! minimum. The random stream is seeded from configuration so that identical
//! scenarios produce identical runs.

use embassy_time::{Duration, Instant};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use crate::common::config::ChannelConfig;

/// Where an outbound payload is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Server,
    /// A vehicle endpoint, pinned to the binding it was sent to.
    Vehicle { slot: usize, generation: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub transmitted: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct LossyChannel {
    rng: StdRng,
    loss_probability: f64,
    delay_mean_ms: f64,
    min_delay_ms: f64,
    /// `None` when jitter is disabled.
    jitter: Option<Normal<f64>>,
    stats: ChannelStats,
}

impl LossyChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        let jitter = if config.delay_std_ms > 0.0 {
            Normal::new(config.delay_mean_ms, config.delay_std_ms).ok()
        } else {
            None
        };
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            loss_probability: config.loss_probability.clamp(0.0, 1.0),
            delay_mean_ms: config.delay_mean_ms,
            min_delay_ms: config.min_delay_ms,
            jitter,
            stats: ChannelStats::default(),
        }
    }

    /// Lossless channel with a fixed delay.
    pub fn ideal(delay: Duration) -> Self {
        Self::new(&ChannelConfig {
            loss_probability: 0.0,
            delay_mean_ms: delay.as_micros() as f64 / 1000.0,
            delay_std_ms: 0.0,
            min_delay_ms: 0.0,
            seed: 0,
        })
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Decide the fate of one payload sent at `sent_at`.
    /// Returns the arrival instant, or `None` if the payload is lost.
    pub fn transmit(&mut self, sent_at: Instant) -> Option<Instant> {
        self.stats.transmitted += 1;
        if self.loss_probability > 0.0 && self.rng.gen_bool(self.loss_probability) {
            self.stats.dropped += 1;
            return None;
        }

        let delay_ms = match &self.jitter {
            Some(normal) => normal.sample(&mut self.rng),
            None => self.delay_mean_ms,
        }
        .max(self.min_delay_ms);

        Some(sent_at + Duration::from_micros((delay_ms * 1000.0).round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(loss: f64, seed: u64) -> ChannelConfig {
        ChannelConfig {
            loss_probability: loss,
            delay_mean_ms: 20.0,
            delay_std_ms: 5.0,
            min_delay_ms: 2.0,
            seed,
        }
    }

    #[test]
    fn same_seed_same_fate() {
        let mut a = LossyChannel::new(&config(0.3, 7));
        let mut b = LossyChannel::new(&config(0.3, 7));
        let t = Instant::from_millis(1_000);
        for _ in 0..200 {
            assert_eq!(a.transmit(t), b.transmit(t));
        }
        assert_eq!(a.stats(), b.stats());
    }

    #[test]
    fn delays_respect_minimum() {
        let mut channel = LossyChannel::new(&ChannelConfig {
            loss_probability: 0.0,
            delay_mean_ms: 1.0,
            delay_std_ms: 10.0,
            min_delay_ms: 2.0,
            seed: 3,
        });
        let t = Instant::from_millis(0);
        for _ in 0..500 {
            let arrival = channel.transmit(t).unwrap();
            assert!(arrival >= Instant::from_millis(2));
        }
        assert_eq!(channel.stats().dropped, 0);
    }

    #[test]
    fn total_loss_drops_everything() {
        let mut channel = LossyChannel::new(&config(1.0, 1));
        for _ in 0..50 {
            assert!(channel.transmit(Instant::from_millis(0)).is_none());
        }
        assert_eq!(channel.stats(), ChannelStats { transmitted: 50, dropped: 50 });
    }

    #[test]
    fn ideal_channel_has_fixed_delay() {
        let mut channel = LossyChannel::ideal(Duration::from_millis(5));
        assert_eq!(channel.transmit(Instant::from_millis(10)), Some(Instant::from_millis(15)));
    }
}
