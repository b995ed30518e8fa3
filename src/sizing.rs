//! Per-follower order sizing.
//!
//! Followers never copy the leader's parameters verbatim: each one gets its
//! own volume variation and its own leverage, drawn per event.

use rand::Rng;

/// Smallest volume ever requested from a follower.
pub const MIN_VOLUME: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingPolicy {
    /// Volume variation range in percent, e.g. -5.0..=5.0
    pub vol_pct_min: f64,
    pub vol_pct_max: f64,
    pub leverage_min: u32,
    pub leverage_max: u32,
    /// Venue volume granularity; volumes are floored to a multiple of it
    pub volume_step: Option<f64>,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            vol_pct_min: -5.0,
            vol_pct_max: 5.0,
            leverage_min: 5,
            leverage_max: 15,
            volume_step: Some(1.0),
        }
    }
}

/// Parameters drawn for one follower and one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    pub volume: f64,
    pub leverage: u32,
    pub vol_pct: f64,
}

impl SizingPolicy {
    pub fn volume<R: Rng + ?Sized>(&self, rng: &mut R, leader_volume: f64, multiplier: f64) -> (f64, f64) {
        let pct = draw_f64(rng, self.vol_pct_min, self.vol_pct_max);
        let raw = leader_volume * multiplier * (1.0 + pct / 100.0);
        let stepped = match self.volume_step {
            Some(step) if step > 0.0 => (raw / step).floor() * step,
            _ => raw,
        };
        (stepped.max(MIN_VOLUME), pct)
    }

    pub fn leverage<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        let lo = self.leverage_min.max(1);
        let hi = self.leverage_max.max(lo);
        rng.gen_range(lo..=hi)
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R, leader_volume: f64, multiplier: f64) -> Sizing {
        let (volume, vol_pct) = self.volume(rng, leader_volume, multiplier);
        Sizing {
            volume,
            leverage: self.leverage(rng),
            vol_pct,
        }
    }
}

fn draw_f64<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}
