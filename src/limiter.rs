// Quartermaster: a two-in four-out loudspeaker management engine
// Copyright (C) 2024 Robbert van der Helm
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

use crate::util;
use crate::Applied;

/// The most lookahead a limiter can be configured with. The ring is allocated for this length at
/// construction so changing the lookahead time never allocates.
pub const MAX_LOOKAHEAD_MS: f32 = 10.0;

/// After the envelope attacks, the gain stays pinned for this many samples before the release
/// segment starts. Prevents pumping on dense transients.
const HOLD_SAMPLES: u32 = 50;

/// The deepest gain reduction the limiter will apply. Anything beyond this is left to the hard
/// clip.
const MAX_REDUCTION_DB: f32 = -24.0;

/// The limiter counts as active once it reduces by more than this many decibels.
const ACTIVE_THRESHOLD_DB: f32 = 0.5;

/// The peak prediction margin for a rising pair of same-sign samples.
const ISP_RISING_MARGIN: f32 = 1.05;
/// The peak prediction margin for a zero crossing.
const ISP_CROSSING_MARGIN: f32 = 1.15;

/// The peak limiter's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Where gain reduction starts, in decibels.
    pub threshold_db: f32,
    /// The absolute output cap in decibels, enforced with a hard clip after the gain stage.
    pub ceiling_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub lookahead_ms: f32,
    /// Scale the release time with the current reduction depth so deep reductions recover more
    /// slowly.
    pub adaptive_release: bool,
    /// Estimate inter-sample peaks from neighbouring samples and feed the estimate to the
    /// detector.
    pub inter_sample_peaks: bool,
    pub bypass: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            threshold_db: -0.3,
            ceiling_db: -0.3,
            attack_ms: 1.0,
            release_ms: 50.0,
            lookahead_ms: 0.0,
            adaptive_release: false,
            inter_sample_peaks: true,
            bypass: false,
        }
    }
}

impl LimiterConfig {
    pub fn clamped(mut self) -> (Self, Applied) {
        let mut clamped = false;
        self.threshold_db = util::observed_clamp(self.threshold_db, -60.0, 0.0, &mut clamped);
        self.ceiling_db = util::observed_clamp(self.ceiling_db, -60.0, 0.0, &mut clamped);
        self.attack_ms = util::observed_clamp(self.attack_ms, 0.1, 100.0, &mut clamped);
        self.release_ms = util::observed_clamp(self.release_ms, 10.0, 1_000.0, &mut clamped);
        self.lookahead_ms =
            util::observed_clamp(self.lookahead_ms, 0.0, MAX_LOOKAHEAD_MS, &mut clamped);

        (self, Applied::from_clamped(clamped))
    }
}

/// A peak limiter with optional lookahead and inter-sample peak estimation. The envelope runs on
/// the predicted peaks while the gain is applied to the (possibly delayed) signal, so with
/// lookahead enabled the gain computer reacts to samples before they reach the output.
#[derive(Debug, Clone)]
pub struct Limiter {
    config: LimiterConfig,

    attack_coef: f32,
    release_coef: f32,
    /// The release time in samples, kept around for the adaptive release scaling.
    release_samples: f32,
    threshold: f32,
    ceiling: f32,
    min_gain: f32,

    lookahead: Vec<f32>,
    lookahead_len: usize,
    lookahead_pos: usize,

    envelope: f32,
    gain: f32,
    hold_counter: u32,
    prev_sample: f32,

    gain_reduction_db: f32,
    peak_level: f32,
}

impl Limiter {
    /// Construct a limiter. The lookahead ring is allocated once for [`MAX_LOOKAHEAD_MS`] here;
    /// nothing on the processing path allocates after this.
    pub fn new(sample_rate: f32) -> Self {
        let max_lookahead = (MAX_LOOKAHEAD_MS / 1000.0 * sample_rate).ceil() as usize;

        let mut limiter = Self {
            config: LimiterConfig::default(),
            attack_coef: 0.0,
            release_coef: 0.0,
            release_samples: 0.0,
            threshold: 1.0,
            ceiling: 1.0,
            min_gain: util::db_to_gain(MAX_REDUCTION_DB),
            lookahead: vec![0.0; max_lookahead.max(1)],
            lookahead_len: 0,
            lookahead_pos: 0,
            envelope: 0.0,
            gain: 1.0,
            hold_counter: 0,
            prev_sample: 0.0,
            gain_reduction_db: 0.0,
            peak_level: 0.0,
        };
        limiter.configure(&LimiterConfig::default(), sample_rate);
        limiter
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Derive coefficients and the lookahead length for a new configuration. Changing the
    /// lookahead time flushes the ring, everything else keeps its state.
    pub fn configure(&mut self, config: &LimiterConfig, sample_rate: f32) {
        self.config = *config;
        self.attack_coef = util::envelope_coefficient(config.attack_ms, sample_rate);
        self.release_coef = util::envelope_coefficient(config.release_ms, sample_rate);
        self.release_samples = config.release_ms / 1000.0 * sample_rate;
        self.threshold = util::db_to_gain(config.threshold_db);
        self.ceiling = util::db_to_gain(config.ceiling_db);

        let lookahead_len =
            ((config.lookahead_ms / 1000.0 * sample_rate) as usize).min(self.lookahead.len());
        if lookahead_len != self.lookahead_len {
            self.lookahead.fill(0.0);
            self.lookahead_pos = 0;
            self.lookahead_len = lookahead_len;
        }
    }

    /// Clear all running state.
    pub fn reset(&mut self) {
        self.lookahead.fill(0.0);
        self.lookahead_pos = 0;
        self.envelope = 0.0;
        self.gain = 1.0;
        self.hold_counter = 0;
        self.prev_sample = 0.0;
        self.gain_reduction_db = 0.0;
        self.peak_level = 0.0;
    }

    /// The current gain reduction in (positive) decibels.
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    /// The detector's current peak estimate as a linear gain value.
    pub fn peak_level(&self) -> f32 {
        self.peak_level
    }

    /// Whether the limiter is currently reducing by a noticeable amount.
    pub fn is_active(&self) -> bool {
        self.gain_reduction_db > ACTIVE_THRESHOLD_DB
    }

    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        if self.config.bypass {
            self.prev_sample = sample;
            self.gain_reduction_db = 0.0;
            return sample;
        }

        let predicted = if self.config.inter_sample_peaks {
            self.predict_peak(sample)
        } else {
            sample
        };
        self.prev_sample = sample;

        // With lookahead the gain below is computed from the incoming sample while this (older)
        // sample is the one being written to the output
        let delayed = if self.lookahead_len > 0 {
            let delayed = self.lookahead[self.lookahead_pos];
            self.lookahead[self.lookahead_pos] = sample;
            self.lookahead_pos = (self.lookahead_pos + 1) % self.lookahead_len;
            delayed
        } else {
            sample
        };

        // Peak-hold envelope
        let level = predicted.abs();
        if level > self.envelope {
            self.envelope = self.attack_coef * self.envelope + (1.0 - self.attack_coef) * level;
            self.hold_counter = HOLD_SAMPLES;
        } else if self.hold_counter > 0 {
            self.hold_counter -= 1;
        } else {
            self.envelope = self.release_coef * self.envelope + (1.0 - self.release_coef) * level;
        }

        let target = if self.envelope > self.threshold {
            (self.threshold / self.envelope).max(self.min_gain)
        } else {
            1.0
        };

        if target < self.gain {
            self.gain = self.attack_coef * self.gain + (1.0 - self.attack_coef) * target;
        } else {
            let release_coef = if self.config.adaptive_release {
                // Deeper reductions release more slowly
                let stretch = 1.0 + 5.0 * (1.0 - self.gain);
                (-1.0 / (self.release_samples * stretch)).exp()
            } else {
                self.release_coef
            };
            self.gain = release_coef * self.gain + (1.0 - release_coef) * target;
        }

        self.gain_reduction_db = (-util::gain_to_db(self.gain)).max(0.0);
        self.peak_level = self.envelope;

        (delayed * self.gain).clamp(-self.ceiling, self.ceiling)
    }

    /// Estimate the peak of the bandlimited reconstruction between the previous and the current
    /// sample. The margins are hand-tuned values carried over from listening tests.
    fn predict_peak(&self, sample: f32) -> f32 {
        let current = sample.abs();
        let previous = self.prev_sample.abs();

        if (sample >= 0.0) == (self.prev_sample >= 0.0) {
            if current > previous {
                sample * ISP_RISING_MARGIN
            } else {
                sample
            }
        } else {
            // A zero crossing: interpolate the magnitudes at the estimated crossing point
            let t = previous / (previous + current);
            let magnitude = (previous * (1.0 - t) + current * t) * ISP_CROSSING_MARGIN;
            magnitude.copysign(sample)
        }
    }
}
