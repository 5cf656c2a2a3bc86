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

/// The length of the RMS detector's moving window, in samples.
pub const RMS_WINDOW_LEN: usize = 32;

/// The fixed one-pole coefficient that smooths the computed gain to suppress zipper noise.
const GAIN_SMOOTHING: f32 = 0.9995;

/// The computed gain is clamped to this range in decibels before makeup is added.
const GAIN_FLOOR_DB: f32 = -60.0;

/// How the level detector derives a level from the incoming samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMode {
    /// The instantaneous magnitude.
    Peak,
    /// The root mean square over a 32 sample moving window.
    Rms,
}

/// The shape of the gain curve around the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KneeKind {
    Hard,
    Soft,
}

/// The feed-forward compressor's parameters. All fields are clamped through
/// [`CompressorConfig::clamped()`] before they reach the audio thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub knee_width_db: f32,
    pub makeup_db: f32,
    pub detection: DetectionMode,
    pub knee: KneeKind,
    pub enabled: bool,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold_db: -20.0,
            ratio: 2.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            knee_width_db: 0.0,
            makeup_db: 0.0,
            detection: DetectionMode::Peak,
            knee: KneeKind::Hard,
            enabled: false,
        }
    }
}

impl CompressorConfig {
    pub fn clamped(mut self) -> (Self, Applied) {
        let mut clamped = false;
        self.threshold_db = util::observed_clamp(self.threshold_db, -60.0, 0.0, &mut clamped);
        self.ratio = util::observed_clamp(self.ratio, 1.0, 20.0, &mut clamped);
        self.attack_ms = util::observed_clamp(self.attack_ms, 0.1, 100.0, &mut clamped);
        self.release_ms = util::observed_clamp(self.release_ms, 10.0, 1_000.0, &mut clamped);
        self.knee_width_db = util::observed_clamp(self.knee_width_db, 0.0, 12.0, &mut clamped);
        self.makeup_db = util::observed_clamp(self.makeup_db, 0.0, 24.0, &mut clamped);

        (self, Applied::from_clamped(clamped))
    }
}

/// A feed-forward envelope-following compressor for one output channel. The envelope and the
/// gain computer both work in decibels; the computed gain is smoothed with a fixed one-pole
/// before it touches the audio.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressorConfig,

    attack_coef: f32,
    release_coef: f32,
    /// `1 - 1/ratio`, the slope of the gain reduction above the threshold.
    ratio_factor: f32,

    envelope_db: f32,
    gain_db: f32,
    rms_window: [f32; RMS_WINDOW_LEN],
    rms_sum: f32,
    rms_pos: usize,

    gain_reduction_db: f32,
    input_level_db: f32,
}

impl Default for Compressor {
    fn default() -> Self {
        let mut compressor = Self {
            config: CompressorConfig::default(),
            attack_coef: 0.0,
            release_coef: 0.0,
            ratio_factor: 0.0,
            envelope_db: util::MINUS_INFINITY_DB,
            gain_db: 0.0,
            rms_window: [0.0; RMS_WINDOW_LEN],
            rms_sum: 0.0,
            rms_pos: 0,
            gain_reduction_db: 0.0,
            input_level_db: util::MINUS_INFINITY_DB,
        };
        compressor.configure(&CompressorConfig::default(), 48_000.0);
        compressor
    }
}

impl Compressor {
    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Derive the per-sample coefficients for a new configuration. The envelope state is
    /// retained so retuning a running compressor doesn't pump.
    pub fn configure(&mut self, config: &CompressorConfig, sample_rate: f32) {
        self.config = *config;
        self.attack_coef = util::envelope_coefficient(config.attack_ms, sample_rate);
        self.release_coef = util::envelope_coefficient(config.release_ms, sample_rate);
        self.ratio_factor = 1.0 - config.ratio.recip();
    }

    /// Clear all running state.
    pub fn reset(&mut self) {
        self.envelope_db = util::MINUS_INFINITY_DB;
        self.gain_db = self.config.makeup_db;
        self.rms_window = [0.0; RMS_WINDOW_LEN];
        self.rms_sum = 0.0;
        self.rms_pos = 0;
        self.gain_reduction_db = 0.0;
        self.input_level_db = util::MINUS_INFINITY_DB;
    }

    /// The current gain reduction in (positive) decibels, excluding makeup.
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    /// The detector's current level estimate in decibels.
    pub fn input_level_db(&self) -> f32 {
        self.input_level_db
    }

    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        if !self.config.enabled {
            self.gain_reduction_db = 0.0;
            return sample;
        }

        let level_db = match self.config.detection {
            DetectionMode::Peak => util::gain_to_db(sample.abs()),
            DetectionMode::Rms => {
                let squared = sample * sample;
                // The running sum can drift slightly negative in f32, hence the clamp
                self.rms_sum = (self.rms_sum - self.rms_window[self.rms_pos] + squared).max(0.0);
                self.rms_window[self.rms_pos] = squared;
                self.rms_pos = (self.rms_pos + 1) % RMS_WINDOW_LEN;

                util::gain_to_db((self.rms_sum / RMS_WINDOW_LEN as f32).sqrt())
            }
        };

        let coef = if level_db > self.envelope_db {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope_db = coef * self.envelope_db + (1.0 - coef) * level_db;

        let reduction = self.gain_reduction_at(self.envelope_db);
        let target_db = (-reduction).clamp(GAIN_FLOOR_DB, 0.0) + self.config.makeup_db;
        self.gain_db = GAIN_SMOOTHING * self.gain_db + (1.0 - GAIN_SMOOTHING) * target_db;

        self.gain_reduction_db = (self.config.makeup_db - self.gain_db).max(0.0);
        self.input_level_db = self.envelope_db;

        sample * util::db_to_gain(self.gain_db)
    }

    /// The static gain reduction curve: how many decibels the gain computer takes away at a
    /// given envelope level.
    fn gain_reduction_at(&self, level_db: f32) -> f32 {
        let threshold = self.config.threshold_db;
        let knee_width = match self.config.knee {
            KneeKind::Hard => 0.0,
            KneeKind::Soft => self.config.knee_width_db,
        };

        if knee_width > 0.0 {
            let half_knee = knee_width / 2.0;
            if level_db <= threshold - half_knee {
                0.0
            } else if level_db >= threshold + half_knee {
                (level_db - threshold) * self.ratio_factor
            } else {
                // A quadratic transition that's continuous in value and slope at both knee edges
                let overshoot = level_db - threshold + half_knee;
                self.ratio_factor * overshoot * overshoot / (2.0 * knee_width)
            }
        } else if level_db <= threshold {
            0.0
        } else {
            (level_db - threshold) * self.ratio_factor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn settled_compressor(config: CompressorConfig, level_db: f32) -> (Compressor, f32) {
        let mut compressor = Compressor::default();
        compressor.configure(&config, 48_000.0);
        compressor.reset();

        let input = util::db_to_gain(level_db);
        let mut output = 0.0;
        // 500 ms is several release and smoothing time constants
        for _ in 0..24_000 {
            output = compressor.process_sample(input);
        }

        (compressor, output)
    }

    #[test]
    fn static_curve_matches_the_ratio() {
        let config = CompressorConfig {
            threshold_db: -20.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            enabled: true,
            ..CompressorConfig::default()
        };

        // A -10 dB input is 10 dB over the threshold; at 4:1 it compresses down to -17.5 dB
        let (_, output) = settled_compressor(config, -10.0);
        assert_abs_diff_eq!(util::gain_to_db(output.abs()), -17.5, epsilon = 0.2);

        // Below the threshold nothing happens
        let (_, output) = settled_compressor(config, -30.0);
        assert_abs_diff_eq!(util::gain_to_db(output.abs()), -30.0, epsilon = 0.1);
    }

    #[test]
    fn makeup_shifts_the_output_up() {
        let config = CompressorConfig {
            threshold_db: -20.0,
            ratio: 4.0,
            makeup_db: 6.0,
            enabled: true,
            ..CompressorConfig::default()
        };

        let (_, output) = settled_compressor(config, -10.0);
        assert_abs_diff_eq!(util::gain_to_db(output.abs()), -11.5, epsilon = 0.2);
    }

    #[test]
    fn disabled_compressor_passes_through() {
        let mut compressor = Compressor::default();
        assert_eq!(compressor.process_sample(0.8), 0.8);
        assert_eq!(compressor.gain_reduction_db(), 0.0);
    }

    #[test]
    fn soft_knee_is_continuous_at_the_edges() {
        let mut compressor = Compressor::default();
        compressor.configure(
            &CompressorConfig {
                threshold_db: -20.0,
                ratio: 4.0,
                knee: KneeKind::Soft,
                knee_width_db: 6.0,
                enabled: true,
                ..CompressorConfig::default()
            },
            48_000.0,
        );

        // Value continuity at the knee edges
        assert_abs_diff_eq!(compressor.gain_reduction_at(-23.0), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(
            compressor.gain_reduction_at(-17.0),
            3.0 * 0.75,
            epsilon = 1e-4
        );
        // Inside the knee the curve stays between the hard knee segments
        let inside = compressor.gain_reduction_at(-20.0);
        assert!(inside > 0.0 && inside < 0.75 * 3.0);

        // Slope continuity: approaching the upper edge from both sides gives the same rate
        let below = compressor.gain_reduction_at(-17.01);
        let above = compressor.gain_reduction_at(-16.99);
        assert_abs_diff_eq!(above - below, 0.02 * 0.75, epsilon = 1e-3);
    }

    #[test]
    fn rms_detection_converges_to_the_input_level() {
        let mut compressor = Compressor::default();
        compressor.configure(
            &CompressorConfig {
                detection: DetectionMode::Rms,
                attack_ms: 0.1,
                enabled: true,
                ..CompressorConfig::default()
            },
            48_000.0,
        );
        compressor.reset();

        let input = util::db_to_gain(-10.0);
        for _ in 0..RMS_WINDOW_LEN * 4 {
            compressor.process_sample(input);
        }
        assert_relative_eq!(compressor.input_level_db(), -10.0, epsilon = 0.1);
    }

    #[test]
    fn instantaneous_attack_tracks_the_first_sample() {
        let mut compressor = Compressor::default();
        compressor.configure(
            &CompressorConfig {
                attack_ms: 0.05,
                enabled: true,
                ..CompressorConfig::default()
            },
            48_000.0,
        );
        compressor.reset();

        compressor.process_sample(1.0);
        assert_abs_diff_eq!(compressor.input_level_db(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn identical_compressors_produce_identical_output() {
        let config = CompressorConfig {
            threshold_db: -15.0,
            ratio: 8.0,
            knee: KneeKind::Soft,
            knee_width_db: 4.0,
            enabled: true,
            ..CompressorConfig::default()
        };

        let mut left = Compressor::default();
        let mut right = Compressor::default();
        left.configure(&config, 48_000.0);
        right.configure(&config, 48_000.0);

        for n in 0..4_096 {
            let x = (std::f32::consts::TAU * 997.0 * n as f32 / 48_000.0).sin() * 0.9;
            assert_eq!(left.process_sample(x), right.process_sample(x));
        }
    }

    #[test]
    fn clamping_is_observable() {
        let (config, applied) = CompressorConfig {
            ratio: 50.0,
            release_ms: 5.0,
            ..CompressorConfig::default()
        }
        .clamped();

        assert_eq!(config.ratio, 20.0);
        assert_eq!(config.release_ms, 10.0);
        assert!(applied.was_clamped());
    }
}
