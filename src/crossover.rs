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

use crate::design::{self, FilterCascade, FilterFamily, Slope};
use crate::util;
use crate::{Applied, Error};

/// What part of the spectrum a crossover band passes on to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandKind {
    /// No filtering, only the band gain.
    Bypass,
    LowPass,
    HighPass,
    /// High-pass at the lower corner followed by low-pass at the upper corner.
    BandPass,
}

/// The full description of one output channel's crossover band. This is what the setters stage
/// and what the read-back returns, so after clamping it always describes what actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossoverBandConfig {
    pub kind: BandKind,
    /// The corner frequency in hertz. For [`BandKind::BandPass`] this is the lower corner.
    pub frequency: f32,
    /// The upper corner frequency in hertz. Only used for [`BandKind::BandPass`].
    pub upper_frequency: f32,
    pub family: FilterFamily,
    pub slope: Slope,
    /// Band output gain in decibels.
    pub gain_db: f32,
    pub enabled: bool,
}

impl Default for CrossoverBandConfig {
    fn default() -> Self {
        Self {
            kind: BandKind::Bypass,
            frequency: 1_000.0,
            upper_frequency: 4_000.0,
            family: FilterFamily::LinkwitzRiley,
            slope: Slope::Db24,
            gain_db: 0.0,
            enabled: true,
        }
    }
}

/// The band gain range in decibels.
const GAIN_RANGE_DB: (f32, f32) = (-12.0, 12.0);

impl CrossoverBandConfig {
    /// Clamp the numeric fields into their legal ranges and round illegal family/slope
    /// combinations up to the closest legal one. Structurally impossible requests (a band-pass
    /// whose corners are inverted) are errors and leave the previous configuration in place.
    pub fn validated(mut self, sample_rate: f32) -> Result<(Self, Applied), Error> {
        let mut clamped = false;
        let max_frequency = 20_000.0f32.min(sample_rate / 2.0 - 1.0);

        self.frequency = util::observed_clamp(self.frequency, 20.0, max_frequency, &mut clamped);
        self.upper_frequency =
            util::observed_clamp(self.upper_frequency, 20.0, max_frequency, &mut clamped);
        self.gain_db =
            util::observed_clamp(self.gain_db, GAIN_RANGE_DB.0, GAIN_RANGE_DB.1, &mut clamped);

        // Linkwitz-Riley only exists at even orders
        if self.family == FilterFamily::LinkwitzRiley && self.slope != self.slope.next_even() {
            self.slope = self.slope.next_even();
            clamped = true;
        }

        self.check_corners()?;

        Ok((self, Applied::from_clamped(clamped)))
    }

    /// The structural invariant that holds regardless of the sample rate: a band-pass needs its
    /// corners in order. Deserialized states are checked against this before they are accepted.
    pub fn check_corners(&self) -> Result<(), Error> {
        if self.kind == BandKind::BandPass && self.frequency >= self.upper_frequency {
            return Err(Error::InvalidMode(
                "a band-pass needs its lower corner below its upper corner",
            ));
        }

        Ok(())
    }
}

/// One output channel's crossover: a low-pass cascade, a high-pass cascade, and the band gain.
/// Which cascades actually run depends on the band kind.
#[derive(Debug, Clone, Default)]
pub struct CrossoverChannel {
    config: CrossoverBandConfig,
    lowpass: FilterCascade,
    highpass: FilterCascade,
}

impl CrossoverChannel {
    /// The committed configuration.
    pub fn config(&self) -> &CrossoverBandConfig {
        &self.config
    }

    /// Rebuild both cascades for a new configuration. The section states are cleared, so the
    /// caller should only invoke this at a block boundary with an already validated
    /// configuration.
    pub fn configure(&mut self, config: &CrossoverBandConfig, sample_rate: f32) {
        self.config = *config;

        let order = config.slope.order();
        let gain = util::db_to_gain(config.gain_db);
        // A sample rate change can leave a staged frequency above the new Nyquist limit, so the
        // design inputs are clamped again here
        let frequency = util::clamp_frequency(config.frequency, sample_rate);
        let upper_frequency = util::clamp_frequency(config.upper_frequency, sample_rate);

        // Replacing the cascades wholesale also resets their states
        match config.kind {
            BandKind::Bypass => {
                self.lowpass = FilterCascade::bypass();
                self.highpass = FilterCascade::bypass();
                self.lowpass.gain = gain;
            }
            BandKind::LowPass => {
                self.lowpass = cascade(
                    design::lowpass(config.family, order, sample_rate, frequency),
                    gain,
                );
                self.highpass = FilterCascade::bypass();
            }
            BandKind::HighPass => {
                self.highpass = cascade(
                    design::highpass(config.family, order, sample_rate, frequency),
                    gain,
                );
                self.lowpass = FilterCascade::bypass();
            }
            BandKind::BandPass => {
                self.highpass = cascade(
                    design::highpass(config.family, order, sample_rate, frequency),
                    1.0,
                );
                self.lowpass = cascade(
                    design::lowpass(config.family, order, sample_rate, upper_frequency),
                    gain,
                );
            }
        }
    }

    /// Route a sample through the active cascades. Disabled bands pass audio through untouched.
    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        if !self.config.enabled {
            return sample;
        }

        match self.config.kind {
            // The bypass cascade has no sections, so this only applies the band gain
            BandKind::Bypass | BandKind::LowPass => self.lowpass.process(sample),
            BandKind::HighPass => self.highpass.process(sample),
            BandKind::BandPass => self.lowpass.process(self.highpass.process(sample)),
        }
    }

    /// Clear all section states.
    pub fn reset(&mut self) {
        self.lowpass.reset();
        self.highpass.reset();
    }
}

fn cascade(coefficients: design::CascadeCoefficients, gain: f32) -> FilterCascade {
    let mut cascade = FilterCascade::bypass();
    cascade.set_coefficients(&coefficients);
    cascade.gain = gain;
    cascade
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts;

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn validation_clamps_and_reports() {
        let config = CrossoverBandConfig {
            frequency: 5.0,
            gain_db: 40.0,
            ..CrossoverBandConfig::default()
        };
        let (adopted, applied) = config.validated(48_000.0).unwrap();
        assert_eq!(adopted.frequency, 20.0);
        assert_eq!(adopted.gain_db, 12.0);
        assert!(applied.was_clamped());

        let (adopted, applied) = CrossoverBandConfig::default().validated(48_000.0).unwrap();
        assert_eq!(adopted, CrossoverBandConfig::default());
        assert!(!applied.was_clamped());
    }

    #[test]
    fn linkwitz_riley_rounds_odd_slopes_up() {
        let config = CrossoverBandConfig {
            kind: BandKind::LowPass,
            family: FilterFamily::LinkwitzRiley,
            slope: Slope::Db18,
            ..CrossoverBandConfig::default()
        };
        let (adopted, applied) = config.validated(48_000.0).unwrap();
        assert_eq!(adopted.slope, Slope::Db24);
        assert!(applied.was_clamped());

        // Butterworth is fine with odd orders
        let config = CrossoverBandConfig {
            family: FilterFamily::Butterworth,
            slope: Slope::Db18,
            ..CrossoverBandConfig::default()
        };
        let (adopted, _) = config.validated(48_000.0).unwrap();
        assert_eq!(adopted.slope, Slope::Db18);
    }

    #[test]
    fn inverted_band_pass_corners_are_rejected() {
        let config = CrossoverBandConfig {
            kind: BandKind::BandPass,
            frequency: 2_000.0,
            upper_frequency: 500.0,
            ..CrossoverBandConfig::default()
        };
        assert!(config.validated(48_000.0).is_err());
    }

    #[test]
    fn bypass_applies_only_the_band_gain() {
        let mut channel = CrossoverChannel::default();
        channel.configure(
            &CrossoverBandConfig {
                kind: BandKind::Bypass,
                gain_db: -6.02,
                ..CrossoverBandConfig::default()
            },
            48_000.0,
        );

        assert_relative_eq!(channel.process_sample(1.0), 0.5, epsilon = 1e-3);
    }

    #[test]
    fn disabled_bands_pass_through() {
        let mut channel = CrossoverChannel::default();
        channel.configure(
            &CrossoverBandConfig {
                kind: BandKind::LowPass,
                frequency: 100.0,
                enabled: false,
                ..CrossoverBandConfig::default()
            },
            48_000.0,
        );

        for x in [1.0, -0.5, 0.25] {
            assert_eq!(channel.process_sample(x), x);
        }
    }

    #[test]
    fn low_pass_attenuates_high_frequencies() {
        let mut channel = CrossoverChannel::default();
        channel.configure(
            &CrossoverBandConfig {
                kind: BandKind::LowPass,
                frequency: 1_000.0,
                family: FilterFamily::Butterworth,
                slope: Slope::Db24,
                ..CrossoverBandConfig::default()
            },
            48_000.0,
        );

        // An 8 kHz sine is three octaves above the corner, so an order 4 filter attenuates it by
        // roughly 72 dB
        let output: Vec<f32> = (0..8_192)
            .map(|n| channel.process_sample((consts::TAU * 8_000.0 * n as f32 / 48_000.0).sin()))
            .collect();
        let steady_state = &output[4_096..];
        assert!(rms(steady_state) < util::db_to_gain(-60.0) * consts::FRAC_1_SQRT_2);
    }

    #[test]
    fn band_pass_passes_the_middle() {
        let mut channel = CrossoverChannel::default();
        channel.configure(
            &CrossoverBandConfig {
                kind: BandKind::BandPass,
                frequency: 250.0,
                upper_frequency: 2_500.0,
                ..CrossoverBandConfig::default()
            },
            48_000.0,
        );

        // 1 kHz sits in the middle of the pass band
        let output: Vec<f32> = (0..8_192)
            .map(|n| channel.process_sample((consts::TAU * 1_000.0 * n as f32 / 48_000.0).sin()))
            .collect();
        let steady_state = &output[4_096..];
        assert_relative_eq!(rms(steady_state), consts::FRAC_1_SQRT_2, epsilon = 0.05);
    }
}
