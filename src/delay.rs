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

/// Extra samples allocated past the configured maximum so the interpolators can always read a
/// full neighbourhood.
const BUFFER_PADDING: usize = 16;

/// The speed of sound used by the distance setters, in meters per second at the 20 degree
/// reference temperature.
const SPEED_OF_SOUND: f32 = 343.0;

/// The speed of sound at a given air temperature in meters per second.
fn speed_of_sound_at(temperature_c: f32) -> f32 {
    331.3 + 0.606 * temperature_c
}

/// The factor a logical delay time is multiplied with to compensate for the air temperature
/// deviating from the 20 degree reference. Warmer air carries sound faster, so the same distance
/// needs less delay.
pub fn temperature_factor(temperature_c: f32) -> f32 {
    speed_of_sound_at(20.0) / speed_of_sound_at(temperature_c)
}

/// Convert a driver distance in centimeters to the delay in milliseconds at the reference
/// temperature.
pub fn distance_cm_to_ms(centimeters: f32) -> f32 {
    centimeters / 100.0 / SPEED_OF_SOUND * 1000.0
}

/// Convert a driver distance in inches to the delay in milliseconds at the reference
/// temperature.
pub fn distance_in_to_ms(inches: f32) -> f32 {
    distance_cm_to_ms(inches * 2.54)
}

/// How the fractional read position is interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    /// Two-point linear interpolation.
    Linear,
    /// Four-point Hermite interpolation.
    Cubic,
}

/// The alignment delay's parameters. `time_ms` is the logical delay at the 20 degree reference;
/// the engine-wide temperature compensation scales it before it becomes a sample count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub time_ms: f32,
    pub phase_invert: bool,
    /// Wet/dry mix; 1.0 is the fully delayed signal.
    pub mix: f32,
    pub interpolation: Interpolation,
    /// One-pole coefficient applied to the delayed signal, 0.0 disables the smoothing.
    pub smoothing: f32,
    pub enabled: bool,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            time_ms: 0.0,
            phase_invert: false,
            mix: 1.0,
            interpolation: Interpolation::Linear,
            smoothing: 0.0,
            enabled: true,
        }
    }
}

impl DelayConfig {
    pub fn clamped(mut self, max_delay_ms: f32) -> (Self, Applied) {
        let mut clamped = false;
        self.time_ms = util::observed_clamp(self.time_ms, 0.0, max_delay_ms, &mut clamped);
        self.mix = util::observed_clamp(self.mix, 0.0, 1.0, &mut clamped);
        self.smoothing = util::observed_clamp(self.smoothing, 0.0, 0.999, &mut clamped);

        (self, Applied::from_clamped(clamped))
    }
}

/// A fractional delay line for one output channel. The ring is allocated once for the engine's
/// maximum delay and never reallocated.
#[derive(Debug, Clone)]
pub struct DelayLine {
    config: DelayConfig,

    buffer: Vec<f32>,
    write_pos: usize,
    /// The effective delay in samples, including the temperature compensation.
    delay_samples: f32,
    prev_output: f32,
}

impl DelayLine {
    pub fn new(max_delay_ms: f32, sample_rate: f32) -> Self {
        let len = (max_delay_ms / 1000.0 * sample_rate).ceil() as usize + BUFFER_PADDING;

        Self {
            config: DelayConfig::default(),
            buffer: vec![0.0; len],
            write_pos: 0,
            delay_samples: 0.0,
            prev_output: 0.0,
        }
    }

    pub fn config(&self) -> &DelayConfig {
        &self.config
    }

    /// Recompute the effective sample delay for a new configuration and temperature factor. The
    /// ring contents are retained; a change in delay time simply moves the read tap.
    pub fn configure(&mut self, config: &DelayConfig, temperature_factor: f32, sample_rate: f32) {
        self.config = *config;

        let max_samples = (self.buffer.len() - (BUFFER_PADDING / 2)) as f32;
        self.delay_samples =
            (config.time_ms * temperature_factor / 1000.0 * sample_rate).clamp(0.0, max_samples);
    }

    /// Zero the ring and the smoothing history.
    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.prev_output = 0.0;
    }

    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        let len = self.buffer.len();
        // The ring stays warm even while bypassed so enabling the delay doesn't replay stale
        // audio
        self.buffer[self.write_pos] = sample;

        if !self.config.enabled {
            self.write_pos = (self.write_pos + 1) % len;
            return sample;
        }

        let mut read_pos = self.write_pos as f32 - self.delay_samples;
        if read_pos < 0.0 {
            read_pos += len as f32;
        }
        let index = (read_pos as usize).min(len - 1);
        let frac = read_pos - index as f32;

        let mut delayed = match self.config.interpolation {
            Interpolation::Linear => {
                let x0 = self.buffer[index];
                let x1 = self.buffer[(index + 1) % len];
                x0 * (1.0 - frac) + x1 * frac
            }
            Interpolation::Cubic => {
                let xm1 = self.buffer[(index + len - 1) % len];
                let x0 = self.buffer[index];
                let x1 = self.buffer[(index + 1) % len];
                let x2 = self.buffer[(index + 2) % len];

                // 4-point Hermite
                let c1 = 0.5 * (x1 - xm1);
                let c2 = xm1 - 2.5 * x0 + 2.0 * x1 - 0.5 * x2;
                let c3 = 0.5 * (x2 - xm1) + 1.5 * (x0 - x1);
                ((c3 * frac + c2) * frac + c1) * frac + x0
            }
        };

        if self.config.phase_invert {
            delayed = -delayed;
        }

        if self.config.smoothing > 0.0 {
            delayed = self.config.smoothing * self.prev_output
                + (1.0 - self.config.smoothing) * delayed;
        }
        self.prev_output = delayed;

        self.write_pos = (self.write_pos + 1) % len;

        self.config.mix * delayed + (1.0 - self.config.mix) * sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn impulse_response(delay: &mut DelayLine, length: usize) -> Vec<f32> {
        (0..length)
            .map(|n| delay.process_sample(if n == 0 { 1.0 } else { 0.0 }))
            .collect()
    }

    fn peak_index(samples: &[f32]) -> usize {
        samples
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
            .map(|(index, _)| index)
            .unwrap()
    }

    #[test]
    fn one_millisecond_is_48_samples() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                time_ms: 1.0,
                ..DelayConfig::default()
            },
            1.0,
            48_000.0,
        );

        let output = impulse_response(&mut delay, 128);
        assert_abs_diff_eq!(output[48], 1.0, epsilon = 0.01);
        for (n, y) in output.iter().enumerate() {
            if n != 48 {
                assert!(y.abs() < 0.01, "unexpected output {y} at sample {n}");
            }
        }
    }

    #[test]
    fn bypassed_delay_is_the_identity() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                time_ms: 5.0,
                enabled: false,
                ..DelayConfig::default()
            },
            1.0,
            48_000.0,
        );

        for x in [1.0, -0.5, 0.25, 0.0] {
            assert_eq!(delay.process_sample(x), x);
        }
    }

    #[test]
    fn zero_delay_passes_through() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(&DelayConfig::default(), 1.0, 48_000.0);

        for x in [1.0, -0.5, 0.25] {
            assert_abs_diff_eq!(delay.process_sample(x), x, epsilon = 1e-6);
        }
    }

    #[test]
    fn fractional_delays_interpolate() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                // 24.5 samples
                time_ms: 24.5 / 48.0,
                ..DelayConfig::default()
            },
            1.0,
            48_000.0,
        );

        let output = impulse_response(&mut delay, 64);
        // A half-sample linear interpolation splits the impulse over two samples
        assert_abs_diff_eq!(output[24], 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(output[25], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn cubic_interpolation_keeps_the_peak_position() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                time_ms: 1.0,
                interpolation: Interpolation::Cubic,
                ..DelayConfig::default()
            },
            1.0,
            48_000.0,
        );

        let output = impulse_response(&mut delay, 128);
        let peak = peak_index(&output);
        assert!((47..=49).contains(&peak));
    }

    #[test]
    fn phase_invert_flips_the_sign() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                time_ms: 1.0,
                phase_invert: true,
                ..DelayConfig::default()
            },
            1.0,
            48_000.0,
        );

        let output = impulse_response(&mut delay, 64);
        assert_abs_diff_eq!(output[48], -1.0, epsilon = 0.01);
    }

    #[test]
    fn warmer_air_shortens_the_effective_delay() {
        let factor = temperature_factor(30.0);
        assert!(factor < 1.0);

        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                time_ms: 10.0,
                ..DelayConfig::default()
            },
            factor,
            48_000.0,
        );

        let output = impulse_response(&mut delay, 512);
        let expected = (10.0 * factor / 1000.0 * 48_000.0).round() as usize;
        let peak = peak_index(&output);
        assert!(expected.abs_diff(peak) <= 1);
        assert!(peak < 480);
    }

    #[test]
    fn reference_temperature_changes_nothing() {
        assert_relative_eq!(temperature_factor(20.0), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn distance_conversions_use_the_speed_of_sound() {
        // 3.43 m of distance is 10 ms of delay
        assert_relative_eq!(distance_cm_to_ms(343.0), 10.0, epsilon = 1e-4);
        assert_relative_eq!(distance_in_to_ms(343.0 / 2.54), 10.0, epsilon = 1e-4);
    }

    #[test]
    fn smoothing_smears_the_impulse() {
        let mut delay = DelayLine::new(20.0, 48_000.0);
        delay.configure(
            &DelayConfig {
                time_ms: 1.0,
                smoothing: 0.5,
                ..DelayConfig::default()
            },
            1.0,
            48_000.0,
        );

        let output = impulse_response(&mut delay, 128);
        assert!(output[48] < 1.0);
        assert!(output[49] > 0.0);
    }

    #[test]
    fn clamping_is_observable() {
        let (config, applied) = DelayConfig {
            time_ms: 100.0,
            mix: 2.0,
            ..DelayConfig::default()
        }
        .clamped(20.0);

        assert_eq!(config.time_ms, 20.0);
        assert_eq!(config.mix, 1.0);
        assert!(applied.was_clamped());
    }
}
