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

use std::f32::consts;

/// A simple biquad filter with functions for generating coefficients for all of the second order
/// filter types used in the crossover and the parametric EQ.
///
/// Based on <https://en.wikipedia.org/wiki/Digital_biquad_filter#Transposed_direct_forms>.
#[derive(Clone, Copy, Debug)]
pub struct Biquad {
    pub coefficients: BiquadCoefficients,
    s1: f32,
    s2: f32,
}

/// The coefficients `[b0, b1, b2, a1, a2]` for [`Biquad`]. These coefficients are all
/// prenormalized, i.e. they have been divided by `a0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for Biquad {
    /// Before setting constants the filter should just act as an identity function.
    fn default() -> Self {
        Self {
            coefficients: BiquadCoefficients::identity(),
            s1: 0.0,
            s2: 0.0,
        }
    }
}

impl Biquad {
    /// Process a single sample.
    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let result = self.coefficients.b0 * sample + self.s1;

        self.s1 = self.coefficients.b1 * sample - self.coefficients.a1 * result + self.s2;
        self.s2 = self.coefficients.b2 * sample - self.coefficients.a2 * result;

        result
    }

    /// Process a single sample, clearing the state and substituting silence if the filter
    /// produced a non-finite value. This is a last-resort safety net and should never trigger
    /// with coefficients from this module.
    #[inline]
    pub fn process_checked(&mut self, sample: f32) -> f32 {
        let result = self.process(sample);
        if result.is_finite() {
            result
        } else {
            self.reset();
            0.0
        }
    }

    /// Reset the state to zero, useful after making large, non-interpolatable changes to the
    /// filter coefficients.
    pub fn reset(&mut self) {
        self.s1 = 0.0;
        self.s2 = 0.0;
    }
}

impl BiquadCoefficients {
    /// Filter coefficients that would cause the sound to be passed through as is.
    pub fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Whether both poles of `z^2 + a1*z + a2` lie strictly inside the unit circle. Every
    /// coefficient set produced by this module and by the crossover designs must pass this.
    pub fn is_stable(&self) -> bool {
        self.a2.abs() < 1.0 && self.a1.abs() < 1.0 + self.a2
    }

    /// Compute the coefficients for a low-pass filter.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn lowpass(sample_rate: f32, frequency: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);

        // We'll prenormalize everything with a0
        let a0 = 1.0 + alpha;
        let b0 = ((1.0 - cos_omega0) / 2.0) / a0;
        let b1 = (1.0 - cos_omega0) / a0;
        let b2 = ((1.0 - cos_omega0) / 2.0) / a0;
        let a1 = (-2.0 * cos_omega0) / a0;
        let a2 = (1.0 - alpha) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a high-pass filter.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn highpass(sample_rate: f32, frequency: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);

        // We'll prenormalize everything with a0
        let a0 = 1.0 + alpha;
        let b0 = ((1.0 + cos_omega0) / 2.0) / a0;
        let b1 = -(1.0 + cos_omega0) / a0;
        let b2 = ((1.0 + cos_omega0) / 2.0) / a0;
        let a1 = (-2.0 * cos_omega0) / a0;
        let a2 = (1.0 - alpha) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a band-pass filter with a constant 0 dB peak gain.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn bandpass(sample_rate: f32, frequency: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        let b0 = alpha / a0;
        let b1 = 0.0;
        let b2 = -alpha / a0;
        let a1 = (-2.0 * cos_omega0) / a0;
        let a2 = (1.0 - alpha) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a notch filter.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn notch(sample_rate: f32, frequency: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        let b0 = 1.0 / a0;
        let b1 = (-2.0 * cos_omega0) / a0;
        let b2 = 1.0 / a0;
        let a1 = (-2.0 * cos_omega0) / a0;
        let a2 = (1.0 - alpha) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for an all-pass filter.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn allpass(sample_rate: f32, frequency: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);

        // We'll prenormalize everything with a0
        let a0 = 1.0 + alpha;
        let b0 = (1.0 - alpha) / a0;
        let b1 = (-2.0 * cos_omega0) / a0;
        let b2 = (1.0 + alpha) / a0;
        let a1 = (-2.0 * cos_omega0) / a0;
        let a2 = (1.0 - alpha) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a peaking bell filter.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn peaking_eq(sample_rate: f32, frequency: f32, db_gain: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let a = 10f32.powf(db_gain / 40.0);
        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        let b0 = (1.0 + alpha * a) / a0;
        let b1 = (-2.0 * cos_omega0) / a0;
        let b2 = (1.0 - alpha * a) / a0;
        let a1 = (-2.0 * cos_omega0) / a0;
        let a2 = (1.0 - alpha / a) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a low shelf.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn low_shelf(sample_rate: f32, frequency: f32, db_gain: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let a = 10f32.powf(db_gain / 40.0);
        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);
        let alpha_sqrt_a = 2.0 * a.sqrt() * alpha;

        let a0 = (a + 1.0) + (a - 1.0) * cos_omega0 + alpha_sqrt_a;
        let b0 = (a * ((a + 1.0) - (a - 1.0) * cos_omega0 + alpha_sqrt_a)) / a0;
        let b1 = (2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega0)) / a0;
        let b2 = (a * ((a + 1.0) - (a - 1.0) * cos_omega0 - alpha_sqrt_a)) / a0;
        let a1 = (-2.0 * ((a - 1.0) + (a + 1.0) * cos_omega0)) / a0;
        let a2 = ((a + 1.0) + (a - 1.0) * cos_omega0 - alpha_sqrt_a) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a high shelf.
    ///
    /// Based on <http://shepazu.github.io/Audio-EQ-Cookbook/audio-eq-cookbook.html>.
    pub fn high_shelf(sample_rate: f32, frequency: f32, db_gain: f32, q: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);
        qm_debug_assert!(q > 0.0);

        let a = 10f32.powf(db_gain / 40.0);
        let omega0 = consts::TAU * (frequency / sample_rate);
        let cos_omega0 = omega0.cos();
        let alpha = omega0.sin() / (2.0 * q);
        let alpha_sqrt_a = 2.0 * a.sqrt() * alpha;

        let a0 = (a + 1.0) - (a - 1.0) * cos_omega0 + alpha_sqrt_a;
        let b0 = (a * ((a + 1.0) + (a - 1.0) * cos_omega0 + alpha_sqrt_a)) / a0;
        let b1 = (-2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega0)) / a0;
        let b2 = (a * ((a + 1.0) + (a - 1.0) * cos_omega0 - alpha_sqrt_a)) / a0;
        let a1 = (2.0 * ((a - 1.0) - (a + 1.0) * cos_omega0)) / a0;
        let a2 = ((a + 1.0) - (a - 1.0) * cos_omega0 - alpha_sqrt_a) / a0;

        Self { b0, b1, b2, a1, a2 }
    }

    /// Compute the coefficients for a first order low-pass section, expressed as a biquad with
    /// `b2 = a2 = 0`. The odd-order crossover designs need these.
    pub fn lowpass_first_order(sample_rate: f32, frequency: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);

        // The bilinear transform of `1 / (1 + s/wc)`, with the pre-warp baked into the tangent
        let k = (consts::PI * frequency / sample_rate).tan();
        let a0 = k + 1.0;
        let b0 = k / a0;
        let b1 = k / a0;
        let a1 = (k - 1.0) / a0;

        Self {
            b0,
            b1,
            b2: 0.0,
            a1,
            a2: 0.0,
        }
    }

    /// Compute the coefficients for a first order high-pass section, expressed as a biquad with
    /// `b2 = a2 = 0`.
    pub fn highpass_first_order(sample_rate: f32, frequency: f32) -> Self {
        qm_debug_assert!(sample_rate > 0.0);
        qm_debug_assert!(frequency > 0.0);
        qm_debug_assert!(frequency < sample_rate / 2.0);

        let k = (consts::PI * frequency / sample_rate).tan();
        let a0 = k + 1.0;
        let b0 = 1.0 / a0;
        let b1 = -1.0 / a0;
        let a1 = (k - 1.0) / a0;

        Self {
            b0,
            b1,
            b2: 0.0,
            a1,
            a2: 0.0,
        }
    }
}

/// The complex frequency response of a coefficient set, evaluated analytically on the unit
/// circle in f64 so tests don't accumulate error. Only compiled for tests.
#[cfg(test)]
pub(crate) fn response(
    coefficients: &BiquadCoefficients,
    frequency: f32,
    sample_rate: f32,
) -> (f64, f64) {
    let omega = std::f64::consts::TAU * (frequency as f64) / (sample_rate as f64);
    let (b0, b1, b2) = (
        coefficients.b0 as f64,
        coefficients.b1 as f64,
        coefficients.b2 as f64,
    );
    let (a1, a2) = (coefficients.a1 as f64, coefficients.a2 as f64);

    // H(e^jw) = (b0 + b1 e^-jw + b2 e^-2jw) / (1 + a1 e^-jw + a2 e^-2jw)
    let num_re = b0 + b1 * omega.cos() + b2 * (2.0 * omega).cos();
    let num_im = -b1 * omega.sin() - b2 * (2.0 * omega).sin();
    let den_re = 1.0 + a1 * omega.cos() + a2 * (2.0 * omega).cos();
    let den_im = -a1 * omega.sin() - a2 * (2.0 * omega).sin();

    // Complex division
    let den_mag_sq = den_re * den_re + den_im * den_im;
    (
        (num_re * den_re + num_im * den_im) / den_mag_sq,
        (num_im * den_re - num_re * den_im) / den_mag_sq,
    )
}

/// The magnitude response of a coefficient set at a frequency. Only compiled for tests.
#[cfg(test)]
pub(crate) fn magnitude(
    coefficients: &BiquadCoefficients,
    frequency: f32,
    sample_rate: f32,
) -> f64 {
    let (re, im) = response(coefficients, frequency, sample_rate);
    re.hypot(im)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_passes_audio_through() {
        let mut filter = Biquad::default();
        for x in [0.0, 1.0, -0.5, 0.25] {
            assert_eq!(filter.process(x), x);
        }
    }

    #[test]
    fn lowpass_keeps_dc_and_kills_nyquist() {
        let coefficients = BiquadCoefficients::lowpass(48_000.0, 1_000.0, 0.707);
        assert_relative_eq!(magnitude(&coefficients, 1.0, 48_000.0), 1.0, epsilon = 1e-3);
        assert!(magnitude(&coefficients, 20_000.0, 48_000.0) < 1e-2);
    }

    #[test]
    fn highpass_is_the_mirror_image() {
        let coefficients = BiquadCoefficients::highpass(48_000.0, 1_000.0, 0.707);
        assert!(magnitude(&coefficients, 10.0, 48_000.0) < 1e-3);
        assert_relative_eq!(
            magnitude(&coefficients, 20_000.0, 48_000.0),
            1.0,
            epsilon = 1e-2
        );
    }

    #[test]
    fn peaking_hits_its_gain_at_the_center() {
        let coefficients = BiquadCoefficients::peaking_eq(48_000.0, 1_000.0, 6.0, 1.0);
        let center = magnitude(&coefficients, 1_000.0, 48_000.0);
        assert_relative_eq!(20.0 * center.log10(), 6.0, epsilon = 0.05);
        // Far away from the bell the response returns to unity
        assert_relative_eq!(magnitude(&coefficients, 20.0, 48_000.0), 1.0, epsilon = 1e-2);
    }

    #[test]
    fn shelves_converge_to_their_gain() {
        let low = BiquadCoefficients::low_shelf(48_000.0, 1_000.0, 6.0, 0.707);
        assert_relative_eq!(20.0 * magnitude(&low, 10.0, 48_000.0).log10(), 6.0, epsilon = 0.1);
        assert_relative_eq!(magnitude(&low, 20_000.0, 48_000.0), 1.0, epsilon = 1e-2);

        let high = BiquadCoefficients::high_shelf(48_000.0, 1_000.0, -6.0, 0.707);
        assert_relative_eq!(
            20.0 * magnitude(&high, 20_000.0, 48_000.0).log10(),
            -6.0,
            epsilon = 0.1
        );
        assert_relative_eq!(magnitude(&high, 10.0, 48_000.0), 1.0, epsilon = 1e-2);
    }

    #[test]
    fn notch_notches_and_allpass_passes() {
        let notch = BiquadCoefficients::notch(48_000.0, 1_000.0, 2.0);
        assert!(magnitude(&notch, 1_000.0, 48_000.0) < 1e-3);
        assert_relative_eq!(magnitude(&notch, 20.0, 48_000.0), 1.0, epsilon = 1e-2);

        let allpass = BiquadCoefficients::allpass(48_000.0, 1_000.0, 0.707);
        for freq in [20.0, 100.0, 1_000.0, 10_000.0] {
            assert_relative_eq!(magnitude(&allpass, freq, 48_000.0), 1.0, epsilon = 1e-3);
        }
    }

    fn all_kinds(frequency: f32, q: f32) -> [BiquadCoefficients; 7] {
        [
            BiquadCoefficients::lowpass(48_000.0, frequency, q),
            BiquadCoefficients::highpass(48_000.0, frequency, q),
            BiquadCoefficients::bandpass(48_000.0, frequency, q),
            BiquadCoefficients::notch(48_000.0, frequency, q),
            BiquadCoefficients::peaking_eq(48_000.0, frequency, 12.0, q),
            BiquadCoefficients::low_shelf(48_000.0, frequency, -12.0, q),
            BiquadCoefficients::high_shelf(48_000.0, frequency, 12.0, q),
        ]
    }

    #[test]
    fn clamp_range_frequencies_are_stable() {
        for frequency in [20.0, 1_000.0, 20_000.0] {
            for q in [0.1, 0.707, 10.0] {
                for coefficients in all_kinds(frequency, q) {
                    assert!(
                        coefficients.is_stable(),
                        "unstable at {frequency} Hz with Q {q}: {coefficients:?}"
                    );
                }
            }
        }
    }

    /// Right at the Nyquist boundary `cos(w0)` rounds to -1 in single precision and a pole can
    /// land exactly on the unit circle (cancelled by a matching zero). The contract there is
    /// only that the coefficients stay finite.
    #[test]
    fn nyquist_boundary_stays_finite() {
        for q in [0.1, 0.707, 10.0] {
            for coefficients in all_kinds(23_999.0, q) {
                for value in [
                    coefficients.b0,
                    coefficients.b1,
                    coefficients.b2,
                    coefficients.a1,
                    coefficients.a2,
                ] {
                    assert!(value.is_finite());
                }
            }
        }
    }

    #[test]
    fn first_order_sections_are_stable() {
        for frequency in [20.0, 1_000.0, 23_999.0] {
            assert!(BiquadCoefficients::lowpass_first_order(48_000.0, frequency).is_stable());
            assert!(BiquadCoefficients::highpass_first_order(48_000.0, frequency).is_stable());
        }
    }

    #[test]
    fn blown_up_state_soft_resets() {
        let mut filter = Biquad {
            coefficients: BiquadCoefficients::identity(),
            s1: f32::NAN,
            s2: 0.0,
        };

        assert_eq!(filter.process_checked(1.0), 0.0);
        // The state was cleared, so the next sample passes through again
        assert_eq!(filter.process_checked(1.0), 1.0);
    }
}
