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

//! Coefficient derivation for the crossover filter families. The designs are deterministic and
//! always yield prenormalized, stable biquad sections; steeper slopes stack more sections in
//! series.

use serde::{Deserialize, Serialize};
use std::f32::consts;

use crate::biquad::{Biquad, BiquadCoefficients};

/// The maximum number of biquad sections a single cascade can hold. An eighth order filter needs
/// four.
pub const MAX_STAGES: usize = 4;

/// The filter family used for a crossover band's low-pass and high-pass cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterFamily {
    /// Maximally flat passband magnitude.
    Butterworth,
    /// Two cascaded Butterworth halves. The low-pass and high-pass branches are each 6 dB down at
    /// the crossover frequency and sum flat.
    LinkwitzRiley,
    /// Maximally flat group delay, designed from a pretabulated pole table.
    Bessel,
}

/// A crossover slope. The filter order is the slope divided by 6 dB/octave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slope {
    Db6,
    Db12,
    Db18,
    Db24,
    Db36,
    Db48,
}

impl Slope {
    /// The filter order this slope corresponds to.
    pub fn order(self) -> u32 {
        match self {
            Slope::Db6 => 1,
            Slope::Db12 => 2,
            Slope::Db18 => 3,
            Slope::Db24 => 4,
            Slope::Db36 => 6,
            Slope::Db48 => 8,
        }
    }

    /// The slope in decibels per octave.
    pub fn db_per_octave(self) -> u32 {
        self.order() * 6
    }

    /// Linkwitz-Riley filters only exist at even orders. Odd-order slopes round up to the next
    /// legal slope, and the adopted value is observable through the configuration read-back.
    pub fn next_even(self) -> Slope {
        match self {
            Slope::Db6 => Slope::Db12,
            Slope::Db18 => Slope::Db24,
            other => other,
        }
    }
}

/// Coefficients for up to [`MAX_STAGES`] biquad sections in series. This is what the design
/// functions return; the collection is fixed-size so designing never allocates.
#[derive(Debug, Clone, Copy)]
pub struct CascadeCoefficients {
    stages: [BiquadCoefficients; MAX_STAGES],
    len: usize,
}

impl CascadeCoefficients {
    fn empty() -> Self {
        Self {
            stages: [BiquadCoefficients::identity(); MAX_STAGES],
            len: 0,
        }
    }

    fn push(&mut self, coefficients: BiquadCoefficients) {
        qm_debug_assert!(self.len < MAX_STAGES);
        if self.len < MAX_STAGES {
            self.stages[self.len] = coefficients;
            self.len += 1;
        }
    }

    pub fn as_slice(&self) -> &[BiquadCoefficients] {
        &self.stages[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An ordered run of biquad sections plus an output gain. Sections past `num_stages` hold no
/// state and are never touched by processing.
#[derive(Debug, Clone)]
pub struct FilterCascade {
    stages: [Biquad; MAX_STAGES],
    num_stages: usize,
    pub gain: f32,
}

impl Default for FilterCascade {
    fn default() -> Self {
        Self::bypass()
    }
}

impl FilterCascade {
    /// A cascade with no sections that passes audio through as is.
    pub fn bypass() -> Self {
        Self {
            stages: [Biquad::default(); MAX_STAGES],
            num_stages: 0,
            gain: 1.0,
        }
    }

    /// Swap in a new set of sections. The caller decides whether the section states should also
    /// be cleared; retuning an active cascade keeps them.
    pub fn set_coefficients(&mut self, coefficients: &CascadeCoefficients) {
        for (stage, new) in self.stages.iter_mut().zip(coefficients.as_slice()) {
            stage.coefficients = *new;
        }
        self.num_stages = coefficients.len();
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    /// Clear every section's state.
    pub fn reset(&mut self) {
        for stage in &mut self.stages[..self.num_stages] {
            stage.reset();
        }
    }

    /// Process a single sample through all sections and apply the output gain.
    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let mut sample = sample;
        for stage in &mut self.stages[..self.num_stages] {
            sample = stage.process_checked(sample);
        }

        sample * self.gain
    }
}

/// Design the low-pass half of a crossover at `frequency`. `order` must be even for
/// Linkwitz-Riley; the [`Slope`] handling in the crossover takes care of that before calling
/// this.
pub fn lowpass(
    family: FilterFamily,
    order: u32,
    sample_rate: f32,
    frequency: f32,
) -> CascadeCoefficients {
    design(family, order, sample_rate, frequency, Side::Lowpass)
}

/// Design the high-pass half of a crossover at `frequency`.
pub fn highpass(
    family: FilterFamily,
    order: u32,
    sample_rate: f32,
    frequency: f32,
) -> CascadeCoefficients {
    design(family, order, sample_rate, frequency, Side::Highpass)
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Lowpass,
    Highpass,
}

fn design(
    family: FilterFamily,
    order: u32,
    sample_rate: f32,
    frequency: f32,
    side: Side,
) -> CascadeCoefficients {
    qm_debug_assert!((1..=8).contains(&order));
    qm_debug_assert!(frequency > 0.0 && frequency < sample_rate / 2.0);
    let order = order.clamp(1, 8);

    match family {
        FilterFamily::Butterworth => butterworth(order, sample_rate, frequency, side),
        FilterFamily::LinkwitzRiley => linkwitz_riley(order, sample_rate, frequency, side),
        FilterFamily::Bessel => bessel(order, sample_rate, frequency, side),
    }
}

/// The section Q for pair `k` of a Butterworth filter of the given order, from the pole angles
/// of the analog prototype.
fn butterworth_q(order: u32, k: u32) -> f32 {
    let n = order as f32;
    if order % 2 == 0 {
        // Q_k = 1 / (2 cos((2k + 1) pi / 2N))
        1.0 / (2.0 * ((2.0 * k as f32 + 1.0) * consts::PI / (2.0 * n)).cos())
    } else {
        // Odd orders have a real pole handled as a first order section; the pairs sit at
        // multiples of pi / N from the real axis
        1.0 / (2.0 * ((k as f32 + 1.0) * consts::PI / n).cos())
    }
}

fn butterworth(order: u32, sample_rate: f32, frequency: f32, side: Side) -> CascadeCoefficients {
    let mut cascade = CascadeCoefficients::empty();

    if order % 2 == 1 {
        cascade.push(match side {
            Side::Lowpass => BiquadCoefficients::lowpass_first_order(sample_rate, frequency),
            Side::Highpass => BiquadCoefficients::highpass_first_order(sample_rate, frequency),
        });
    }

    for k in 0..order / 2 {
        let q = butterworth_q(order, k);
        cascade.push(match side {
            Side::Lowpass => BiquadCoefficients::lowpass(sample_rate, frequency, q),
            Side::Highpass => BiquadCoefficients::highpass(sample_rate, frequency, q),
        });
    }

    cascade
}

/// A Linkwitz-Riley filter of order N is two Butterworth filters of order N/2 in series.
fn linkwitz_riley(order: u32, sample_rate: f32, frequency: f32, side: Side) -> CascadeCoefficients {
    qm_debug_assert_eq!(order % 2, 0);
    let half = (order / 2).max(1);

    let butterworth_half = butterworth(half, sample_rate, frequency, side);
    let mut cascade = CascadeCoefficients::empty();
    for _ in 0..2 {
        for coefficients in butterworth_half.as_slice() {
            cascade.push(*coefficients);
        }
    }

    cascade
}

/// An analog prototype pole. `im == 0.0` marks the real pole of the odd orders; every other
/// entry stands for a conjugate pair.
struct BesselPole {
    re: f32,
    im: f32,
}

const fn pole(re: f32, im: f32) -> BesselPole {
    BesselPole { re, im }
}

/// Bessel poles normalized to a -3 dB frequency of 1 rad/s, up to order 8. Standard design table
/// values.
const BESSEL_POLES: [&[BesselPole]; 8] = [
    &[pole(-1.0, 0.0)],
    &[pole(-1.101_601_3, 0.636_009_8)],
    &[pole(-1.322_675_8, 0.0), pole(-1.047_409_1, 0.999_264_5)],
    &[
        pole(-1.370_067_8, 0.410_249_7),
        pole(-0.995_208_8, 1.257_105_8),
    ],
    &[
        pole(-1.502_316_0, 0.0),
        pole(-1.380_877_4, 0.717_909_6),
        pole(-0.957_676_6, 1.471_124_4),
    ],
    &[
        pole(-1.571_490_4, 0.320_896_4),
        pole(-1.381_858_1, 0.971_471_9),
        pole(-0.930_656_5, 1.661_863_3),
    ],
    &[
        pole(-1.684_368_2, 0.0),
        pole(-1.612_038_8, 0.589_244_5),
        pole(-1.378_903_2, 1.191_566_7),
        pole(-0.909_867_8, 1.836_451_4),
    ],
    &[
        pole(-1.757_408_4, 0.272_867_9),
        pole(-1.636_939_4, 0.822_795_6),
        pole(-1.373_841_2, 1.388_358_5),
        pole(-0.892_871_0, 2.004_483_4),
    ],
];

/// Design a Bessel filter by frequency-scaling the tabulated poles and realizing each pair as a
/// cookbook section, which bakes in the bilinear pre-warp. The low-pass to high-pass transform
/// `s -> 1/s` turns each pole magnitude into its reciprocal and leaves the section Q unchanged.
fn bessel(order: u32, sample_rate: f32, frequency: f32, side: Side) -> CascadeCoefficients {
    let poles = BESSEL_POLES[(order as usize - 1).min(BESSEL_POLES.len() - 1)];
    // The per-section scaling can push a section past the crossover's own frequency clamp.
    // Capping below Nyquist keeps `cos(w0)` away from -1 in single precision, where a pole
    // would land on the unit circle.
    let nyquist_cap = sample_rate * 0.49;

    let mut cascade = CascadeCoefficients::empty();
    for pole in poles {
        let magnitude = pole.re.hypot(pole.im);
        let section_frequency = match side {
            Side::Lowpass => frequency * magnitude,
            Side::Highpass => frequency / magnitude,
        }
        .clamp(1.0, nyquist_cap);

        if pole.im == 0.0 {
            cascade.push(match side {
                Side::Lowpass => {
                    BiquadCoefficients::lowpass_first_order(sample_rate, section_frequency)
                }
                Side::Highpass => {
                    BiquadCoefficients::highpass_first_order(sample_rate, section_frequency)
                }
            });
        } else {
            let q = magnitude / (2.0 * pole.re.abs());
            cascade.push(match side {
                Side::Lowpass => BiquadCoefficients::lowpass(sample_rate, section_frequency, q),
                Side::Highpass => BiquadCoefficients::highpass(sample_rate, section_frequency, q),
            });
        }
    }

    cascade
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biquad;
    use approx::assert_relative_eq;

    /// The complex response of a full cascade, the product of its section responses.
    fn cascade_response(
        cascade: &CascadeCoefficients,
        frequency: f32,
        sample_rate: f32,
    ) -> (f64, f64) {
        let mut acc = (1.0f64, 0.0f64);
        for stage in cascade.as_slice() {
            let (re, im) = biquad::response(stage, frequency, sample_rate);
            acc = (acc.0 * re - acc.1 * im, acc.0 * im + acc.1 * re);
        }
        acc
    }

    fn cascade_magnitude_db(cascade: &CascadeCoefficients, frequency: f32, sample_rate: f32) -> f64 {
        let (re, im) = cascade_response(cascade, frequency, sample_rate);
        20.0 * re.hypot(im).log10()
    }

    #[test]
    fn butterworth_section_qs_match_the_tables() {
        assert_relative_eq!(butterworth_q(2, 0), consts::FRAC_1_SQRT_2, epsilon = 1e-6);

        assert_relative_eq!(butterworth_q(4, 0), 0.5412, epsilon = 1e-4);
        assert_relative_eq!(butterworth_q(4, 1), 1.3066, epsilon = 1e-4);

        assert_relative_eq!(butterworth_q(8, 0), 0.5098, epsilon = 1e-4);
        assert_relative_eq!(butterworth_q(8, 1), 0.6013, epsilon = 1e-4);
        assert_relative_eq!(butterworth_q(8, 2), 0.8999, epsilon = 1e-4);
        assert_relative_eq!(butterworth_q(8, 3), 2.5629, epsilon = 1e-4);

        // Odd orders: the real pole becomes a first order section, the pairs follow the table
        assert_relative_eq!(butterworth_q(3, 0), 1.0, epsilon = 1e-6);
        assert_relative_eq!(butterworth_q(5, 0), 0.6180, epsilon = 1e-4);
        assert_relative_eq!(butterworth_q(5, 1), 1.6180, epsilon = 1e-4);
    }

    #[test]
    fn every_design_is_stable_across_the_audio_band() {
        for family in [
            FilterFamily::Butterworth,
            FilterFamily::LinkwitzRiley,
            FilterFamily::Bessel,
        ] {
            for order in [1, 2, 3, 4, 6, 8] {
                let order = if family == FilterFamily::LinkwitzRiley && order % 2 == 1 {
                    order + 1
                } else {
                    order
                };

                for frequency in [20.0, 80.0, 1_000.0, 12_000.0, 20_000.0] {
                    for cascade in [
                        lowpass(family, order, 48_000.0, frequency),
                        highpass(family, order, 48_000.0, frequency),
                    ] {
                        assert!(!cascade.is_empty());
                        for stage in cascade.as_slice() {
                            assert!(
                                stage.is_stable(),
                                "{family:?} order {order} at {frequency} Hz is unstable"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn butterworth_hits_minus_3_db_at_the_corner() {
        for order in [1, 2, 3, 4, 6, 8] {
            let cascade = lowpass(FilterFamily::Butterworth, order, 48_000.0, 1_000.0);
            assert_relative_eq!(
                cascade_magnitude_db(&cascade, 1_000.0, 48_000.0),
                -3.01,
                epsilon = 0.1
            );
        }
    }

    #[test]
    fn second_order_butterworth_rolls_off_12_db_per_octave() {
        let cascade = lowpass(FilterFamily::Butterworth, 2, 48_000.0, 1_000.0);
        // Two octaves above the corner an order 2 filter is 24 dB down
        assert_relative_eq!(
            cascade_magnitude_db(&cascade, 4_000.0, 48_000.0),
            -24.0,
            epsilon = 1.0
        );
        // And the passband stays flat
        assert_relative_eq!(cascade_magnitude_db(&cascade, 50.0, 48_000.0), 0.0, epsilon = 0.05);
    }

    #[test]
    fn linkwitz_riley_branches_are_6_db_down_at_the_crossover() {
        for order in [2, 4, 6, 8] {
            let lp = lowpass(FilterFamily::LinkwitzRiley, order, 48_000.0, 1_000.0);
            let hp = highpass(FilterFamily::LinkwitzRiley, order, 48_000.0, 1_000.0);

            assert_relative_eq!(cascade_magnitude_db(&lp, 1_000.0, 48_000.0), -6.02, epsilon = 0.1);
            assert_relative_eq!(cascade_magnitude_db(&hp, 1_000.0, 48_000.0), -6.02, epsilon = 0.1);
        }
    }

    #[test]
    fn linkwitz_riley_4_sums_flat() {
        let lp = lowpass(FilterFamily::LinkwitzRiley, 4, 48_000.0, 1_000.0);
        let hp = highpass(FilterFamily::LinkwitzRiley, 4, 48_000.0, 1_000.0);

        // LR4's low-pass and high-pass branches sum to an all-pass. Sweep the audio band and
        // check the complex sum stays within half a decibel of unity.
        let mut frequency = 20.0f32;
        while frequency < 20_000.0 {
            let (lp_re, lp_im) = cascade_response(&lp, frequency, 48_000.0);
            let (hp_re, hp_im) = cascade_response(&hp, frequency, 48_000.0);
            let sum_db = 20.0 * ((lp_re + hp_re).hypot(lp_im + hp_im)).log10();
            assert!(
                sum_db.abs() < 0.5,
                "LP + HP is {sum_db:.2} dB at {frequency:.0} Hz"
            );

            frequency *= 1.1;
        }
    }

    #[test]
    fn bessel_second_order_matches_the_classic_prototype() {
        // The order 2 Bessel prototype has w0 = 1.2723 and Q = 0.5773
        let pole = &BESSEL_POLES[1][0];
        let magnitude = pole.re.hypot(pole.im);
        assert_relative_eq!(magnitude, 1.2723, epsilon = 1e-3);
        assert_relative_eq!(magnitude / (2.0 * pole.re.abs()), 0.5773, epsilon = 1e-3);

        // And the realized filter is 3 dB down at its nominal corner
        let cascade = lowpass(FilterFamily::Bessel, 2, 48_000.0, 1_000.0);
        assert_relative_eq!(
            cascade_magnitude_db(&cascade, 1_000.0, 48_000.0),
            -3.01,
            epsilon = 0.15
        );
    }

    #[test]
    fn slope_rounding_for_linkwitz_riley() {
        assert_eq!(Slope::Db6.next_even(), Slope::Db12);
        assert_eq!(Slope::Db18.next_even(), Slope::Db24);
        assert_eq!(Slope::Db24.next_even(), Slope::Db24);
        assert_eq!(Slope::Db48.next_even(), Slope::Db48);
    }

    #[test]
    fn cascade_processes_in_series_and_applies_gain() {
        let mut cascade = FilterCascade::bypass();
        assert_eq!(cascade.process(0.5), 0.5);

        cascade.gain = 2.0;
        assert_eq!(cascade.process(0.5), 1.0);

        cascade.set_coefficients(&lowpass(FilterFamily::Butterworth, 2, 48_000.0, 1_000.0));
        assert_eq!(cascade.num_stages(), 1);
    }
}
