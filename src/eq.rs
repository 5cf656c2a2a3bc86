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

use crate::biquad::{Biquad, BiquadCoefficients};
use crate::util;
use crate::Applied;

/// The number of parametric bands per output channel.
pub const NUM_BANDS: usize = 5;

/// The gain range for the bell and shelf bands and the per-channel pre-gain, in decibels.
const GAIN_RANGE_DB: (f32, f32) = (-12.0, 12.0);
/// The Q range for all bands.
const Q_RANGE: (f32, f32) = (0.1, 10.0);

/// The filter shape of a parametric band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EqBandKind {
    Bell,
    LowShelf,
    HighShelf,
    LowPass,
    HighPass,
    AllPass,
    Notch,
    BandPass,
}

/// One parametric band. The gain only applies to the bell and shelf kinds, matching the cookbook
/// derivations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqBandConfig {
    pub kind: EqBandKind,
    pub frequency: f32,
    pub gain_db: f32,
    pub q: f32,
    pub enabled: bool,
}

impl Default for EqBandConfig {
    fn default() -> Self {
        Self {
            kind: EqBandKind::Bell,
            frequency: 1_000.0,
            gain_db: 0.0,
            q: std::f32::consts::FRAC_1_SQRT_2,
            enabled: true,
        }
    }
}

impl EqBandConfig {
    /// Clamp every numeric field into its legal range, reporting whether anything moved.
    pub fn clamped(mut self, sample_rate: f32, clamped: &mut bool) -> Self {
        let max_frequency = 20_000.0f32.min(sample_rate / 2.0 - 1.0);
        self.frequency = util::observed_clamp(self.frequency, 20.0, max_frequency, clamped);
        self.gain_db =
            util::observed_clamp(self.gain_db, GAIN_RANGE_DB.0, GAIN_RANGE_DB.1, clamped);
        self.q = util::observed_clamp(self.q, Q_RANGE.0, Q_RANGE.1, clamped);
        self
    }

    fn coefficients(&self, sample_rate: f32) -> BiquadCoefficients {
        // A sample rate change can leave a staged frequency above the new Nyquist limit
        let frequency = util::clamp_frequency(self.frequency, sample_rate);

        match self.kind {
            EqBandKind::Bell => {
                BiquadCoefficients::peaking_eq(sample_rate, frequency, self.gain_db, self.q)
            }
            EqBandKind::LowShelf => {
                BiquadCoefficients::low_shelf(sample_rate, frequency, self.gain_db, self.q)
            }
            EqBandKind::HighShelf => {
                BiquadCoefficients::high_shelf(sample_rate, frequency, self.gain_db, self.q)
            }
            EqBandKind::LowPass => BiquadCoefficients::lowpass(sample_rate, frequency, self.q),
            EqBandKind::HighPass => BiquadCoefficients::highpass(sample_rate, frequency, self.q),
            EqBandKind::AllPass => BiquadCoefficients::allpass(sample_rate, frequency, self.q),
            EqBandKind::Notch => BiquadCoefficients::notch(sample_rate, frequency, self.q),
            EqBandKind::BandPass => BiquadCoefficients::bandpass(sample_rate, frequency, self.q),
        }
    }
}

/// The full parametric EQ configuration for one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqChannelConfig {
    pub bands: [EqBandConfig; NUM_BANDS],
    /// Gain applied before the bands, in decibels.
    pub pre_gain_db: f32,
}

impl Default for EqChannelConfig {
    /// Five identical flat bells: the EQ starts out as a no-op and every band reads back the
    /// same defaults.
    fn default() -> Self {
        Self {
            bands: [EqBandConfig::default(); NUM_BANDS],
            pre_gain_db: 0.0,
        }
    }
}

impl EqChannelConfig {
    pub fn clamped(mut self, sample_rate: f32) -> (Self, Applied) {
        let mut clamped = false;
        for band in &mut self.bands {
            *band = band.clamped(sample_rate, &mut clamped);
        }
        self.pre_gain_db =
            util::observed_clamp(self.pre_gain_db, GAIN_RANGE_DB.0, GAIN_RANGE_DB.1, &mut clamped);

        (self, Applied::from_clamped(clamped))
    }
}

/// One output channel's five band parametric EQ. Bands process strictly in order; disabled bands
/// are skipped entirely.
#[derive(Debug, Clone)]
pub struct EqChannel {
    config: EqChannelConfig,
    filters: [Biquad; NUM_BANDS],
    pre_gain: f32,
}

impl Default for EqChannel {
    fn default() -> Self {
        Self {
            config: EqChannelConfig::default(),
            filters: [Biquad::default(); NUM_BANDS],
            pre_gain: 1.0,
        }
    }
}

impl EqChannel {
    pub fn config(&self) -> &EqChannelConfig {
        &self.config
    }

    /// Recompute every band's coefficients for a new configuration. Filter states are retained
    /// so a running signal keeps its continuity; the new coefficients take effect from the next
    /// processed sample.
    pub fn configure(&mut self, config: &EqChannelConfig, sample_rate: f32) {
        self.config = *config;
        self.pre_gain = util::db_to_gain(config.pre_gain_db);
        for (filter, band) in self.filters.iter_mut().zip(&config.bands) {
            filter.coefficients = band.coefficients(sample_rate);
        }
    }

    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        let mut sample = sample * self.pre_gain;
        for (filter, band) in self.filters.iter_mut().zip(&self.config.bands) {
            if band.enabled {
                sample = filter.process_checked(sample);
            }
        }

        sample
    }

    /// Clear the state of a single band.
    pub fn reset_band(&mut self, band: usize) {
        if let Some(filter) = self.filters.get_mut(band) {
            filter.reset();
        }
    }

    /// Clear all band states. The coefficients survive.
    pub fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }
}
