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

//! General conversion functions shared by every stage in the processing chain.

/// The level below which the level detectors and the dB/gain conversions treat a signal as
/// silence.
pub const MINUS_INFINITY_DB: f32 = -120.0;

/// Convert decibels to a voltage gain ratio, treating anything below -120 dB as minus infinity.
pub fn db_to_gain(dbs: f32) -> f32 {
    if dbs > MINUS_INFINITY_DB {
        10.0f32.powf(dbs * 0.05)
    } else {
        0.0
    }
}

/// Convert a voltage gain ratio to decibels. Gain ratios that aren't positive will be treated as
/// [`MINUS_INFINITY_DB`].
pub fn gain_to_db(gain: f32) -> f32 {
    if gain > 0.0 {
        (gain.log10() * 20.0).max(MINUS_INFINITY_DB)
    } else {
        MINUS_INFINITY_DB
    }
}

/// The one-pole coefficient for an envelope follower segment with the given time constant.
/// Segments of 0.1 ms and shorter collapse to an instantaneous response.
pub fn envelope_coefficient(time_ms: f32, sample_rate: f32) -> f32 {
    if time_ms <= 0.1 {
        0.0
    } else {
        (-1.0 / (time_ms / 1000.0 * sample_rate)).exp()
    }
}

/// Clamp a filter frequency into the range the coefficient derivations stay numerically sound in.
pub fn clamp_frequency(frequency: f32, sample_rate: f32) -> f32 {
    frequency.clamp(20.0, 20_000.0f32.min(sample_rate / 2.0 - 1.0))
}

/// Clamp `value` into `[min, max]`, raising `clamped` when the value had to move. Non-finite
/// values clamp to `min`. Setters use this to report out-of-range requests without rejecting
/// them.
pub(crate) fn observed_clamp(value: f32, min: f32, max: f32, clamped: &mut bool) -> f32 {
    if !value.is_finite() {
        *clamped = true;
        return min;
    }

    let result = value.clamp(min, max);
    if result != value {
        *clamped = true;
    }
    result
}
