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

//! Factory presets and the persisted form of a full engine configuration. The JSON form is what
//! a host stores in its own preset files; the packed form is the fixed little-endian image the
//! EEPROM-backed preset storage writes verbatim.

use serde::{Deserialize, Serialize};

use crate::compressor::{CompressorConfig, DetectionMode, KneeKind};
use crate::crossover::{BandKind, CrossoverBandConfig};
use crate::delay::{DelayConfig, Interpolation};
use crate::design::{FilterFamily, Slope};
use crate::eq::{self, EqChannelConfig};
use crate::limiter::LimiterConfig;
use crate::routing::{InputSource, RoutingConfig};
use crate::{Applied, Error, NUM_OUTPUTS};

/// A crossover topology that expands into a complete set of per-output band configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossoverMode {
    /// A stereo two-way: tops on outputs 1/2, subs on 3/4.
    TwoWay,
    /// A stereo three-way: tops on 1/2, mids on 3/4.
    ThreeWay,
    /// A mono four-way split across all outputs.
    FourWay,
    /// The bands are configured individually.
    Custom,
}

impl CrossoverMode {
    /// The band layout this mode expands to, or `None` for [`CrossoverMode::Custom`].
    pub fn band_layout(self) -> Option<[CrossoverBandConfig; NUM_OUTPUTS]> {
        match self {
            CrossoverMode::TwoWay => Some(CrossoverPreset::TwoWayStereo.band_configs()),
            CrossoverMode::ThreeWay => Some(CrossoverPreset::ThreeWayStereo.band_configs()),
            CrossoverMode::FourWay => Some([
                band(BandKind::HighPass, 6_000.0, 0.0),
                band(BandKind::BandPass, 1_200.0, 6_000.0),
                band(BandKind::BandPass, 200.0, 1_200.0),
                band(BandKind::LowPass, 200.0, 0.0),
            ]),
            CrossoverMode::Custom => None,
        }
    }
}

/// The factory crossover presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossoverPreset {
    /// Tops on 1/2 high-passed at 80 Hz, subs on 3/4 low-passed at 80 Hz, LR24.
    TwoWayStereo,
    /// Tops at 2.5 kHz, mids covering 250 Hz to 2.5 kHz, LR24.
    ThreeWayStereo,
    /// A gentle 12 dB/octave Butterworth high-pass for full-range tops over 24 dB/octave subs.
    SubPlusFull,
    /// A single stereo pair bi-amped at 1.2 kHz, LR24.
    BiAmp,
    /// A mono three-way plus sub spread over all four outputs, LR24.
    TriAmp,
}

fn band(kind: BandKind, frequency: f32, upper_frequency: f32) -> CrossoverBandConfig {
    CrossoverBandConfig {
        kind,
        frequency,
        upper_frequency: if upper_frequency > 0.0 {
            upper_frequency
        } else {
            CrossoverBandConfig::default().upper_frequency
        },
        family: FilterFamily::LinkwitzRiley,
        slope: Slope::Db24,
        gain_db: 0.0,
        enabled: true,
    }
}

impl CrossoverPreset {
    /// The per-output band configurations this preset expands to.
    pub fn band_configs(self) -> [CrossoverBandConfig; NUM_OUTPUTS] {
        match self {
            CrossoverPreset::TwoWayStereo => [
                band(BandKind::HighPass, 80.0, 0.0),
                band(BandKind::HighPass, 80.0, 0.0),
                band(BandKind::LowPass, 80.0, 0.0),
                band(BandKind::LowPass, 80.0, 0.0),
            ],
            CrossoverPreset::ThreeWayStereo => [
                band(BandKind::HighPass, 2_500.0, 0.0),
                band(BandKind::HighPass, 2_500.0, 0.0),
                band(BandKind::BandPass, 250.0, 2_500.0),
                band(BandKind::BandPass, 250.0, 2_500.0),
            ],
            CrossoverPreset::SubPlusFull => [
                CrossoverBandConfig {
                    family: FilterFamily::Butterworth,
                    slope: Slope::Db12,
                    ..band(BandKind::HighPass, 80.0, 0.0)
                },
                CrossoverBandConfig {
                    family: FilterFamily::Butterworth,
                    slope: Slope::Db12,
                    ..band(BandKind::HighPass, 80.0, 0.0)
                },
                CrossoverBandConfig {
                    family: FilterFamily::Butterworth,
                    slope: Slope::Db24,
                    ..band(BandKind::LowPass, 80.0, 0.0)
                },
                CrossoverBandConfig {
                    family: FilterFamily::Butterworth,
                    slope: Slope::Db24,
                    ..band(BandKind::LowPass, 80.0, 0.0)
                },
            ],
            CrossoverPreset::BiAmp => [
                band(BandKind::HighPass, 1_200.0, 0.0),
                band(BandKind::HighPass, 1_200.0, 0.0),
                band(BandKind::LowPass, 1_200.0, 0.0),
                band(BandKind::LowPass, 1_200.0, 0.0),
            ],
            CrossoverPreset::TriAmp => [
                band(BandKind::HighPass, 3_000.0, 0.0),
                band(BandKind::BandPass, 500.0, 3_000.0),
                band(BandKind::BandPass, 80.0, 500.0),
                band(BandKind::LowPass, 80.0, 0.0),
            ],
        }
    }
}

/// The magic bytes at the start of a packed state image.
const STATE_MAGIC: [u8; 4] = *b"QMST";
/// The current packed state version.
const STATE_VERSION: u16 = 1;

/// A complete snapshot of every configurable parameter, in the component order the storage
/// collaborator persists: routing, then per-channel crossover, EQ, compressor, delay, and
/// limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub routing: RoutingConfig,
    pub crossover: [CrossoverBandConfig; NUM_OUTPUTS],
    pub eq: [EqChannelConfig; NUM_OUTPUTS],
    pub compressor: [CompressorConfig; NUM_OUTPUTS],
    pub delay: [DelayConfig; NUM_OUTPUTS],
    pub limiter: [LimiterConfig; NUM_OUTPUTS],
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            crossover: [CrossoverBandConfig::default(); NUM_OUTPUTS],
            eq: [EqChannelConfig::default(); NUM_OUTPUTS],
            compressor: [CompressorConfig::default(); NUM_OUTPUTS],
            delay: [DelayConfig::default(); NUM_OUTPUTS],
            limiter: [LimiterConfig::default(); NUM_OUTPUTS],
        }
    }
}

/// The ways loading a persisted state can fail. A failed load never partially applies.
#[derive(Debug)]
pub enum StateError {
    /// The input ended before the full state was read.
    Truncated,
    /// The magic bytes don't match.
    BadMagic,
    /// The version tag is newer than this build understands.
    UnsupportedVersion(u16),
    /// An enum tag byte holds a value that doesn't map to a variant.
    BadTag(&'static str, u8),
    /// The state is structurally invalid, e.g. a band-pass with inverted corners.
    Invalid(Error),
    /// The JSON form couldn't be parsed.
    Json(serde_json::Error),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Truncated => write!(f, "the state image is truncated"),
            StateError::BadMagic => write!(f, "not a state image"),
            StateError::UnsupportedVersion(version) => {
                write!(f, "unsupported state version {version}")
            }
            StateError::BadTag(field, value) => write!(f, "invalid {field} tag {value}"),
            StateError::Invalid(error) => write!(f, "invalid state: {error}"),
            StateError::Json(error) => write!(f, "invalid JSON state: {error}"),
        }
    }
}

impl std::error::Error for StateError {}

impl EngineState {
    /// Clamp and validate every component, yielding the state as it would actually be adopted.
    /// Structurally invalid states are rejected as a whole.
    pub fn validated(
        mut self,
        sample_rate: f32,
        max_delay_ms: f32,
    ) -> Result<(Self, Applied), Error> {
        let mut applied = Applied::AsRequested;

        let (routing, routing_applied) = self.routing.clamped();
        self.routing = routing;
        applied = applied.and(routing_applied);

        for channel in 0..NUM_OUTPUTS {
            let (crossover, crossover_applied) = self.crossover[channel].validated(sample_rate)?;
            self.crossover[channel] = crossover;
            applied = applied.and(crossover_applied);

            let (eq, eq_applied) = self.eq[channel].clamped(sample_rate);
            self.eq[channel] = eq;
            applied = applied.and(eq_applied);

            let (compressor, compressor_applied) = self.compressor[channel].clamped();
            self.compressor[channel] = compressor;
            applied = applied.and(compressor_applied);

            let (delay, delay_applied) = self.delay[channel].clamped(max_delay_ms);
            self.delay[channel] = delay;
            applied = applied.and(delay_applied);

            let (limiter, limiter_applied) = self.limiter[channel].clamped();
            self.limiter[channel] = limiter;
            applied = applied.and(limiter_applied);
        }

        Ok((self, applied))
    }

    /// The sample-rate-independent structural invariants every deserialized state must satisfy
    /// before it is accepted; nothing of a rejected state escapes. The numeric range clamping
    /// happens against a live engine in [`EngineState::validated()`].
    fn check_structure(&self) -> Result<(), StateError> {
        for crossover in &self.crossover {
            crossover.check_corners().map_err(StateError::Invalid)?;
        }

        Ok(())
    }

    /// Serialize to the host-side JSON preset form.
    pub fn to_json(&self) -> String {
        // Serialization of plain structs with no maps can't fail
        serde_json::to_string_pretty(self).expect("state serialization failed")
    }

    /// Parse the host-side JSON preset form. Structurally invalid states are rejected as a
    /// whole.
    pub fn from_json(json: &str) -> Result<Self, StateError> {
        let state: Self = serde_json::from_str(json).map_err(StateError::Json)?;
        state.check_structure()?;

        Ok(state)
    }

    /// Pack into the little-endian storage image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.bytes(&STATE_MAGIC);
        writer.u16(STATE_VERSION);

        for output in &self.routing.outputs {
            writer.u8(source_tag(output.source));
            writer.f32(output.mix);
            writer.bool(output.mute);
        }
        for gain in &self.routing.input_gain {
            writer.f32(*gain);
        }
        for linked in &self.routing.stereo_link {
            writer.bool(*linked);
        }
        writer.bool(self.routing.mono_sum);

        for crossover in &self.crossover {
            writer.u8(band_kind_tag(crossover.kind));
            writer.f32(crossover.frequency);
            writer.f32(crossover.upper_frequency);
            writer.u8(family_tag(crossover.family));
            writer.u8(slope_tag(crossover.slope));
            writer.f32(crossover.gain_db);
            writer.bool(crossover.enabled);
        }

        for eq in &self.eq {
            for band in &eq.bands {
                writer.u8(eq_kind_tag(band.kind));
                writer.f32(band.frequency);
                writer.f32(band.gain_db);
                writer.f32(band.q);
                writer.bool(band.enabled);
            }
            writer.f32(eq.pre_gain_db);
        }

        for compressor in &self.compressor {
            writer.f32(compressor.threshold_db);
            writer.f32(compressor.ratio);
            writer.f32(compressor.attack_ms);
            writer.f32(compressor.release_ms);
            writer.f32(compressor.knee_width_db);
            writer.f32(compressor.makeup_db);
            writer.u8(match compressor.detection {
                DetectionMode::Peak => 0,
                DetectionMode::Rms => 1,
            });
            writer.u8(match compressor.knee {
                KneeKind::Hard => 0,
                KneeKind::Soft => 1,
            });
            writer.bool(compressor.enabled);
        }

        for delay in &self.delay {
            writer.f32(delay.time_ms);
            writer.bool(delay.phase_invert);
            writer.f32(delay.mix);
            writer.u8(match delay.interpolation {
                Interpolation::Linear => 0,
                Interpolation::Cubic => 1,
            });
            writer.f32(delay.smoothing);
            writer.bool(delay.enabled);
        }

        for limiter in &self.limiter {
            writer.f32(limiter.threshold_db);
            writer.f32(limiter.ceiling_db);
            writer.f32(limiter.attack_ms);
            writer.f32(limiter.release_ms);
            writer.f32(limiter.lookahead_ms);
            writer.bool(limiter.adaptive_release);
            writer.bool(limiter.inter_sample_peaks);
            writer.bool(limiter.bypass);
        }

        writer.into_bytes()
    }

    /// Parse the little-endian storage image. Structurally invalid states are rejected as a
    /// whole.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let mut reader = Reader::new(bytes);

        if reader.bytes::<4>()? != STATE_MAGIC {
            return Err(StateError::BadMagic);
        }
        let version = reader.u16()?;
        if version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }

        let mut state = EngineState::default();

        for output in &mut state.routing.outputs {
            output.source = source_from_tag(reader.u8()?)?;
            output.mix = reader.f32()?;
            output.mute = reader.bool()?;
        }
        for gain in &mut state.routing.input_gain {
            *gain = reader.f32()?;
        }
        for linked in &mut state.routing.stereo_link {
            *linked = reader.bool()?;
        }
        state.routing.mono_sum = reader.bool()?;

        for crossover in &mut state.crossover {
            crossover.kind = band_kind_from_tag(reader.u8()?)?;
            crossover.frequency = reader.f32()?;
            crossover.upper_frequency = reader.f32()?;
            crossover.family = family_from_tag(reader.u8()?)?;
            crossover.slope = slope_from_tag(reader.u8()?)?;
            crossover.gain_db = reader.f32()?;
            crossover.enabled = reader.bool()?;
        }

        for eq in &mut state.eq {
            for band in &mut eq.bands {
                band.kind = eq_kind_from_tag(reader.u8()?)?;
                band.frequency = reader.f32()?;
                band.gain_db = reader.f32()?;
                band.q = reader.f32()?;
                band.enabled = reader.bool()?;
            }
            eq.pre_gain_db = reader.f32()?;
        }

        for compressor in &mut state.compressor {
            compressor.threshold_db = reader.f32()?;
            compressor.ratio = reader.f32()?;
            compressor.attack_ms = reader.f32()?;
            compressor.release_ms = reader.f32()?;
            compressor.knee_width_db = reader.f32()?;
            compressor.makeup_db = reader.f32()?;
            compressor.detection = match reader.u8()? {
                0 => DetectionMode::Peak,
                1 => DetectionMode::Rms,
                tag => return Err(StateError::BadTag("detection mode", tag)),
            };
            compressor.knee = match reader.u8()? {
                0 => KneeKind::Hard,
                1 => KneeKind::Soft,
                tag => return Err(StateError::BadTag("knee kind", tag)),
            };
            compressor.enabled = reader.bool()?;
        }

        for delay in &mut state.delay {
            delay.time_ms = reader.f32()?;
            delay.phase_invert = reader.bool()?;
            delay.mix = reader.f32()?;
            delay.interpolation = match reader.u8()? {
                0 => Interpolation::Linear,
                1 => Interpolation::Cubic,
                tag => return Err(StateError::BadTag("interpolation", tag)),
            };
            delay.smoothing = reader.f32()?;
            delay.enabled = reader.bool()?;
        }

        for limiter in &mut state.limiter {
            limiter.threshold_db = reader.f32()?;
            limiter.ceiling_db = reader.f32()?;
            limiter.attack_ms = reader.f32()?;
            limiter.release_ms = reader.f32()?;
            limiter.lookahead_ms = reader.f32()?;
            limiter.adaptive_release = reader.bool()?;
            limiter.inter_sample_peaks = reader.bool()?;
            limiter.bypass = reader.bool()?;
        }

        state.check_structure()?;

        Ok(state)
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn bool(&mut self, value: bool) {
        self.0.push(value as u8);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], StateError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or(StateError::Truncated)?;
        self.pos += N;
        Ok(slice.try_into().unwrap())
    }

    fn u8(&mut self) -> Result<u8, StateError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, StateError> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn f32(&mut self) -> Result<f32, StateError> {
        Ok(f32::from_le_bytes(self.bytes()?))
    }

    fn bool(&mut self) -> Result<bool, StateError> {
        Ok(self.u8()? != 0)
    }
}

fn source_tag(source: InputSource) -> u8 {
    match source {
        InputSource::None => 0,
        InputSource::Input1 => 1,
        InputSource::Input2 => 2,
        InputSource::Both => 3,
        InputSource::Input1Left => 4,
        InputSource::Input1Right => 5,
        InputSource::Input2Left => 6,
        InputSource::Input2Right => 7,
    }
}

fn source_from_tag(tag: u8) -> Result<InputSource, StateError> {
    Ok(match tag {
        0 => InputSource::None,
        1 => InputSource::Input1,
        2 => InputSource::Input2,
        3 => InputSource::Both,
        4 => InputSource::Input1Left,
        5 => InputSource::Input1Right,
        6 => InputSource::Input2Left,
        7 => InputSource::Input2Right,
        tag => return Err(StateError::BadTag("input source", tag)),
    })
}

fn band_kind_tag(kind: BandKind) -> u8 {
    match kind {
        BandKind::Bypass => 0,
        BandKind::LowPass => 1,
        BandKind::HighPass => 2,
        BandKind::BandPass => 3,
    }
}

fn band_kind_from_tag(tag: u8) -> Result<BandKind, StateError> {
    Ok(match tag {
        0 => BandKind::Bypass,
        1 => BandKind::LowPass,
        2 => BandKind::HighPass,
        3 => BandKind::BandPass,
        tag => return Err(StateError::BadTag("band kind", tag)),
    })
}

fn family_tag(family: FilterFamily) -> u8 {
    match family {
        FilterFamily::Butterworth => 0,
        FilterFamily::LinkwitzRiley => 1,
        FilterFamily::Bessel => 2,
    }
}

fn family_from_tag(tag: u8) -> Result<FilterFamily, StateError> {
    Ok(match tag {
        0 => FilterFamily::Butterworth,
        1 => FilterFamily::LinkwitzRiley,
        2 => FilterFamily::Bessel,
        tag => return Err(StateError::BadTag("filter family", tag)),
    })
}

fn slope_tag(slope: Slope) -> u8 {
    match slope {
        Slope::Db6 => 0,
        Slope::Db12 => 1,
        Slope::Db18 => 2,
        Slope::Db24 => 3,
        Slope::Db36 => 4,
        Slope::Db48 => 5,
    }
}

fn slope_from_tag(tag: u8) -> Result<Slope, StateError> {
    Ok(match tag {
        0 => Slope::Db6,
        1 => Slope::Db12,
        2 => Slope::Db18,
        3 => Slope::Db24,
        4 => Slope::Db36,
        5 => Slope::Db48,
        tag => return Err(StateError::BadTag("slope", tag)),
    })
}

fn eq_kind_tag(kind: eq::EqBandKind) -> u8 {
    use crate::eq::EqBandKind::*;
    match kind {
        Bell => 0,
        LowShelf => 1,
        HighShelf => 2,
        LowPass => 3,
        HighPass => 4,
        AllPass => 5,
        Notch => 6,
        BandPass => 7,
    }
}

fn eq_kind_from_tag(tag: u8) -> Result<eq::EqBandKind, StateError> {
    use crate::eq::EqBandKind::*;
    Ok(match tag {
        0 => Bell,
        1 => LowShelf,
        2 => HighShelf,
        3 => LowPass,
        4 => HighPass,
        5 => AllPass,
        6 => Notch,
        7 => BandPass,
        tag => return Err(StateError::BadTag("EQ band kind", tag)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercised_state() -> EngineState {
        let mut state = EngineState::default();
        state.routing.outputs[0].source = InputSource::Input1Left;
        state.routing.outputs[3].mute = true;
        state.routing.input_gain = [0.5, 2.0];
        state.routing.mono_sum = true;

        state.crossover = CrossoverPreset::TriAmp.band_configs();
        state.crossover[1].family = FilterFamily::Bessel;

        state.eq[0].bands[2].gain_db = -4.5;
        state.eq[2].pre_gain_db = 3.0;

        state.compressor[1].enabled = true;
        state.compressor[1].detection = DetectionMode::Rms;
        state.compressor[1].knee = KneeKind::Soft;

        state.delay[2].time_ms = 3.25;
        state.delay[2].interpolation = Interpolation::Cubic;
        state.delay[2].phase_invert = true;

        state.limiter[3].lookahead_ms = 2.0;
        state.limiter[3].adaptive_release = true;

        state
    }

    #[test]
    fn packed_image_round_trips() {
        let state = exercised_state();
        let bytes = state.to_bytes();
        let restored = EngineState::from_bytes(&bytes).unwrap();
        assert_eq!(state, restored);
    }

    #[test]
    fn json_round_trips() {
        let state = exercised_state();
        let restored = EngineState::from_json(&state.to_json()).unwrap();
        assert_eq!(state, restored);
    }

    #[test]
    fn truncated_images_are_rejected() {
        let bytes = exercised_state().to_bytes();
        for length in [0, 3, 6, bytes.len() - 1] {
            assert!(matches!(
                EngineState::from_bytes(&bytes[..length]),
                Err(StateError::Truncated) | Err(StateError::BadMagic)
            ));
        }
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut bytes = exercised_state().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            EngineState::from_bytes(&bytes),
            Err(StateError::BadMagic)
        ));

        let mut bytes = exercised_state().to_bytes();
        bytes[4] = 0xff;
        assert!(matches!(
            EngineState::from_bytes(&bytes),
            Err(StateError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn bad_enum_tags_are_rejected() {
        let mut bytes = exercised_state().to_bytes();
        // The first routing source tag sits right after the magic and version
        bytes[6] = 200;
        assert!(matches!(
            EngineState::from_bytes(&bytes),
            Err(StateError::BadTag("input source", 200))
        ));
    }

    #[test]
    fn validation_rejects_inverted_band_pass_wholesale() {
        let mut state = exercised_state();
        state.crossover[1].kind = BandKind::BandPass;
        state.crossover[1].frequency = 4_000.0;
        state.crossover[1].upper_frequency = 400.0;

        assert!(state.validated(48_000.0, 20.0).is_err());

        // The deserializers apply the same structural check, so a corrupted image never makes
        // it into a state value in the first place
        assert!(matches!(
            EngineState::from_bytes(&state.to_bytes()),
            Err(StateError::Invalid(_))
        ));
        assert!(matches!(
            EngineState::from_json(&state.to_json()),
            Err(StateError::Invalid(_))
        ));
    }

    #[test]
    fn validation_clamps_observably() {
        let mut state = EngineState::default();
        state.routing.input_gain[0] = 100.0;

        let (validated, applied) = state.validated(48_000.0, 20.0).unwrap();
        assert_eq!(validated.routing.input_gain[0], 4.0);
        assert!(applied.was_clamped());
    }

    #[test]
    fn mode_layouts_expand_to_full_coverage() {
        for mode in [
            CrossoverMode::TwoWay,
            CrossoverMode::ThreeWay,
            CrossoverMode::FourWay,
        ] {
            let layout = mode.band_layout().unwrap();
            assert!(layout.iter().all(|band| band.enabled));
            // Every layout must be a valid configuration as is
            for band in layout {
                band.validated(48_000.0).unwrap();
            }
        }
        assert!(CrossoverMode::Custom.band_layout().is_none());
    }

    #[test]
    fn factory_presets_match_their_descriptions() {
        let preset = CrossoverPreset::TwoWayStereo.band_configs();
        assert_eq!(preset[0].kind, BandKind::HighPass);
        assert_eq!(preset[0].frequency, 80.0);
        assert_eq!(preset[2].kind, BandKind::LowPass);
        assert_eq!(preset[0].slope, Slope::Db24);

        let preset = CrossoverPreset::SubPlusFull.band_configs();
        assert_eq!(preset[0].family, FilterFamily::Butterworth);
        assert_eq!(preset[0].slope, Slope::Db12);
        assert_eq!(preset[2].slope, Slope::Db24);

        let preset = CrossoverPreset::TriAmp.band_configs();
        assert_eq!(preset[1].kind, BandKind::BandPass);
        assert_eq!(preset[1].frequency, 500.0);
        assert_eq!(preset[1].upper_frequency, 3_000.0);
    }
}
