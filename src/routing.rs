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
use crate::{Applied, Error, NUM_INPUTS, NUM_OUTPUTS};

/// What an output channel listens to. Each physical input carries an interleaved stereo pair, so
/// next to the plain inputs and their mix there are variants that pick one interleaved half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    /// Silence.
    None,
    Input1,
    Input2,
    /// `mix * input 1 + (1 - mix) * input 2`.
    Both,
    Input1Left,
    Input1Right,
    Input2Left,
    Input2Right,
}

impl InputSource {
    /// The source the stereo partner of a linked output should use: the plain inputs swap, the
    /// interleaved halves mirror left and right within the same input.
    pub fn mirrored(self) -> InputSource {
        match self {
            InputSource::Input1 => InputSource::Input2,
            InputSource::Input2 => InputSource::Input1,
            InputSource::Input1Left => InputSource::Input1Right,
            InputSource::Input1Right => InputSource::Input1Left,
            InputSource::Input2Left => InputSource::Input2Right,
            InputSource::Input2Right => InputSource::Input2Left,
            other => other,
        }
    }
}

/// One output channel's routing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputRouting {
    pub source: InputSource,
    /// The blend used by [`InputSource::Both`].
    pub mix: f32,
    pub mute: bool,
}

impl OutputRouting {
    /// Pick this output's sample from the gain-conditioned input blocks. The interleaved halves
    /// hold their sample for two frames so the output block keeps its length.
    #[inline]
    pub fn sample(&self, input1: &[f32], input2: &[f32], frame: usize) -> f32 {
        if self.mute {
            return 0.0;
        }

        match self.source {
            InputSource::None => 0.0,
            InputSource::Input1 => input1[frame],
            InputSource::Input2 => input2[frame],
            InputSource::Both => self.mix * input1[frame] + (1.0 - self.mix) * input2[frame],
            InputSource::Input1Left => input1[frame & !1],
            InputSource::Input1Right => input1[(frame | 1).min(input1.len() - 1)],
            InputSource::Input2Left => input2[frame & !1],
            InputSource::Input2Right => input2[(frame | 1).min(input2.len() - 1)],
        }
    }
}

/// The full routing matrix: per-output source selection, per-input gain, the stereo links, and
/// the global mono sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub outputs: [OutputRouting; NUM_OUTPUTS],
    pub input_gain: [f32; NUM_INPUTS],
    /// One flag per output pair: (0, 1) and (2, 3).
    pub stereo_link: [bool; NUM_OUTPUTS / 2],
    pub mono_sum: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let output = |source| OutputRouting {
            source,
            mix: 0.5,
            mute: false,
        };

        Self {
            // A stereo pair of tops on 1/2 and a stereo pair of subs on 3/4
            outputs: [
                output(InputSource::Input1),
                output(InputSource::Input2),
                output(InputSource::Input1),
                output(InputSource::Input2),
            ],
            input_gain: [1.0; NUM_INPUTS],
            stereo_link: [false; NUM_OUTPUTS / 2],
            mono_sum: false,
        }
    }
}

impl RoutingConfig {
    fn check_output(channel: usize) -> Result<(), Error> {
        if channel < NUM_OUTPUTS {
            Ok(())
        } else {
            Err(Error::InvalidChannel(channel))
        }
    }

    /// The other output of a stereo pair.
    fn partner(channel: usize) -> usize {
        channel ^ 1
    }

    fn is_linked(&self, channel: usize) -> bool {
        self.stereo_link[channel / 2]
    }

    /// Select an output's source. When the pair is linked the partner follows with the mirrored
    /// source.
    pub fn set_source(&mut self, channel: usize, source: InputSource) -> Result<Applied, Error> {
        Self::check_output(channel)?;

        self.outputs[channel].source = source;
        if self.is_linked(channel) {
            self.outputs[Self::partner(channel)].source = source.mirrored();
        }

        Ok(Applied::AsRequested)
    }

    pub fn set_mix(&mut self, channel: usize, mix: f32) -> Result<Applied, Error> {
        Self::check_output(channel)?;

        let mut clamped = false;
        let mix = util::observed_clamp(mix, 0.0, 1.0, &mut clamped);
        self.outputs[channel].mix = mix;
        if self.is_linked(channel) {
            self.outputs[Self::partner(channel)].mix = mix;
        }

        Ok(Applied::from_clamped(clamped))
    }

    pub fn set_mute(&mut self, channel: usize, mute: bool) -> Result<Applied, Error> {
        Self::check_output(channel)?;

        self.outputs[channel].mute = mute;
        if self.is_linked(channel) {
            self.outputs[Self::partner(channel)].mute = mute;
        }

        Ok(Applied::AsRequested)
    }

    pub fn set_input_gain(&mut self, input: usize, gain: f32) -> Result<Applied, Error> {
        if input >= NUM_INPUTS {
            return Err(Error::InvalidChannel(input));
        }

        let mut clamped = false;
        self.input_gain[input] = util::observed_clamp(gain, 0.0, 4.0, &mut clamped);

        Ok(Applied::from_clamped(clamped))
    }

    pub fn set_stereo_link(&mut self, pair: usize, linked: bool) -> Result<Applied, Error> {
        if pair >= NUM_OUTPUTS / 2 {
            return Err(Error::InvalidChannel(pair));
        }

        self.stereo_link[pair] = linked;

        Ok(Applied::AsRequested)
    }

    pub fn set_mono_sum(&mut self, mono_sum: bool) {
        self.mono_sum = mono_sum;
    }

    /// Clamp every numeric field. Used when a whole configuration is loaded in bulk.
    pub fn clamped(mut self) -> (Self, Applied) {
        let mut clamped = false;
        for output in &mut self.outputs {
            output.mix = util::observed_clamp(output.mix, 0.0, 1.0, &mut clamped);
        }
        for gain in &mut self.input_gain {
            *gain = util::observed_clamp(*gain, 0.0, 4.0, &mut clamped);
        }

        (self, Applied::from_clamped(clamped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_sources_pass_their_input() {
        let routing = OutputRouting {
            source: InputSource::Input1,
            mix: 0.0,
            mute: false,
        };

        let input1 = [0.1, 0.2, 0.3, 0.4];
        let input2 = [0.5, 0.6, 0.7, 0.8];
        for frame in 0..4 {
            // The mix level plays no role for a plain source
            assert_eq!(routing.sample(&input1, &input2, frame), input1[frame]);
        }
    }

    #[test]
    fn muted_outputs_are_silent() {
        let routing = OutputRouting {
            source: InputSource::Input1,
            mix: 0.5,
            mute: true,
        };

        assert_eq!(routing.sample(&[1.0], &[1.0], 0), 0.0);
    }

    #[test]
    fn both_blends_with_the_mix_level() {
        let routing = OutputRouting {
            source: InputSource::Both,
            mix: 0.75,
            mute: false,
        };

        assert_eq!(routing.sample(&[1.0], &[0.0], 0), 0.75);
        assert_eq!(routing.sample(&[0.0], &[1.0], 0), 0.25);
    }

    #[test]
    fn interleaved_halves_hold_their_sample() {
        let input1 = [1.0, -1.0, 2.0, -2.0];
        let input2 = [0.0; 4];

        let left = OutputRouting {
            source: InputSource::Input1Left,
            mix: 0.5,
            mute: false,
        };
        let right = OutputRouting {
            source: InputSource::Input1Right,
            mix: 0.5,
            mute: false,
        };

        assert_eq!(left.sample(&input1, &input2, 0), 1.0);
        assert_eq!(left.sample(&input1, &input2, 1), 1.0);
        assert_eq!(left.sample(&input1, &input2, 2), 2.0);

        assert_eq!(right.sample(&input1, &input2, 0), -1.0);
        assert_eq!(right.sample(&input1, &input2, 1), -1.0);
        assert_eq!(right.sample(&input1, &input2, 3), -2.0);
    }

    #[test]
    fn linked_pairs_mirror_sources() {
        let mut config = RoutingConfig::default();
        config.set_stereo_link(0, true).unwrap();

        config.set_source(0, InputSource::Input1Left).unwrap();
        assert_eq!(config.outputs[0].source, InputSource::Input1Left);
        assert_eq!(config.outputs[1].source, InputSource::Input1Right);

        config.set_source(1, InputSource::Input2).unwrap();
        assert_eq!(config.outputs[0].source, InputSource::Input1);

        // Mutes and mix levels copy as is
        config.set_mute(0, true).unwrap();
        assert!(config.outputs[1].mute);
        config.set_mix(1, 0.3).unwrap();
        assert_eq!(config.outputs[0].mix, 0.3);

        // The other pair is not affected
        assert_eq!(config.outputs[2].source, InputSource::Input1);
        assert!(!config.outputs[2].mute);
    }

    #[test]
    fn unlinked_pairs_are_independent() {
        let mut config = RoutingConfig::default();
        config.set_source(0, InputSource::Input2Left).unwrap();
        assert_eq!(config.outputs[1].source, InputSource::Input2);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut config = RoutingConfig::default();
        assert_eq!(
            config.set_source(4, InputSource::Input1),
            Err(Error::InvalidChannel(4))
        );
        assert_eq!(config.set_input_gain(2, 1.0), Err(Error::InvalidChannel(2)));
        assert_eq!(config.set_stereo_link(2, true), Err(Error::InvalidChannel(2)));
    }

    #[test]
    fn gain_and_mix_clamp_observably() {
        let mut config = RoutingConfig::default();
        assert_eq!(config.set_input_gain(0, 10.0), Ok(Applied::Clamped));
        assert_eq!(config.input_gain[0], 4.0);

        assert_eq!(config.set_mix(0, -1.0), Ok(Applied::Clamped));
        assert_eq!(config.outputs[0].mix, 0.0);
    }

    #[test]
    fn mirroring_is_an_involution() {
        for source in [
            InputSource::None,
            InputSource::Input1,
            InputSource::Input2,
            InputSource::Both,
            InputSource::Input1Left,
            InputSource::Input1Right,
            InputSource::Input2Left,
            InputSource::Input2Right,
        ] {
            assert_eq!(source.mirrored().mirrored(), source);
        }
    }
}
