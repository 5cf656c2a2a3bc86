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

//! The engine that ties the whole chain together. [`Engine`] is owned by the audio thread and
//! runs the per-block pipeline; [`Controller`] is a cheap clone-around handle that stages
//! parameter changes and reads meters from any other thread.
//!
//! Every component has a staging cell (a mutex around its configuration) and a dirty flag. A
//! setter clamps the request, writes the staging cell, and raises the flag; at the start of the
//! next block the audio thread drains raised flags with `try_lock`, so it never blocks on a
//! slow control thread. A component's configuration is committed wholesale, never field by
//! field.

use atomic_float::AtomicF32;
use parking_lot::Mutex;
use std::array;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::compressor::{Compressor, CompressorConfig, DetectionMode, KneeKind};
use crate::crossover::{CrossoverBandConfig, CrossoverChannel};
use crate::delay::{self, DelayConfig, DelayLine, Interpolation};
use crate::eq::{self, EqBandConfig, EqChannel, EqChannelConfig};
use crate::limiter::{Limiter, LimiterConfig};
use crate::preset::{CrossoverMode, CrossoverPreset, EngineState};
use crate::routing::{InputSource, RoutingConfig};
use crate::util;
use crate::{Applied, Error, NUM_INPUTS, NUM_OUTPUTS};

/// The range of sample rates the engine accepts.
const SAMPLE_RATE_RANGE: (f32, f32) = (8_000.0, 192_000.0);
/// The largest block size the engine accepts.
const MAX_BLOCK_SIZE: usize = 8_192;
/// The largest delay ring the engine will allocate, in milliseconds.
const MAX_DELAY_MS_CAP: f32 = 20.0;
/// The air temperature range accepted by the temperature compensation.
const TEMPERATURE_RANGE_C: (f32, f32) = (-40.0, 85.0);

/// The fixed parameters an [`Engine`] is constructed with. None of these change at runtime;
/// changing the sample rate goes through [`Engine::update_sample_rate()`] which rebuilds
/// everything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: f32,
    /// The number of frames in every block passed to [`Engine::process()`].
    pub block_size: usize,
    /// The largest delay time the alignment delays will ever be asked for. The rings are sized
    /// from this at construction and never reallocated.
    pub max_delay_ms: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 64,
            max_delay_ms: MAX_DELAY_MS_CAP,
        }
    }
}

/// Meter values written by the audio thread once per block and read by anyone. Readers may see
/// values that are up to one block stale.
struct Meters {
    compressor_gain_reduction_db: [AtomicF32; NUM_OUTPUTS],
    compressor_input_level_db: [AtomicF32; NUM_OUTPUTS],
    limiter_gain_reduction_db: [AtomicF32; NUM_OUTPUTS],
    limiter_peak_level: [AtomicF32; NUM_OUTPUTS],
    limiter_active: [AtomicBool; NUM_OUTPUTS],
    output_peak: [AtomicF32; NUM_OUTPUTS],
}

impl Default for Meters {
    fn default() -> Self {
        Self {
            compressor_gain_reduction_db: array::from_fn(|_| AtomicF32::new(0.0)),
            compressor_input_level_db: array::from_fn(|_| {
                AtomicF32::new(util::MINUS_INFINITY_DB)
            }),
            limiter_gain_reduction_db: array::from_fn(|_| AtomicF32::new(0.0)),
            limiter_peak_level: array::from_fn(|_| AtomicF32::new(0.0)),
            limiter_active: array::from_fn(|_| AtomicBool::new(false)),
            output_peak: array::from_fn(|_| AtomicF32::new(0.0)),
        }
    }
}

impl Meters {
    fn clear_channel(&self, channel: usize) {
        self.compressor_gain_reduction_db[channel].store(0.0, Ordering::Relaxed);
        self.compressor_input_level_db[channel].store(util::MINUS_INFINITY_DB, Ordering::Relaxed);
        self.limiter_gain_reduction_db[channel].store(0.0, Ordering::Relaxed);
        self.limiter_peak_level[channel].store(0.0, Ordering::Relaxed);
        self.limiter_active[channel].store(false, Ordering::Relaxed);
        self.output_peak[channel].store(0.0, Ordering::Relaxed);
    }
}

/// Everything shared between the audio-thread [`Engine`] and the [`Controller`] handles: the
/// staging cells, the dirty flags, and the meters.
struct Shared {
    sample_rate: AtomicF32,
    max_delay_ms: f32,

    routing: Mutex<RoutingConfig>,
    routing_dirty: AtomicBool,

    crossover_mode: Mutex<CrossoverMode>,
    crossover: [Mutex<CrossoverBandConfig>; NUM_OUTPUTS],
    crossover_dirty: [AtomicBool; NUM_OUTPUTS],
    crossover_reset: [AtomicBool; NUM_OUTPUTS],

    eq: [Mutex<EqChannelConfig>; NUM_OUTPUTS],
    eq_dirty: [AtomicBool; NUM_OUTPUTS],
    /// A bitmask of bands whose state should be cleared at the next block boundary.
    eq_reset: [AtomicU32; NUM_OUTPUTS],

    compressor: [Mutex<CompressorConfig>; NUM_OUTPUTS],
    compressor_dirty: [AtomicBool; NUM_OUTPUTS],

    delay: [Mutex<DelayConfig>; NUM_OUTPUTS],
    delay_dirty: [AtomicBool; NUM_OUTPUTS],
    delay_flush: [AtomicBool; NUM_OUTPUTS],

    limiter: [Mutex<LimiterConfig>; NUM_OUTPUTS],
    limiter_dirty: [AtomicBool; NUM_OUTPUTS],

    temperature_c: AtomicF32,
    temperature_factor: AtomicF32,

    meters: Meters,
}

impl Shared {
    fn new(sample_rate: f32, max_delay_ms: f32) -> Self {
        Self {
            sample_rate: AtomicF32::new(sample_rate),
            max_delay_ms,
            routing: Mutex::new(RoutingConfig::default()),
            routing_dirty: AtomicBool::new(false),
            crossover_mode: Mutex::new(CrossoverMode::Custom),
            crossover: array::from_fn(|_| Mutex::new(CrossoverBandConfig::default())),
            crossover_dirty: array::from_fn(|_| AtomicBool::new(false)),
            crossover_reset: array::from_fn(|_| AtomicBool::new(false)),
            eq: array::from_fn(|_| Mutex::new(EqChannelConfig::default())),
            eq_dirty: array::from_fn(|_| AtomicBool::new(false)),
            eq_reset: array::from_fn(|_| AtomicU32::new(0)),
            compressor: array::from_fn(|_| Mutex::new(CompressorConfig::default())),
            compressor_dirty: array::from_fn(|_| AtomicBool::new(false)),
            delay: array::from_fn(|_| Mutex::new(DelayConfig::default())),
            delay_dirty: array::from_fn(|_| AtomicBool::new(false)),
            delay_flush: array::from_fn(|_| AtomicBool::new(false)),
            limiter: array::from_fn(|_| Mutex::new(LimiterConfig::default())),
            limiter_dirty: array::from_fn(|_| AtomicBool::new(false)),
            temperature_c: AtomicF32::new(20.0),
            temperature_factor: AtomicF32::new(1.0),
            meters: Meters::default(),
        }
    }

    fn check_output(&self, channel: usize) -> Result<(), Error> {
        if channel < NUM_OUTPUTS {
            Ok(())
        } else {
            Err(Error::InvalidChannel(channel))
        }
    }

    fn mark_all_dirty(&self) {
        self.routing_dirty.store(true, Ordering::Relaxed);
        for channel in 0..NUM_OUTPUTS {
            self.crossover_dirty[channel].store(true, Ordering::Relaxed);
            self.eq_dirty[channel].store(true, Ordering::Relaxed);
            self.compressor_dirty[channel].store(true, Ordering::Relaxed);
            self.delay_dirty[channel].store(true, Ordering::Relaxed);
            self.limiter_dirty[channel].store(true, Ordering::Relaxed);
        }
    }
}

/// One output channel's processing chain, in signal order.
struct OutputChain {
    crossover: CrossoverChannel,
    eq: EqChannel,
    compressor: Compressor,
    delay: DelayLine,
    limiter: Limiter,
}

impl OutputChain {
    fn new(sample_rate: f32, max_delay_ms: f32) -> Self {
        Self {
            crossover: CrossoverChannel::default(),
            eq: EqChannel::default(),
            compressor: Compressor::default(),
            delay: DelayLine::new(max_delay_ms, sample_rate),
            limiter: Limiter::new(sample_rate),
        }
    }

    fn reset(&mut self) {
        self.crossover.reset();
        self.eq.reset();
        self.compressor.reset();
        self.delay.reset();
        self.limiter.reset();
    }
}

/// The DSP engine. Owned by the audio thread; all per-sample state lives in here. Construction
/// allocates everything the audio path will ever need, and `process()` itself never allocates,
/// locks, or blocks.
pub struct Engine {
    shared: Arc<Shared>,
    sample_rate: f32,
    block_size: usize,

    /// The committed routing configuration the current block runs with.
    routing: RoutingConfig,
    chains: [OutputChain; NUM_OUTPUTS],
    /// Gain-conditioned copies of the input blocks.
    scratch: [Vec<f32>; NUM_INPUTS],
}

impl Engine {
    /// Build an engine. This is the only place the engine allocates; a nonsensical
    /// configuration is rejected rather than clamped since there is no running state to
    /// preserve.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        if !config.sample_rate.is_finite()
            || !(SAMPLE_RATE_RANGE.0..=SAMPLE_RATE_RANGE.1).contains(&config.sample_rate)
        {
            return Err(Error::InvalidConfig("sample rate out of range"));
        }
        if config.block_size == 0 || config.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig("block size out of range"));
        }
        if !config.max_delay_ms.is_finite() || config.max_delay_ms <= 0.0 {
            return Err(Error::InvalidConfig("maximum delay out of range"));
        }

        let max_delay_ms = config.max_delay_ms.min(MAX_DELAY_MS_CAP);
        if max_delay_ms != config.max_delay_ms {
            qm_log!(
                "Capping the maximum delay at {MAX_DELAY_MS_CAP} ms instead of the requested {} \
                 ms",
                config.max_delay_ms
            );
        }

        let shared = Arc::new(Shared::new(config.sample_rate, max_delay_ms));
        let mut engine = Self {
            shared,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            routing: RoutingConfig::default(),
            chains: array::from_fn(|_| OutputChain::new(config.sample_rate, max_delay_ms)),
            scratch: array::from_fn(|_| vec![0.0; config.block_size]),
        };

        // Commit the default configuration so the chains are coherent before the first block
        engine.shared.mark_all_dirty();
        engine.commit_pending();

        Ok(engine)
    }

    /// A handle for configuring the engine and reading meters, usable from any thread.
    pub fn controller(&self) -> Controller {
        Controller {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Process one block. Both input slices and all four output slices must hold exactly
    /// `block_size` frames. Parameter changes staged since the previous call are committed
    /// before the first sample, so a block always runs on a coherent configuration.
    pub fn process(&mut self, inputs: [&[f32]; NUM_INPUTS], outputs: [&mut [f32]; NUM_OUTPUTS]) {
        self.commit_pending();

        let mut frames = self
            .block_size
            .min(inputs[0].len())
            .min(inputs[1].len());
        for output in &outputs {
            frames = frames.min(output.len());
        }
        qm_debug_assert_eq!(frames, self.block_size);

        let Self {
            shared,
            chains,
            scratch,
            routing,
            ..
        } = self;

        // Input conditioning: gain, then the optional mono sum
        for (scratch, (input, gain)) in scratch
            .iter_mut()
            .zip(inputs.iter().zip(routing.input_gain))
        {
            for (conditioned, sample) in scratch.iter_mut().zip(*input) {
                *conditioned = sample * gain;
            }
        }
        if routing.mono_sum {
            let (first, second) = scratch.split_at_mut(1);
            for (a, b) in first[0][..frames].iter_mut().zip(&mut second[0][..frames]) {
                let mean = (*a + *b) * 0.5;
                *a = mean;
                *b = mean;
            }
        }

        for (channel, output) in outputs.into_iter().enumerate() {
            let output_routing = routing.outputs[channel];
            let chain = &mut chains[channel];

            if output_routing.mute || output_routing.source == InputSource::None {
                output[..frames].fill(0.0);
                shared.meters.clear_channel(channel);
                continue;
            }

            let input1 = &scratch[0][..frames];
            let input2 = &scratch[1][..frames];
            let mut peak = 0.0f32;
            for (frame, sample_out) in output[..frames].iter_mut().enumerate() {
                let mut sample = output_routing.sample(input1, input2, frame);
                sample = chain.crossover.process_sample(sample);
                sample = chain.eq.process_sample(sample);
                sample = chain.compressor.process_sample(sample);
                sample = chain.delay.process_sample(sample);
                sample = chain.limiter.process_sample(sample);

                *sample_out = sample;
                peak = peak.max(sample.abs());
            }

            let meters = &shared.meters;
            meters.compressor_gain_reduction_db[channel]
                .store(chain.compressor.gain_reduction_db(), Ordering::Relaxed);
            meters.compressor_input_level_db[channel]
                .store(chain.compressor.input_level_db(), Ordering::Relaxed);
            meters.limiter_gain_reduction_db[channel]
                .store(chain.limiter.gain_reduction_db(), Ordering::Relaxed);
            meters.limiter_peak_level[channel]
                .store(chain.limiter.peak_level(), Ordering::Relaxed);
            meters.limiter_active[channel].store(chain.limiter.is_active(), Ordering::Relaxed);
            meters.output_peak[channel].store(peak, Ordering::Relaxed);
        }
    }

    /// Clear every component's running state. Configurations are untouched.
    pub fn reset(&mut self) {
        for chain in &mut self.chains {
            chain.reset();
        }
        for channel in 0..NUM_OUTPUTS {
            self.shared.meters.clear_channel(channel);
        }
    }

    /// Switch to a new sample rate. Every coefficient is rederived from the staged
    /// configuration and all running state is cleared; audibly this is a full restart.
    pub fn update_sample_rate(&mut self, sample_rate: f32) -> Result<(), Error> {
        if !sample_rate.is_finite()
            || !(SAMPLE_RATE_RANGE.0..=SAMPLE_RATE_RANGE.1).contains(&sample_rate)
        {
            return Err(Error::InvalidConfig("sample rate out of range"));
        }

        self.sample_rate = sample_rate;
        self.shared.sample_rate.store(sample_rate, Ordering::Relaxed);
        // The delay rings and the limiter lookahead are sized in samples, so they have to be
        // rebuilt
        self.chains = array::from_fn(|_| OutputChain::new(sample_rate, self.shared.max_delay_ms));
        self.shared.mark_all_dirty();
        self.commit_pending();

        Ok(())
    }

    /// Drain the dirty flags, committing staged configurations into the chains. A staging cell
    /// that's momentarily held by a control thread is skipped and stays dirty; that component
    /// runs one more block on its previous configuration.
    fn commit_pending(&mut self) {
        let shared = Arc::clone(&self.shared);
        let sample_rate = self.sample_rate;
        let temperature_factor = shared.temperature_factor.load(Ordering::Relaxed);

        if shared.routing_dirty.load(Ordering::Relaxed) {
            if let Some(staged) = shared.routing.try_lock() {
                self.routing = *staged;
                shared.routing_dirty.store(false, Ordering::Relaxed);
            }
        }

        for channel in 0..NUM_OUTPUTS {
            let chain = &mut self.chains[channel];

            if shared.crossover_dirty[channel].load(Ordering::Relaxed) {
                if let Some(staged) = shared.crossover[channel].try_lock() {
                    chain.crossover.configure(&staged, sample_rate);
                    shared.crossover_dirty[channel].store(false, Ordering::Relaxed);
                }
            }
            if shared.crossover_reset[channel].swap(false, Ordering::Relaxed) {
                chain.crossover.reset();
            }

            if shared.eq_dirty[channel].load(Ordering::Relaxed) {
                if let Some(staged) = shared.eq[channel].try_lock() {
                    chain.eq.configure(&staged, sample_rate);
                    shared.eq_dirty[channel].store(false, Ordering::Relaxed);
                }
            }
            let reset_bands = shared.eq_reset[channel].swap(0, Ordering::Relaxed);
            if reset_bands != 0 {
                for band in 0..eq::NUM_BANDS {
                    if reset_bands & (1 << band) != 0 {
                        chain.eq.reset_band(band);
                    }
                }
            }

            if shared.compressor_dirty[channel].load(Ordering::Relaxed) {
                if let Some(staged) = shared.compressor[channel].try_lock() {
                    chain.compressor.configure(&staged, sample_rate);
                    shared.compressor_dirty[channel].store(false, Ordering::Relaxed);
                }
            }

            if shared.delay_dirty[channel].load(Ordering::Relaxed) {
                if let Some(staged) = shared.delay[channel].try_lock() {
                    chain.delay.configure(&staged, temperature_factor, sample_rate);
                    shared.delay_dirty[channel].store(false, Ordering::Relaxed);
                }
            }
            if shared.delay_flush[channel].swap(false, Ordering::Relaxed) {
                chain.delay.reset();
            }

            if shared.limiter_dirty[channel].load(Ordering::Relaxed) {
                if let Some(staged) = shared.limiter[channel].try_lock() {
                    chain.limiter.configure(&staged, sample_rate);
                    shared.limiter_dirty[channel].store(false, Ordering::Relaxed);
                }
            }
        }
    }
}

/// A cloneable, thread-safe handle to an [`Engine`]'s parameters and meters. Setters clamp
/// out-of-range values and report that through [`Applied::Clamped`]; the read-back methods
/// return the staged (i.e. clamped) configuration.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    fn sample_rate(&self) -> f32 {
        self.shared.sample_rate.load(Ordering::Relaxed)
    }

    // ---- Crossover ----

    /// Replace an output's crossover band configuration. The committed cascade is rebuilt at
    /// the next block boundary with cleared filter state.
    pub fn set_crossover_band(
        &self,
        channel: usize,
        config: CrossoverBandConfig,
    ) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;
        let (adopted, applied) = config.validated(self.sample_rate())?;

        *self.shared.crossover[channel].lock() = adopted;
        *self.shared.crossover_mode.lock() = CrossoverMode::Custom;
        self.shared.crossover_dirty[channel].store(true, Ordering::Relaxed);

        Ok(applied)
    }

    /// The staged crossover band configuration, i.e. the values that actually apply after
    /// clamping and slope rounding.
    pub fn crossover_band(&self, channel: usize) -> Result<CrossoverBandConfig, Error> {
        self.shared.check_output(channel)?;
        Ok(*self.shared.crossover[channel].lock())
    }

    pub fn enable_crossover(&self, channel: usize, enabled: bool) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;

        self.shared.crossover[channel].lock().enabled = enabled;
        self.shared.crossover_dirty[channel].store(true, Ordering::Relaxed);

        Ok(Applied::AsRequested)
    }

    /// Clear an output's crossover filter state at the next block boundary.
    pub fn reset_crossover(&self, channel: usize) -> Result<(), Error> {
        self.shared.check_output(channel)?;
        self.shared.crossover_reset[channel].store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Expand a crossover mode into band configurations for all four outputs.
    pub fn set_crossover_mode(&self, mode: CrossoverMode) -> Result<Applied, Error> {
        if let Some(layout) = mode.band_layout() {
            for (channel, band) in layout.into_iter().enumerate() {
                let (adopted, _) = band.validated(self.sample_rate())?;
                *self.shared.crossover[channel].lock() = adopted;
                self.shared.crossover_dirty[channel].store(true, Ordering::Relaxed);
            }
        }
        *self.shared.crossover_mode.lock() = mode;

        Ok(Applied::AsRequested)
    }

    pub fn crossover_mode(&self) -> CrossoverMode {
        *self.shared.crossover_mode.lock()
    }

    /// Apply one of the factory crossover presets.
    pub fn apply_crossover_preset(&self, preset: CrossoverPreset) -> Result<Applied, Error> {
        for (channel, band) in preset.band_configs().into_iter().enumerate() {
            let (adopted, _) = band.validated(self.sample_rate())?;
            *self.shared.crossover[channel].lock() = adopted;
            self.shared.crossover_dirty[channel].store(true, Ordering::Relaxed);
        }
        *self.shared.crossover_mode.lock() = CrossoverMode::Custom;

        Ok(Applied::AsRequested)
    }

    // ---- Parametric EQ ----

    pub fn set_eq_band(
        &self,
        channel: usize,
        band: usize,
        config: EqBandConfig,
    ) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;
        if band >= eq::NUM_BANDS {
            return Err(Error::InvalidBand(band));
        }

        let mut clamped = false;
        let adopted = config.clamped(self.sample_rate(), &mut clamped);
        self.shared.eq[channel].lock().bands[band] = adopted;
        self.shared.eq_dirty[channel].store(true, Ordering::Relaxed);

        Ok(Applied::from_clamped(clamped))
    }

    pub fn eq_band(&self, channel: usize, band: usize) -> Result<EqBandConfig, Error> {
        self.shared.check_output(channel)?;
        if band >= eq::NUM_BANDS {
            return Err(Error::InvalidBand(band));
        }

        Ok(self.shared.eq[channel].lock().bands[band])
    }

    pub fn eq_channel(&self, channel: usize) -> Result<EqChannelConfig, Error> {
        self.shared.check_output(channel)?;
        Ok(*self.shared.eq[channel].lock())
    }

    pub fn set_eq_pre_gain(&self, channel: usize, gain_db: f32) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;

        let mut clamped = false;
        let gain_db = util::observed_clamp(gain_db, -12.0, 12.0, &mut clamped);
        self.shared.eq[channel].lock().pre_gain_db = gain_db;
        self.shared.eq_dirty[channel].store(true, Ordering::Relaxed);

        Ok(Applied::from_clamped(clamped))
    }

    /// Clear one EQ band's filter state at the next block boundary.
    pub fn reset_eq_band(&self, channel: usize, band: usize) -> Result<(), Error> {
        self.shared.check_output(channel)?;
        if band >= eq::NUM_BANDS {
            return Err(Error::InvalidBand(band));
        }

        self.shared.eq_reset[channel].fetch_or(1 << band, Ordering::Relaxed);
        Ok(())
    }

    // ---- Compressor ----

    fn update_compressor(
        &self,
        channel: usize,
        update: impl FnOnce(&mut CompressorConfig),
    ) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;

        let mut staged = self.shared.compressor[channel].lock();
        update(&mut staged);
        let (adopted, applied) = staged.clamped();
        *staged = adopted;
        drop(staged);
        self.shared.compressor_dirty[channel].store(true, Ordering::Relaxed);

        Ok(applied)
    }

    pub fn compressor(&self, channel: usize) -> Result<CompressorConfig, Error> {
        self.shared.check_output(channel)?;
        Ok(*self.shared.compressor[channel].lock())
    }

    pub fn set_compressor_threshold(&self, channel: usize, db: f32) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.threshold_db = db)
    }

    pub fn set_compressor_ratio(&self, channel: usize, ratio: f32) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.ratio = ratio)
    }

    pub fn set_compressor_attack_ms(&self, channel: usize, ms: f32) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.attack_ms = ms)
    }

    pub fn set_compressor_release_ms(&self, channel: usize, ms: f32) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.release_ms = ms)
    }

    pub fn set_compressor_knee_width(&self, channel: usize, db: f32) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.knee_width_db = db)
    }

    pub fn set_compressor_makeup(&self, channel: usize, db: f32) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.makeup_db = db)
    }

    pub fn set_compressor_knee(&self, channel: usize, knee: KneeKind) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.knee = knee)
    }

    pub fn set_compressor_detection(
        &self,
        channel: usize,
        detection: DetectionMode,
    ) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.detection = detection)
    }

    pub fn enable_compressor(&self, channel: usize, enabled: bool) -> Result<Applied, Error> {
        self.update_compressor(channel, |config| config.enabled = enabled)
    }

    pub fn compressor_gain_reduction_db(&self, channel: usize) -> Result<f32, Error> {
        self.shared.check_output(channel)?;
        Ok(self.shared.meters.compressor_gain_reduction_db[channel].load(Ordering::Relaxed))
    }

    pub fn compressor_input_level_db(&self, channel: usize) -> Result<f32, Error> {
        self.shared.check_output(channel)?;
        Ok(self.shared.meters.compressor_input_level_db[channel].load(Ordering::Relaxed))
    }

    // ---- Delay ----

    fn update_delay(
        &self,
        channel: usize,
        update: impl FnOnce(&mut DelayConfig),
    ) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;

        let mut staged = self.shared.delay[channel].lock();
        update(&mut staged);
        let (adopted, applied) = staged.clamped(self.shared.max_delay_ms);
        *staged = adopted;
        drop(staged);
        self.shared.delay_dirty[channel].store(true, Ordering::Relaxed);

        Ok(applied)
    }

    pub fn delay(&self, channel: usize) -> Result<DelayConfig, Error> {
        self.shared.check_output(channel)?;
        Ok(*self.shared.delay[channel].lock())
    }

    pub fn set_delay_ms(&self, channel: usize, ms: f32) -> Result<Applied, Error> {
        self.update_delay(channel, |config| config.time_ms = ms)
    }

    /// Set the delay from a driver distance in centimeters, using the speed of sound at the
    /// reference temperature.
    pub fn set_delay_distance_cm(&self, channel: usize, cm: f32) -> Result<Applied, Error> {
        self.update_delay(channel, |config| {
            config.time_ms = delay::distance_cm_to_ms(cm)
        })
    }

    /// Set the delay from a driver distance in inches.
    pub fn set_delay_distance_in(&self, channel: usize, inches: f32) -> Result<Applied, Error> {
        self.update_delay(channel, |config| {
            config.time_ms = delay::distance_in_to_ms(inches)
        })
    }

    pub fn set_delay_polarity(&self, channel: usize, invert: bool) -> Result<Applied, Error> {
        self.update_delay(channel, |config| config.phase_invert = invert)
    }

    pub fn set_delay_mix(&self, channel: usize, mix: f32) -> Result<Applied, Error> {
        self.update_delay(channel, |config| config.mix = mix)
    }

    pub fn set_delay_interpolation(
        &self,
        channel: usize,
        interpolation: Interpolation,
    ) -> Result<Applied, Error> {
        self.update_delay(channel, |config| config.interpolation = interpolation)
    }

    pub fn enable_delay(&self, channel: usize, enabled: bool) -> Result<Applied, Error> {
        self.update_delay(channel, |config| config.enabled = enabled)
    }

    /// Zero a delay's ring buffer at the next block boundary.
    pub fn flush_delay(&self, channel: usize) -> Result<(), Error> {
        self.shared.check_output(channel)?;
        self.shared.delay_flush[channel].store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Update the air temperature used for delay compensation. Every active delay is
    /// recomputed from its stored logical time at the next block boundary.
    pub fn update_temperature_c(&self, celsius: f32) -> Applied {
        let mut clamped = false;
        let celsius = util::observed_clamp(
            celsius,
            TEMPERATURE_RANGE_C.0,
            TEMPERATURE_RANGE_C.1,
            &mut clamped,
        );

        self.shared.temperature_c.store(celsius, Ordering::Relaxed);
        self.shared
            .temperature_factor
            .store(delay::temperature_factor(celsius), Ordering::Relaxed);
        for channel in 0..NUM_OUTPUTS {
            self.shared.delay_dirty[channel].store(true, Ordering::Relaxed);
        }

        Applied::from_clamped(clamped)
    }

    pub fn temperature_c(&self) -> f32 {
        self.shared.temperature_c.load(Ordering::Relaxed)
    }

    // ---- Limiter ----

    fn update_limiter(
        &self,
        channel: usize,
        update: impl FnOnce(&mut LimiterConfig),
    ) -> Result<Applied, Error> {
        self.shared.check_output(channel)?;

        let mut staged = self.shared.limiter[channel].lock();
        update(&mut staged);
        let (adopted, applied) = staged.clamped();
        *staged = adopted;
        drop(staged);
        self.shared.limiter_dirty[channel].store(true, Ordering::Relaxed);

        Ok(applied)
    }

    pub fn limiter(&self, channel: usize) -> Result<LimiterConfig, Error> {
        self.shared.check_output(channel)?;
        Ok(*self.shared.limiter[channel].lock())
    }

    pub fn set_limiter_threshold(&self, channel: usize, db: f32) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.threshold_db = db)
    }

    pub fn set_limiter_ceiling(&self, channel: usize, db: f32) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.ceiling_db = db)
    }

    pub fn set_limiter_attack_ms(&self, channel: usize, ms: f32) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.attack_ms = ms)
    }

    pub fn set_limiter_release_ms(&self, channel: usize, ms: f32) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.release_ms = ms)
    }

    pub fn set_limiter_lookahead_ms(&self, channel: usize, ms: f32) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.lookahead_ms = ms)
    }

    pub fn set_limiter_adaptive_release(
        &self,
        channel: usize,
        adaptive: bool,
    ) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.adaptive_release = adaptive)
    }

    pub fn set_limiter_inter_sample_peaks(
        &self,
        channel: usize,
        enabled: bool,
    ) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.inter_sample_peaks = enabled)
    }

    pub fn set_limiter_bypass(&self, channel: usize, bypass: bool) -> Result<Applied, Error> {
        self.update_limiter(channel, |config| config.bypass = bypass)
    }

    pub fn limiter_gain_reduction_db(&self, channel: usize) -> Result<f32, Error> {
        self.shared.check_output(channel)?;
        Ok(self.shared.meters.limiter_gain_reduction_db[channel].load(Ordering::Relaxed))
    }

    pub fn limiter_peak_level(&self, channel: usize) -> Result<f32, Error> {
        self.shared.check_output(channel)?;
        Ok(self.shared.meters.limiter_peak_level[channel].load(Ordering::Relaxed))
    }

    pub fn limiter_is_active(&self, channel: usize) -> Result<bool, Error> {
        self.shared.check_output(channel)?;
        Ok(self.shared.meters.limiter_active[channel].load(Ordering::Relaxed))
    }

    pub fn output_peak(&self, channel: usize) -> Result<f32, Error> {
        self.shared.check_output(channel)?;
        Ok(self.shared.meters.output_peak[channel].load(Ordering::Relaxed))
    }

    // ---- Routing ----

    fn update_routing(
        &self,
        update: impl FnOnce(&mut RoutingConfig) -> Result<Applied, Error>,
    ) -> Result<Applied, Error> {
        let mut staged = self.shared.routing.lock();
        let applied = update(&mut staged)?;
        drop(staged);
        self.shared.routing_dirty.store(true, Ordering::Relaxed);

        Ok(applied)
    }

    pub fn routing(&self) -> RoutingConfig {
        *self.shared.routing.lock()
    }

    pub fn set_output_source(&self, channel: usize, source: InputSource) -> Result<Applied, Error> {
        self.update_routing(|routing| routing.set_source(channel, source))
    }

    pub fn set_input_gain(&self, input: usize, gain: f32) -> Result<Applied, Error> {
        self.update_routing(|routing| routing.set_input_gain(input, gain))
    }

    pub fn set_output_mix_level(&self, channel: usize, mix: f32) -> Result<Applied, Error> {
        self.update_routing(|routing| routing.set_mix(channel, mix))
    }

    pub fn set_output_mute(&self, channel: usize, mute: bool) -> Result<Applied, Error> {
        self.update_routing(|routing| routing.set_mute(channel, mute))
    }

    pub fn set_stereo_link(&self, pair: usize, linked: bool) -> Result<Applied, Error> {
        self.update_routing(|routing| routing.set_stereo_link(pair, linked))
    }

    pub fn set_mono_sum(&self, mono_sum: bool) -> Applied {
        let mut staged = self.shared.routing.lock();
        staged.set_mono_sum(mono_sum);
        drop(staged);
        self.shared.routing_dirty.store(true, Ordering::Relaxed);

        Applied::AsRequested
    }

    // ---- Bulk state ----

    /// Snapshot the complete staged configuration.
    pub fn save_state(&self) -> EngineState {
        EngineState {
            routing: *self.shared.routing.lock(),
            crossover: array::from_fn(|channel| *self.shared.crossover[channel].lock()),
            eq: array::from_fn(|channel| *self.shared.eq[channel].lock()),
            compressor: array::from_fn(|channel| *self.shared.compressor[channel].lock()),
            delay: array::from_fn(|channel| *self.shared.delay[channel].lock()),
            limiter: array::from_fn(|channel| *self.shared.limiter[channel].lock()),
        }
    }

    /// Stage a complete configuration. The state is validated as a whole first; on error
    /// nothing is applied. All components commit at the next block boundary.
    pub fn load_state(&self, state: &EngineState) -> Result<Applied, Error> {
        let (validated, applied) =
            state.validated(self.sample_rate(), self.shared.max_delay_ms)?;

        *self.shared.routing.lock() = validated.routing;
        for channel in 0..NUM_OUTPUTS {
            *self.shared.crossover[channel].lock() = validated.crossover[channel];
            *self.shared.eq[channel].lock() = validated.eq[channel];
            *self.shared.compressor[channel].lock() = validated.compressor[channel];
            *self.shared.delay[channel].lock() = validated.delay[channel];
            *self.shared.limiter[channel].lock() = validated.limiter[channel];
        }
        *self.shared.crossover_mode.lock() = CrossoverMode::Custom;
        self.shared.mark_all_dirty();

        Ok(applied)
    }
}
