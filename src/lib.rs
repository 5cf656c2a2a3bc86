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

//! Quartermaster is the DSP core of an active loudspeaker crossover: two inputs are routed into
//! four output channels, and every output runs through a crossover band, a five band parametric
//! EQ, a compressor, an alignment delay, and a peak limiter. The [`Engine`] owns all DSP state
//! and processes fixed-size blocks with bounded per-sample work and no allocations; a
//! [`Controller`] can retune any parameter from another thread, and changes are committed
//! between blocks so a block never sees a half-updated component.
//!
//! The host is expected to sit between the engine and the actual audio hardware: it hands
//! `process()` one input block per codec interrupt and ships the four output channels to the
//! DACs. Everything else (UI, preset storage, codec setup) talks to the [`Controller`].

#[macro_use]
pub mod debug;

pub mod util;

pub mod biquad;
pub mod compressor;
pub mod crossover;
pub mod delay;
pub mod design;
pub mod engine;
pub mod eq;
pub mod limiter;
pub mod preset;
pub mod routing;

// Re-exported for use by the macros in `debug`
pub use log;

pub use engine::{Controller, Engine, EngineConfig};
pub use preset::{CrossoverMode, CrossoverPreset, EngineState};

/// The number of input channels.
pub const NUM_INPUTS: usize = 2;
/// The number of output channels.
pub const NUM_OUTPUTS: usize = 4;

/// How a setter handled the requested value. Out-of-range numeric values are not errors: they
/// are clamped into range, and the read-back API exposes the value that actually took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The request was applied exactly as passed in.
    AsRequested,
    /// One or more values had to be clamped into their legal range.
    Clamped,
}

impl Applied {
    pub(crate) fn from_clamped(clamped: bool) -> Self {
        if clamped {
            Applied::Clamped
        } else {
            Applied::AsRequested
        }
    }

    pub fn was_clamped(self) -> bool {
        self == Applied::Clamped
    }

    /// Combine two outcomes; a clamp anywhere is a clamp overall.
    pub(crate) fn and(self, other: Applied) -> Applied {
        Self::from_clamped(self.was_clamped() || other.was_clamped())
    }
}

/// The structural errors the engine API can return. Numeric range problems never show up here;
/// those are clamped and reported through [`Applied::Clamped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A channel or pair index outside the valid range. The state is unchanged.
    InvalidChannel(usize),
    /// A band index outside the valid range for the component. The state is unchanged.
    InvalidBand(usize),
    /// A structurally impossible parameter combination. The state is unchanged.
    InvalidMode(&'static str),
    /// The engine couldn't be constructed from the given configuration.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidChannel(channel) => write!(f, "invalid channel index {channel}"),
            Error::InvalidBand(band) => write!(f, "invalid band index {band}"),
            Error::InvalidMode(reason) => write!(f, "invalid mode: {reason}"),
            Error::InvalidConfig(reason) => write!(f, "invalid engine configuration: {reason}"),
        }
    }
}

impl std::error::Error for Error {}
