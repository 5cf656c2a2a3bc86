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

// NOTE: Exporting macros in Rust is a bit weird. `#[macro_export]` causes them to be exported to
//       the crate root, but that makes it difficult to include just the macros without using
//       `#[macro_use] extern crate quartermaster;`. That's why the macros are also re-exported
//       from this module.

/// Write something to the logger. Whatever implementation the host installed for the `log` facade
/// decides where this ends up. The engine only logs from the control path, never per sample.
#[macro_export]
macro_rules! qm_log {
    ($($args:tt)*) => (
        $crate::log::info!($($args)*)
    );
}
pub use qm_log;

/// Similar to `qm_log!()`, more scream-y. Used for printing fatal errors.
#[macro_export]
macro_rules! qm_error {
    ($($args:tt)*) => (
        $crate::log::error!($($args)*)
    );
}
pub use qm_error;

/// A `debug_assert!()` analogue that prints the error with line number information instead of
/// panicking. The audio thread must keep running even when an invariant is violated, so a broken
/// assumption becomes a log line rather than an abort.
#[macro_export]
macro_rules! qm_debug_assert {
    ($cond:expr $(,)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond)));
        }
    );
    ($cond:expr, $format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond), ", ", $format), $($($args)*)?);
        }
    );
}
pub use qm_debug_assert;

/// An unconditional debug assertion failure, for if the condition has already been checked
/// elsewhere.
#[macro_export]
macro_rules! qm_debug_assert_failure {
    () => (
        if cfg!(debug_assertions) {
            $crate::log::debug!("Debug assertion failed");
        }
    );
    ($format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) {
            $crate::log::debug!(concat!("Debug assertion failed: ", $format), $($($args)*)?);
        }
    );
}
pub use qm_debug_assert_failure;

/// A `debug_assert_eq!()` analogue that prints the error with line number information instead of
/// panicking.
#[macro_export]
macro_rules! qm_debug_assert_eq {
    ($left:expr, $right:expr $(,)?) => (
        if cfg!(debug_assertions) && $left != $right {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($left), " != ", stringify!($right)));
        }
    );
    ($left:expr, $right:expr, $format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) && $left != $right  {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($left), " != ", stringify!($right), ", ", $format), $($($args)*)?);
        }
    );
}
pub use qm_debug_assert_eq;
