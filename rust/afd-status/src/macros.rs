// Logging macros for afd-status
//
// These forward to the tracing crate, which records severity, module, file
// and line for every event.

#![allow(unused_macro_rules)]

// -----------------------------------------------------------------------------
// trace! - Poll iterations, per-record carry-forward
// -----------------------------------------------------------------------------

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - State transitions, decision points
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// info! - Region rotation, migration summaries, supervisor decisions
// -----------------------------------------------------------------------------

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Recoverable problems that fell back to a default
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// -----------------------------------------------------------------------------
// error! - Failures about to be returned to the caller
// -----------------------------------------------------------------------------

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
