// src/macros.rs

//
// Logging macros
//
// logging feature enabled  → tracing
// logging feature disabled → log_error prints to stderr, the other levels
//                            still type-check their arguments (so captured
//                            variables never trigger unused warnings) but
//                            emit nothing.
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("[amqp-rpc] {}", format_args!($($arg)*))
    };
}

// --------------------
// WARN / INFO / DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

// --------------------
// DISPATCH STAGES
// --------------------

/// Record a per-message dispatch stage transition at debug level.
///
/// `log_stage!(queue, tag, "decoded")`
macro_rules! log_stage {
    ($queue:expr, $tag:expr, $stage:literal) => {
        $crate::macros::log_debug!("[{}] delivery {}: {}", $queue, $tag, $stage)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_stage;
pub(crate) use log_warn;
