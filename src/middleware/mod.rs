//! Middleware for observability.
//!
//! Request logging with latency tracking; money-path metrics are
//! emitted at the subsystem level rather than per-route.

pub mod logging;

pub use logging::request_logging_simple;
