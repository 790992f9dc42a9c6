//! Shared infrastructure used across components: graceful shutdown and
//! lock-free metrics counters.

pub mod metrics;
pub mod shutdown;

pub use metrics::AtomicCounters;
pub use shutdown::{setup_shutdown, setup_shutdown_with_message, ShutdownReceiver, ShutdownSender};
