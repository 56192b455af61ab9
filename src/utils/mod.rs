//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and timeouts.
//!
//! ## Components
//! - **Logging**: Structured logging configuration and the severity vocabulary
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers and default deadlines

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use logging::{init_logging, Severity};
pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
