//! nvsmi-metrics - A Rust library for polling NVIDIA GPU metrics
//!
//! This crate drives the `nvidia-smi` diagnostic tool on a timer and turns
//! its delimited query output into structured per-device metric snapshots.
//! It is the core of a desktop GPU monitor: the presentation layer registers
//! for the snapshot/error stream and stays responsive while all tool
//! invocations happen on a background task.
//!
//! # Features
//!
//! - **Command runner**: spawns one short-lived `nvidia-smi` process per
//!   poll, with a hard deadline and guaranteed child termination
//! - **Output parser**: tolerant CSV parsing with per-field unavailable
//!   sentinels, dropping malformed records instead of failing the poll
//! - **Poller**: cancellable periodic schedule, manual one-shot refresh,
//!   single-flight execution, ordered delivery to any number of subscribers
//! - **Views**: plain-text summary/detailed/raw renderings and a
//!   last-known-good view model for the presentation layer
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use nvsmi_metrics::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> nvsmi_metrics::Result<()> {
//!     let poller = Poller::new(Arc::new(NvidiaSmi::new()));
//!     let view = Arc::new(ViewModel::new());
//!     poller.subscribe(view.clone());
//!
//!     poller.start(5)?;
//!     tokio::time::sleep(Duration::from_secs(6)).await;
//!     println!("{}", view.summary_text());
//!
//!     poller.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Control-interface misuse surfaces as [`Error`]; poll failures never do.
//! Every failed poll is converted into a
//! [`PollError`](crate::metrics::PollError) value carrying the failure kind,
//! a human-readable message and the captured tool output, and is delivered to
//! subscribers like any other event. A failed poll never overwrites the last
//! good snapshot.
//!
//! # Thread Safety
//!
//! All public types are `Send` and `Sync` where appropriate. Subscriber
//! callbacks run on the polling task in poll-completion order; the control
//! interface can be called from any thread and never blocks on a poll.

pub mod error;
pub mod metrics;
pub mod parser;
pub mod poller;
pub mod runner;
pub mod view;

pub use error::{Error, Result};

/// Re-export of the common types for convenience
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{DeviceMetrics, MetricSnapshot, PollError, PollErrorKind};
    pub use crate::poller::{EventStream, PollEvent, Poller, PollerState, Subscriber};
    pub use crate::runner::{CommandRunner, NvidiaSmi};
    pub use crate::view::{TemperatureLevel, ViewModel};
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::poller::Poller;
    use crate::runner::MockCommandRunner;
    use crate::view::ViewModel;

    #[tokio::test]
    async fn poller_feeds_the_view_model() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok("0, NVIDIA A100, 45, 12, 1024, 40960, 70.5\n".to_string()));

        let poller = Poller::new(Arc::new(runner));
        let view = Arc::new(ViewModel::new());
        poller.subscribe(view.clone());

        poller.manual_refresh().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while view.last_known_good().is_none() {
            assert!(std::time::Instant::now() < deadline, "no snapshot reached the view");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(view.summary_text().contains("GPU 0: NVIDIA A100"));
        assert!(view.raw_text().contains("40960"));
    }
}
