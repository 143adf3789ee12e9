#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Live-telemetry subscriptions and test sessions for pool testing devices.
//!
//! All device I/O goes through `poolwatch_traits::TelemetryChannel` and
//! `poolwatch_traits::RecordingService`.
//!
//! ## Architecture
//!
//! - **Registry**: at most one subscription handle per device (`registry` module)
//! - **Connection**: Idle/Connecting/Connected/Disconnected/Error (`connection` module)
//! - **Sessions**: bounded, at-most-one test session per device (`session`, `orchestrator`)
//! - **Workers**: one thread per device serializes every event for it; a
//!   second per-device lane runs recording calls in order
//! - **Status**: published per-device views and `StatusSnapshot` aggregation (`status` module)
//!
//! ## Quick start
//!
//! ```no_run
//! use poolwatch_core::mocks::{MockChannel, MockRecorder};
//! use poolwatch_core::{DeviceId, Monitor};
//!
//! let monitor = Monitor::builder()
//!     .with_channel(MockChannel::new())
//!     .with_recorder(MockRecorder::new())
//!     .build()?;
//! let pool = DeviceId::new("poolA");
//! monitor.ensure(&pool)?;
//! monitor.start_session(&pool)?;
//! println!("{:?}", monitor.snapshot(&pool));
//! # Ok::<(), eyre::Report>(())
//! ```

pub mod config;
pub mod connection;
#[cfg(feature = "config")]
pub mod conversions;
pub mod error;
pub mod mocks;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod status;
pub mod timer;
pub mod types;
pub mod util;

mod device;
mod lane;
mod worker;

pub use config::{Timings, TopicScheme};
pub use error::{BuildError, MonitorError, Report, Result};
pub use monitor::{Missing, Monitor, MonitorBuilder, Set};
pub use orchestrator::TestSessionOrchestrator;
pub use poolwatch_traits::{DeviceId, TelemetrySample};
pub use registry::SubscriptionRegistry;
pub use session::SessionView;
pub use status::{ConnectionView, DeviceView, StatusSnapshot, aggregate};
pub use types::{ConnectionStatus, Device, SessionOutcome, SessionStatus};
