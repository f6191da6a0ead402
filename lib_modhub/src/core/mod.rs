//! # Core Runtime
//!
//! The shared services every module instance runs against.
//!
//! ## Core Components:
//!
//! - **`aggregator`**: per-provider TTL cache with single-flight fetches.
//!   Concurrent callers asking for the same key share one upstream call.
//!
//! - **`router`**: the `HybridProvider` data facade. Resolves each operation to
//!   a registered provider through configured routes, the default provider or
//!   capability discovery.
//!
//! - **`scheduler`**: interval jobs tagged with the owning instance id so they
//!   can be cancelled together.
//!
//! - **`dispatcher`**: the zero-copy fan-out of UI frames to dashboard clients.
//!
//! - **`registry`**: live instances, the widget ids they own and the topics
//!   they subscribe to.
//!
//! - **`context`**: the `RuntimeContext` tying the above together, and the
//!   per-instance `ModuleContext` view modules are given.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Coalescing TTL cache in front of a single provider.
pub mod aggregator;
/// Instance-scoped services and the runtime that owns them.
pub mod context;
/// The central, zero-copy broadcaster for UI frames.
pub mod dispatcher;
/// Timer and topic events.
pub mod event;
/// Instance, widget and topic bookkeeping.
pub mod registry;
/// Capability-based routing across registered providers.
pub mod router;
/// Interval jobs with tag-based cancellation.
pub mod scheduler;

// --- Public API Re-exports ---
pub use aggregator::DataAggregator;
pub use context::{ModuleContext, RuntimeContext};
pub use dispatcher::{Dispatcher, UiFrame};
pub use event::Event;
pub use registry::Registry;
pub use router::{HybridProvider, RouteOrigin};
pub use scheduler::Scheduler;
