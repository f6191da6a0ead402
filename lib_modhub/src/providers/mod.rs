//! Data provider capability and the provider implementations shipped with the runtime.

pub mod composite;
pub mod memory;
pub mod provider;

pub use composite::CompositeProvider;
pub use provider::{DataDimension, DataProvider, Quote, SyncPolicy};
