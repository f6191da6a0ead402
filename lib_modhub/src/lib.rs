//! # lib_modhub
//!
//! A pluggable module runtime: a reconciler that keeps module instances in
//! line with definition files, and a cached, capability-routed data facade
//! those modules share.

#![forbid(unsafe_code)]

pub mod core;
pub mod errors;
pub mod modules;
pub mod providers;
pub mod settings;

pub use errors::{HubError, HubResult};
pub use modules::{Module, ModuleCatalog, ModuleConfig, ModuleLoader, UiWidget};
pub use settings::RuntimeSettings;
