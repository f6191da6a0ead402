#[cfg(feature = "builtin")]
pub mod builtin;
pub mod catalog;
pub mod definition;
pub mod loader;
pub mod module;

pub use catalog::ModuleCatalog;
pub use loader::ModuleLoader;
pub use module::{Module, ModuleConfig, UiWidget};
