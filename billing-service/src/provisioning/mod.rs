//! Provisioning: extension plug-ins, the per-service action lock and the
//! dispatcher that queues actions for them.

mod actions;
pub mod dispatcher;
mod extension;
mod none;

pub use actions::ServiceActions;
pub use dispatcher::{ActionHandler, DispatchSettings, Dispatcher, ServiceStore};
pub use extension::{queue_name, Extension, ExtensionRegistry, SettingField};
pub use none::NoneExtension;
