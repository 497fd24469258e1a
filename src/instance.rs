mod store;
mod types;

pub use store::InstanceStore;
pub use types::{InstallRequest, Instance, InstanceStatus, ProcessHandle};
