//! Installs Minecraft servers and supervises their processes across program runs.

pub mod archive;
pub mod config;
pub mod download;
pub mod error;
pub mod instance;
pub mod resolver;
pub mod server;
pub mod supervisor;
pub mod utils;

pub use config::{Implementation, ManagerConfig, Variant};
pub use error::LifecycleError;
pub use instance::{InstallRequest, Instance, InstanceStatus, InstanceStore};
pub use server::LifecycleManager;
pub use supervisor::{ProcessSupervisor, Supervisor};
