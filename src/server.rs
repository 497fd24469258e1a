mod domain;

pub use domain::LifecycleManager;
