pub mod bootstrap;
pub mod commands;
pub mod device_index;
pub mod engine;
pub mod executor;
pub mod override_manager;
pub mod reconciler;
