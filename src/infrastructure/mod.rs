pub mod config;
pub mod controller_client;
pub mod credential_store;
pub mod error;
pub mod filter_appliance;
pub mod state_store;
pub mod storage;
pub mod trigger_timer;
