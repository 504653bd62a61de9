pub mod cli;
pub mod providers;
pub mod resilience;
pub mod server;
pub mod store;
