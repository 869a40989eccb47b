pub mod archive;
pub mod baton_config;
pub mod budget;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod exec;
pub mod orchestrator;
pub mod transport;
pub mod ui;
