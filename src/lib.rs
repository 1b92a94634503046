pub mod backend;
pub mod config;
pub mod errors;
pub mod gates;
pub mod local;
pub mod logging;
pub mod orchestrator;
pub mod parallel;
pub mod qa_config;
pub mod remote;
pub mod stage;
pub mod stream;
pub mod ui;
