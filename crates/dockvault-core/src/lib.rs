pub mod backup;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
pub mod lock;
pub mod maintenance;
pub mod mapper;
pub mod model;
pub mod orchestrator;
pub mod pause;
pub mod record;
pub mod remote;
pub mod report;
pub mod restore;
pub mod retention;
pub mod runtime;
pub mod sequencer;
pub mod space;

#[cfg(test)]
mod testing;
