//! Deployment module

pub mod engine;
pub mod fsm;
pub mod gate;
pub mod hooks;
pub mod publisher;
pub mod runner;
pub mod stages;
pub mod workspace;
