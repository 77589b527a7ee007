//! deployd library
//!
//! Builds web projects from git repositories and publishes their static
//! output into a single serving location, one deployment at a time.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
