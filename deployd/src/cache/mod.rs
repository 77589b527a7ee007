//! In-memory caches

pub mod deployments;
