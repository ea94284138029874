//! Shared fixtures for the linkdrop integration tests

pub mod fixtures;
