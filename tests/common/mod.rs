//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - An in-memory master and envelope builders
//! - Polling helpers for asynchronous assertions

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
