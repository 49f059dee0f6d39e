//! Shared test utilities for npsa-orchestration integration tests
//!
//! - `fixtures`: records and a scripted per-unit pipeline
//! - `builders`: orchestrators and controllers wired to an in-memory store

#![allow(dead_code)]

mod builders;
mod fixtures;

pub use builders::*;
pub use fixtures::*;
