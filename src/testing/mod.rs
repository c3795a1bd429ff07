//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the bridge without
//! requiring an MQTT broker or real monitors.

pub mod mocks;

pub use mocks::*;
