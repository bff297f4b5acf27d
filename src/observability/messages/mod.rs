// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Centralized message types for structured logging.
//!
//! Each message type implements:
//!
//! * `Display` - human-readable output
//! * [`StructuredLog`] - emission with machine-readable fields attached
//!
//! Messages are organized by subsystem: [`engine`], [`worker`],
//! [`dispatch`].

pub mod dispatch;
pub mod engine;
pub mod worker;

/// Emit a message with structured fields at its intrinsic level.
pub trait StructuredLog {
    fn log(&self);
}
