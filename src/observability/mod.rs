// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability module for structured logging and tracing.
//!
//! Centralized message types for the diagnostic and operational logging
//! emitted by the execution subsystem. Message types are structs with a
//! `Display` impl plus a `StructuredLog` impl, so call sites log a single
//! value instead of scattering format strings:
//!
//! * `messages::engine` - flow compilation and execution events
//! * `messages::worker` - worker cache lifecycle and stats
//! * `messages::dispatch` - request dispatch outcomes

pub mod messages;
