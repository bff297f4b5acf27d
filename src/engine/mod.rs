// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod context;
pub mod executor;
#[cfg(test)]
pub mod integration_tests;

pub use context::{ExecutionContext, Services, UserContext};
pub use executor::{FlowExecutor, FlowResult, Invocation};
