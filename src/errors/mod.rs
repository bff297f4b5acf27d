// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod flow;
mod node;

pub use flow::{FlowError, ValidationError};
pub use node::{NodeError, NodeErrorKind};
