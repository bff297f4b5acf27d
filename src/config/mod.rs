// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod consts;
mod settings;

pub use consts::*;
pub use settings::Settings;
