// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod errors;
pub mod registry;
pub mod tool;

pub use errors::ToolError;
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{
    noop_update, AbortSignal, OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart,
    ToolUpdate,
};
