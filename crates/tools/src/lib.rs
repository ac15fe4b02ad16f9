//! Built-in tools for Hearth.
//!
//! Small, side-effect-free tools that a local model can call through the
//! `<tool_call>` envelope: arithmetic and the current time. Callers add their
//! own tools through [`ToolRegistry::builder`] or [`FunctionTool`].
//!
//! [`FunctionTool`]: hearth_core::FunctionTool

pub mod calculator;
pub mod clock;

use hearth_core::{Result, ToolRegistry, ToolRegistryBuilder};

pub use calculator::CalculatorTool;
pub use clock::ClockTool;

/// A registry builder preloaded with every built-in tool.
pub fn builtin_tools() -> ToolRegistryBuilder {
    ToolRegistry::builder().tool(CalculatorTool).tool(ClockTool)
}

/// Registry with all built-in tools.
pub fn default_registry() -> Result<ToolRegistry> {
    let registry = builtin_tools().build()?;
    tracing::debug!(tools = ?registry.names(), "Built-in tool registry ready");
    Ok(registry)
}
