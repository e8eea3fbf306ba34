// AI planner - the hint side channel.
//
// A periodic worker reads recent runs per endpoint, asks the model for
// cadence adjustments through a closed tool surface, and writes TTL-scoped
// hints back to the endpoint row. The next scheduler planning cycle folds
// them in; this layer never writes `next_run_at`.

pub mod tools;
pub mod worker;

pub use tools::{hint_tool_definitions, HintTool, HintToolbox, ToolError};
pub use worker::{AiPlannerConfig, AiPlannerWorker};
