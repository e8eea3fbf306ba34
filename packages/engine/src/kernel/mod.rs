// Kernel - core infrastructure with dependency injection
//
// Ports (traits) live in `traits`, concrete adapters next to them.
// The kernel is INFRASTRUCTURE only: clocks, cron math, key material,
// quota gating, and the LLM client. Scheduling behavior lives in the
// scheduler and ai_planner layers.

pub mod ai;
pub mod clock;
pub mod cron;
pub mod quota;
pub mod signing;
pub mod test_dependencies;
pub mod traits;

pub use ai::ClaudeClient;
pub use clock::SystemClock;
pub use cron::{validate_expression, CronError, UtcCron};
pub use quota::UnmeteredQuota;
pub use signing::{IssuedSigningKey, PostgresSigningKeys};
pub use test_dependencies::{FakeClock, FakeCron, MockAI, MockQuota, StaticSigningKeys};
pub use traits::*;
