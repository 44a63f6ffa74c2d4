//! Execution orchestration engine
//!
//! [`StateMachineRunner`] drives one run through
//! `Init → PlanReady → WavePlanning ⇄ LevelDispatch → Completed | Error`,
//! dispatching checks level by level and folding their results into the
//! journal and run state.

mod context;
mod dispatch;
mod events;
mod planning;
mod runner;
mod state;
mod stats;


pub use context::{for_each_items, BindingsBuilder, DispatchFacts, EventContext, DEFAULT_EVENT};
pub use events::{EngineEvent, EventBus};
pub use planning::{candidate_scopes, dependencies_satisfied, merge_forward_runs, select_checks, Selection};
pub use runner::{RunOptions, RunOutcome, StateMachineRunner};
pub use state::{
    DeferredFinish, DispatchRecord, DispatchStatus, EngineState, ForwardRunRequest, LevelOrigin, PlannedLevel,
    RunState, SkipReason, Supersession,
};
pub use stats::{CheckStatistics, ExecutionStatistics};
