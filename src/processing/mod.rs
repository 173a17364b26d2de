//! Processing module: the streaming token pipe, the exception bridge around
//! generation calls, and the context window budgeter

pub mod bridge;
pub mod budget;
mod stream;

pub use bridge::{run_guarded, BridgePolicy, FaultContext, OutcomeSlot, StreamingRun, Worker, WorkerOutcome};
pub use budget::{
    compute_budget, compute_context_budget, max_max_new_tokens, trim_prompt, MemoryRestriction, TokenBudget,
};
pub use stream::{fragment_pipe, FragmentSender, FragmentStream, PipeMessage, StopFlag};
