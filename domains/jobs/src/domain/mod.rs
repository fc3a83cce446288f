//! Jobs domain layer: entities, state machine, planning, progress, retry

pub mod entities;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod state;
