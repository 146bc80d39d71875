//! Browser relay server core.

pub mod cli;
pub mod openai_compat;
pub mod queue;
pub mod registry;
pub mod router;
pub mod tunnel;
