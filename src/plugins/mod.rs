//! Subsystems of the directive lifecycle.

pub mod audit;
pub mod directive;
pub mod facility;
pub mod logs;
pub mod poll;
pub mod policy;
pub mod reaper;
pub mod result;
pub mod territory;
pub mod token;
