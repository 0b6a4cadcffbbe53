//! The swap controller: a single-owner event loop over a fixed slot pool.

mod core;
mod handlers;
mod policy;


pub use self::core::{LoopStatus, RunningModelInfo, SwapController};
