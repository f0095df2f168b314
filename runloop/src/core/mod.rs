//! Pure, deterministic run-loop logic. No I/O.

pub mod completion;
pub mod types;
