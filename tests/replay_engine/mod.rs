//! Replay Engine Tests
//!
//! Hand-written histories replayed against small orchestrations, covering
//! record matching, completion delivery, composition and determinism checks.


mod continue_as_new;
mod nondeterminism;
mod sequential_progress;
