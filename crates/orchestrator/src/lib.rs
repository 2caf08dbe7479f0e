//! Distributed driver for the tree-walk engine.
//!
//! This crate schedules the rank-local machinery from the `kernel` crate
//! across processes and threads:
//! - [`comm`] -- communicator abstraction (in-process mailbox, optional MPI)
//! - [`exchange`] -- counts exchange and sparse non-blocking payload moves
//! - [`sched`] -- the hand-rolled fetch-add chunk scheduler
//! - [`runner`] -- the top-tree / primary / secondary phase runners
//! - [`driver`] -- the outer iterate-until-all-done loop
//! - [`hsml`] -- the adaptive-radius convergence loop
//! - [`stats`] -- per-walk counters and timings
//! - [`config`] -- engine parameters

#![warn(missing_docs)]

pub mod comm;
pub mod config;
pub mod driver;
pub mod exchange;
pub mod hsml;
mod runner;
pub mod sched;
pub mod stats;

pub use comm::{Communicator, LocalComm, LocalUniverse, WaitRecv, WaitSend};
pub use config::EngineParams;
pub use driver::{WalkEngine, WalkError};
pub use hsml::{hsml_loop, narrow_down, HsmlLoopStats, MAXITER};
pub use stats::WalkStats;

#[cfg(feature = "mpi")]
pub use comm::MpiComm;
