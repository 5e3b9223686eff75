// src/lib.rs
//! Display-pipeline state-transaction engine.
//!
//! A proposed display change is classified by how much hardware it touches,
//! validated against the pipe and bandwidth pool, and committed atomically:
//! address-only changes are applied to the LIVE state in place, everything
//! else goes through a copy-on-write state container and the Commit
//! Pipeline. Interrupt entry points drive variable-refresh adjustment and
//! flip-completion delivery alongside commits.
//!
//! `Device` is the entry point; `HeadlessBackend` and `LoopbackCoprocessor`
//! stand in for the register back-end and the display co-processor.

pub mod classify;
pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod hw;
pub mod model;
pub mod resource;
pub mod state;
pub mod validate;
pub mod vrr;
pub mod work_queue;

mod sync;

#[cfg(test)]
mod test_support;

pub use classify::{StreamUpdate, SurfaceUpdate, UpdateType};
pub use config::{Config, CONFIG};
pub use device::{Device, TimingSnapshot, Transaction, TransactionReport};
pub use error::TxnError;
