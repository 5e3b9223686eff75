// src/error.rs
//! Error taxonomy of the transaction engine.
//!
//! Validation rejections are recoverable and leave the LIVE state untouched.
//! Hardware and firmware errors are scoped to the step that issued them.
//! `TxnError` is what every public `Device` operation returns.

use crate::model::{PlaneId, StreamId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Hardware block kinds tracked by the resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwBlock {
    TimingGenerator,
    Scaler,
    Compositor,
    LinkEncoder,
}

impl fmt::Display for HwBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HwBlock::TimingGenerator => "timing generator",
            HwBlock::Scaler => "scaler",
            HwBlock::Compositor => "compositor",
            HwBlock::LinkEncoder => "link encoder",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("no free pipe")]
    NoFreePipe,
    #[error("no free {0}")]
    NoFreeBlock(HwBlock),
    #[error("{0} is not part of this state")]
    UnknownStream(StreamId),
    #[error("{0} is already part of this state")]
    DuplicateStream(StreamId),
    #[error("{plane} is not bound to {stream}")]
    UnknownPlane { stream: StreamId, plane: PlaneId },
    #[error("{plane} is already bound to {stream}")]
    DuplicatePlane { stream: StreamId, plane: PlaneId },
    #[error("{block} {index} does not exist (pool has {available})")]
    BlockOutOfRange {
        block: HwBlock,
        index: u8,
        available: u8,
    },
    #[error("{block} {index} is booked by pipes {first} and {second}")]
    DoubleBooked {
        block: HwBlock,
        index: u8,
        first: usize,
        second: usize,
    },
    #[error("{stream} has no {block}")]
    MissingBlock { stream: StreamId, block: HwBlock },
    #[error("broken pipe chain at pipe {pipe}: {reason}")]
    BrokenChain { pipe: usize, reason: &'static str },
}

impl ResourceError {
    /// Errors that can only come from a corrupted pipe graph.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ResourceError::BrokenChain { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCategory {
    Resource,
    Bandwidth,
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthKind {
    /// Display clock in kHz.
    DisplayClock,
    /// Memory fetch bandwidth in kB/s.
    Memory,
    /// Link payload in kbit/s.
    Link,
}

impl fmt::Display for BandwidthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BandwidthKind::DisplayClock => "display clock",
            BandwidthKind::Memory => "memory bandwidth",
            BandwidthKind::Link => "link bandwidth",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureReason {
    #[error("link does not support compression")]
    DscUnsupported,
    #[error("link does not support variable refresh")]
    VrrUnsupported,
    #[error("sink cannot combine compression with variable refresh")]
    DscWithVrr,
    #[error("variable refresh range is empty")]
    InvalidVrrRange,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("resource conflict: {0}")]
    Resource(#[from] ResourceError),
    #[error("{kind} exceeded: requires {required}, ceiling {available}")]
    Bandwidth {
        kind: BandwidthKind,
        required: u64,
        available: u64,
    },
    #[error("{stream}: {reason}")]
    Feature {
        stream: StreamId,
        reason: FeatureReason,
    },
}

impl ValidationError {
    pub fn category(&self) -> ValidationCategory {
        match self {
            ValidationError::Resource(_) => ValidationCategory::Resource,
            ValidationError::Bandwidth { .. } => ValidationCategory::Bandwidth,
            ValidationError::Feature { .. } => ValidationCategory::Feature,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    #[error("bandwidth reservation rejected: {0}")]
    Rejected(String),
    #[error("pipe {pipe} programming failed: {reason}")]
    PipeProgramming { pipe: usize, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware did not answer {command} within {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },
    #[error("firmware channel closed")]
    ChannelClosed,
    #[error("firmware rejected {command} with status {status}")]
    Rejected { command: &'static str, status: u8 },
    #[error("no firmware channel attached")]
    NotAttached,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("work queue full")]
    Full,
    #[error("work queue shut down")]
    ShutDown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("bandwidth reservation failed: {0}")]
    BandwidthReservation(#[source] HwError),
    #[error("every stream failed to program: {failed:?}")]
    AllStreamsFailed { failed: Vec<StreamId> },
    #[error("refusing to commit inconsistent state: {0}")]
    InconsistentState(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("validation rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("commit failed: {0}")]
    Commit(#[from] CommitError),
    #[error("firmware: {0}")]
    Firmware(#[from] FirmwareError),
    #[error("transaction: {0}")]
    Resource(#[from] ResourceError),
    #[error("hardware: {0}")]
    Hardware(#[from] HwError),
    #[error("transaction was built on state {base}, current state is {current}")]
    Stale { base: u64, current: u64 },
    #[error("{0} is not active")]
    UnknownStream(StreamId),
    #[error("{plane} is not bound to {stream}")]
    UnknownPlane { stream: StreamId, plane: PlaneId },
    #[error("device is powered off")]
    PoweredOff,
}

impl TxnError {
    /// Category of a validation rejection, if this is one.
    pub fn validation_category(&self) -> Option<ValidationCategory> {
        match self {
            TxnError::Validation(e) => Some(e.category()),
            _ => None,
        }
    }
}
