// src/device/mod.rs
//! Device: owner of the LIVE state container and entry point of every
//! transaction.
//!
//! ## Locking
//!
//! | Lock | Protects | Held by |
//! |---|---|---|
//! | `commit_lock` | one Commit Pipeline run at a time | MEDIUM/FULL updates, transactions, power-off |
//! | per-stream lock | one stream's pipes | commit (per stream), FAST updates, blanking |
//! | `current` | the LIVE pointer | brief reads, the swap |
//! | `irq` | VRR trackers, flip subscribers | interrupt entry points |
//!
//! Acquisition order is commit → per-stream → current, and irq → current.
//! Interrupt entry points never block on the commit lock: a VRR adjustment
//! is written under `try_lock` and dropped while a commit runs, so a slow
//! FULL commit does not stall them. Trackers and per-stream locks of
//! streams missing from a newly installed container are pruned.
//!
//! Readers clone the LIVE `Arc` under a short read lock and work on that
//! snapshot; a concurrent swap cannot release it under them.

mod clock;
mod commit;
mod irq;
mod update;

pub use clock::{ClockCommand, IrqClock};

use crate::classify::UpdateType;
use crate::config::Config;
use crate::error::{FirmwareError, TxnError};
use crate::firmware::{AuxRequest, FirmwareChannel, FirmwareCommand};
use crate::hw::HwBackend;
use crate::model::{
    ColorDepth, CrtcTiming, Plane, PlaneId, Stream, StreamConfig, StreamId, VrrAdjust,
};
use crate::resource::ResourcePool;
use crate::state::{ClockState, State, StatePhase};
use crate::sync::{lock, read, write};
use crate::validate::{ValidationMode, Validator};
use crate::vrr::{FlipCompletion, VrrTracker};
use anyhow::Context;
use log::info;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};

/// Outcome of a proposed update or committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    pub tier: UpdateType,
    /// False when a FAST update was applied in place.
    pub state_replaced: bool,
    /// Id of the LIVE container after the operation.
    pub state_id: u64,
    /// Color depth the stream ended up with when its configuration changed;
    /// may be lower than requested when the link could not carry it.
    pub applied_color_depth: Option<ColorDepth>,
    /// Streams that failed to program and were left disabled.
    pub failed_streams: Vec<StreamId>,
    /// Flips were still pending, so clock lowering waits for a later update.
    pub optimize_deferred: bool,
}

/// Read-only view of a stream's timing in the LIVE container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSnapshot {
    pub stream_id: StreamId,
    pub timing: CrtcTiming,
    pub adjust: VrrAdjust,
    pub nominal_refresh_mhz: u32,
    pub color_depth: ColorDepth,
    pub vrr_active: bool,
    pub dpms_off: bool,
}

/// Topology edit on a copy of the LIVE container.
///
/// Built by `Device::begin_transaction`, applied by
/// `Device::commit_transaction`. Dropping it discards the copy.
#[derive(Debug)]
pub struct Transaction {
    base_id: u64,
    state: State,
    pool: ResourcePool,
}

impl Transaction {
    pub fn add_stream(&mut self, stream: Arc<Stream>) -> Result<(), TxnError> {
        Ok(self.state.add_stream(stream, &self.pool)?)
    }

    pub fn remove_stream(&mut self, id: StreamId) -> Result<Arc<Stream>, TxnError> {
        Ok(self.state.remove_stream(id)?)
    }

    pub fn add_plane(&mut self, stream: StreamId, plane: Arc<Plane>) -> Result<(), TxnError> {
        Ok(self.state.add_plane(stream, plane, &self.pool)?)
    }

    pub fn remove_plane(&mut self, stream: StreamId, plane: PlaneId) -> Result<Arc<Plane>, TxnError> {
        Ok(self.state.remove_plane(stream, plane, &self.pool)?)
    }

    pub fn state(&self) -> &State {
        &self.state
    }
}

#[derive(Default)]
struct IrqState {
    trackers: HashMap<StreamId, VrrTracker>,
    subscribers: Vec<Sender<FlipCompletion>>,
}

pub struct Device {
    config: Config,
    validator: Validator,
    backend: Arc<dyn HwBackend>,
    firmware: Option<FirmwareChannel>,
    current: RwLock<Option<Arc<State>>>,
    commit_lock: Mutex<()>,
    stream_locks: Mutex<HashMap<StreamId, Arc<Mutex<()>>>>,
    irq: Mutex<IrqState>,
    optimize_pending: AtomicBool,
}

impl Device {
    /// Powers the device on with an empty LIVE container.
    pub fn power_on(
        config: Config,
        backend: Arc<dyn HwBackend>,
        firmware: Option<FirmwareChannel>,
    ) -> anyhow::Result<Self> {
        config.check().context("invalid device configuration")?;
        let validator = Validator::new(&config);
        let mut initial = State::new(validator.pool().pipe_count);
        let clocks = validator
            .validate(&initial, ValidationMode::Full, ClockState::default())
            .context("validating the empty state")?;
        initial.mark_validated(clocks);
        initial.transition(StatePhase::Validated, StatePhase::Live);

        info!(
            "Device: powered on with {} pipe(s), state {}",
            validator.pool().pipe_count,
            initial.id()
        );
        Ok(Self {
            config,
            validator,
            backend,
            firmware,
            current: RwLock::new(Some(Arc::new(initial))),
            commit_lock: Mutex::new(()),
            stream_locks: Mutex::new(HashMap::new()),
            irq: Mutex::new(IrqState::default()),
            optimize_pending: AtomicBool::new(false),
        })
    }

    /// Commits an empty container, disabling every pipe; every later
    /// operation returns `PoweredOff`.
    pub fn power_off(&self) -> Result<(), TxnError> {
        let commit = lock(&self.commit_lock);
        let current = self.current_state()?;
        let mut empty = State::new(self.validator.pool().pipe_count);
        let clocks = self
            .validator
            .validate(&empty, ValidationMode::Full, current.clocks())?;
        empty.mark_validated(clocks);
        let affected = current.streams().iter().map(|s| s.id()).collect();
        self.run_commit(&commit, empty, UpdateType::Full, &affected)?;

        if let Some(last) = write(&self.current).take() {
            last.transition(StatePhase::Live, StatePhase::Retired);
        }
        lock(&self.irq).trackers.clear();
        lock(&self.stream_locks).clear();
        info!("Device: powered off");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn firmware(&self) -> Option<&FirmwareChannel> {
        self.firmware.as_ref()
    }

    /// A counted reference to the LIVE container.
    pub fn current_state(&self) -> Result<Arc<State>, TxnError> {
        read(&self.current).clone().ok_or(TxnError::PoweredOff)
    }

    /// Runs `f` while the LIVE pointer cannot be swapped.
    pub fn with_current<R>(&self, f: impl FnOnce(&State) -> R) -> Result<R, TxnError> {
        let current = read(&self.current);
        let state = current.as_ref().ok_or(TxnError::PoweredOff)?;
        Ok(f(state))
    }

    fn stream_lock(&self, id: StreamId) -> Arc<Mutex<()>> {
        Arc::clone(lock(&self.stream_locks).entry(id).or_default())
    }

    /// Builds a stream object, lowering its color depth if its link needs
    /// that. Returns the stream and the depth applied.
    pub fn create_stream(
        &self,
        id: StreamId,
        config: StreamConfig,
    ) -> Result<(Arc<Stream>, ColorDepth), TxnError> {
        let config = self.validator.fit_color_depth(id, config)?;
        Ok((Arc::new(Stream::new(id, config)), config.color_depth))
    }

    // --- Transactions ---

    pub fn begin_transaction(&self) -> Result<Transaction, TxnError> {
        let current = self.current_state()?;
        Ok(Transaction {
            base_id: current.id(),
            state: current.copy_construct(),
            pool: *self.validator.pool(),
        })
    }

    /// Fully validates the transaction and commits it across all streams.
    pub fn commit_transaction(&self, txn: Transaction) -> Result<TransactionReport, TxnError> {
        let commit = lock(&self.commit_lock);
        let current = self.current_state()?;
        if txn.base_id != current.id() {
            return Err(TxnError::Stale {
                base: txn.base_id,
                current: current.id(),
            });
        }
        let mut state = txn.state;
        let clocks = self
            .validator
            .validate(&state, ValidationMode::Full, current.clocks())?;
        state.mark_validated(clocks);

        let affected = state
            .streams()
            .iter()
            .chain(current.streams())
            .map(|s| s.id())
            .collect();
        let outcome = self.run_commit(&commit, state, UpdateType::Full, &affected)?;
        Ok(TransactionReport {
            tier: UpdateType::Full,
            state_replaced: true,
            state_id: outcome.state_id,
            applied_color_depth: None,
            failed_streams: outcome.failed,
            optimize_deferred: outcome.optimize_deferred,
        })
    }

    // --- Queries ---

    pub fn query_current_timing(&self, id: StreamId) -> Result<TimingSnapshot, TxnError> {
        let current = self.current_state()?;
        let stream = current.stream(id).ok_or(TxnError::UnknownStream(id))?;
        Ok(TimingSnapshot {
            stream_id: id,
            timing: *stream.timing(),
            adjust: stream.adjust(),
            nominal_refresh_mhz: stream.timing().refresh_mhz(),
            color_depth: stream.config().color_depth,
            vrr_active: stream.vrr_active(),
            dpms_off: stream.dpms_off(),
        })
    }

    // --- Firmware ---

    /// Runs one side-channel bus transaction and returns the bytes read.
    pub fn submit_aux(&self, request: AuxRequest) -> Result<Vec<u8>, TxnError> {
        let firmware = self.firmware.as_ref().ok_or(FirmwareError::NotAttached)?;
        let reply = firmware.send_command_sync(
            FirmwareCommand::Aux(request),
            self.config.timeouts.firmware_sync(),
        )?;
        Ok(reply.data)
    }
}
