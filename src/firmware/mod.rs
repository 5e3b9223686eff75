// src/firmware/mod.rs
//! Firmware Channel: command/notification transport to the display
//! co-processor.
//!
//! ## Architecture
//!
//! ```text
//! caller ──send_command──────┐
//! caller ──send_command_sync─┤        ┌──────────────┐
//! inject_notification ───────┴─inbox─▶│ fw-inbox     │──execute──▶ Coprocessor
//!                                     │ thread       │◀─reply + notifications─┘
//!                                     └──────┬───────┘
//!                       reply channel ◀──────┤
//!                                            ▼
//!                              NotificationDispatcher
//!                         inline handler │ offloaded handler
//!                                        ▼          ▼
//!                                  fw-inbox    WorkQueue worker
//! ```
//!
//! Commands are executed in submission order. A synchronous command waits on
//! its own reply channel with a bounded timeout; a timeout is reported to the
//! caller only and leaves the channel usable.

pub mod loopback;

pub use loopback::{LoopbackCoprocessor, LoopbackProbe};

use crate::config::WorkerConfig;
use crate::error::FirmwareError;
use crate::model::LinkId;
use crate::sync::{lock, read, write};
use crate::work_queue::{WorkQueue, WorkQueueConfig};
use anyhow::{Context, Result};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// --- Commands ---

/// Side-channel (AUX) bus transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxRequest {
    pub link: LinkId,
    pub address: u32,
    pub write: bool,
    /// Bytes to write, ignored for reads.
    pub data: Vec<u8>,
    /// Bytes to read, ignored for writes.
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareCommand {
    /// Timing generators currently driving a lit stream.
    NotifyStreamMask { mask: u32 },
    /// Free-form telemetry.
    Trace(String),
    Aux(AuxRequest),
    /// Holds or releases double-buffered latching on the given timing
    /// generators while the driver reprograms them.
    HwLock { tg_mask: u32, lock: bool },
    /// Sideband configuration message; answered by a notification.
    SetConfig {
        link: LinkId,
        msg_type: u8,
        data: Vec<u8>,
    },
}

impl FirmwareCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FirmwareCommand::NotifyStreamMask { .. } => "notify-stream-mask",
            FirmwareCommand::Trace(_) => "trace",
            FirmwareCommand::Aux(_) => "aux",
            FirmwareCommand::HwLock { .. } => "hw-lock",
            FirmwareCommand::SetConfig { .. } => "set-config",
        }
    }
}

/// Status 0 is success.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareReply {
    pub status: u8,
    pub data: Vec<u8>,
}

impl FirmwareReply {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { status: 0, data }
    }
}

// --- Notifications ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    HotPlug,
    HotPlugIrq,
    AuxReply,
    SetConfigReply,
    BusError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub link: LinkId,
    pub payload: Vec<u8>,
}

/// What the co-processor produced for one command.
#[derive(Debug, Clone, Default)]
pub struct CoprocessorOutput {
    pub reply: Option<FirmwareReply>,
    pub notifications: Vec<Notification>,
}

/// The co-processor side of the channel; runs on the inbox thread.
pub trait Coprocessor: Send + 'static {
    fn execute(&mut self, command: &FirmwareCommand) -> CoprocessorOutput;
}

// --- Dispatcher ---

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    /// Run on a worker instead of the delivery thread.
    offload: bool,
    handler: NotificationHandler,
}

/// Routes inbound notifications to per-kind handlers.
pub struct NotificationDispatcher {
    handlers: RwLock<HashMap<NotificationKind, HandlerEntry>>,
    queue: WorkQueue,
}

static DROPPED_NOTIFICATIONS: AtomicU32 = AtomicU32::new(0);

impl NotificationDispatcher {
    fn new(workers: &WorkerConfig) -> Result<Self> {
        let mut config = WorkQueueConfig::from(workers);
        config.thread_name_prefix = "fw-deferred".to_string();
        Ok(Self {
            handlers: RwLock::new(HashMap::new()),
            queue: WorkQueue::new(config).context("starting firmware notification workers")?,
        })
    }

    fn register(&self, kind: NotificationKind, offload: bool, handler: NotificationHandler) {
        write(&self.handlers).insert(kind, HandlerEntry { offload, handler });
    }

    fn dispatch(&self, notification: Notification) {
        let entry = read(&self.handlers).get(&notification.kind).cloned();
        let Some(entry) = entry else {
            debug!(
                "FirmwareChannel: no handler for {:?} on {}",
                notification.kind, notification.link
            );
            return;
        };
        if !entry.offload {
            (entry.handler)(&notification);
            return;
        }
        let kind = notification.kind;
        let handler = entry.handler;
        if let Err(e) = self.queue.submit(move || handler(&notification)) {
            let count = DROPPED_NOTIFICATIONS.fetch_add(1, Ordering::Relaxed);
            if count % 100 == 0 {
                warn!(
                    "FirmwareChannel: dropped {:?} notification: {} ({} total)",
                    kind,
                    e,
                    count + 1
                );
            }
        }
    }
}

// --- Channel ---

struct Envelope {
    command: FirmwareCommand,
    reply_tx: Option<Sender<FirmwareReply>>,
}

enum InboxMessage {
    Command(Envelope),
    Notify(Notification),
}

pub struct FirmwareChannel {
    inbox_tx: Mutex<Option<Sender<InboxMessage>>>,
    inbox_thread: Option<JoinHandle<()>>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl FirmwareChannel {
    pub fn new<C: Coprocessor>(coprocessor: C, workers: &WorkerConfig) -> Result<Self> {
        let dispatcher = Arc::new(NotificationDispatcher::new(workers)?);
        let (inbox_tx, inbox_rx) = mpsc::channel();

        let thread_dispatcher = Arc::clone(&dispatcher);
        let inbox_thread = thread::Builder::new()
            .name("fw-inbox".to_string())
            .spawn(move || run_inbox_loop(coprocessor, inbox_rx, thread_dispatcher))
            .context("Failed to spawn firmware inbox thread")?;

        Ok(Self {
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox_thread: Some(inbox_thread),
            dispatcher,
        })
    }

    fn post(&self, message: InboxMessage) -> Result<(), FirmwareError> {
        lock(&self.inbox_tx)
            .as_ref()
            .ok_or(FirmwareError::ChannelClosed)?
            .send(message)
            .map_err(|_| FirmwareError::ChannelClosed)
    }

    /// Queues a command whose reply nobody waits for.
    pub fn send_command(&self, command: FirmwareCommand) -> Result<(), FirmwareError> {
        trace!("FirmwareChannel: queue {}", command.name());
        self.post(InboxMessage::Command(Envelope {
            command,
            reply_tx: None,
        }))
    }

    /// Sends a command and waits up to `timeout` for its reply.
    pub fn send_command_sync(
        &self,
        command: FirmwareCommand,
        timeout: Duration,
    ) -> Result<FirmwareReply, FirmwareError> {
        let name = command.name();
        let (reply_tx, reply_rx) = mpsc::channel();
        self.post(InboxMessage::Command(Envelope {
            command,
            reply_tx: Some(reply_tx),
        }))?;

        let reply = match reply_rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                warn!("FirmwareChannel: {} timed out after {:?}", name, timeout);
                return Err(FirmwareError::Timeout {
                    command: name,
                    timeout,
                });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(FirmwareError::ChannelClosed),
        };
        if reply.status != 0 {
            return Err(FirmwareError::Rejected {
                command: name,
                status: reply.status,
            });
        }
        Ok(reply)
    }

    /// Registers the handler for one notification kind, replacing any
    /// previous one. `offload` handlers run on a worker thread.
    pub fn register_handler<F>(&self, kind: NotificationKind, offload: bool, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.dispatcher.register(kind, offload, Arc::new(handler));
    }

    /// Delivers a notification as if the co-processor had raised it.
    pub fn inject_notification(&self, notification: Notification) -> Result<(), FirmwareError> {
        self.post(InboxMessage::Notify(notification))
    }

    /// Waits for offloaded handlers to finish; false on timeout.
    pub fn wait_deferred_idle(&self, timeout: Duration) -> bool {
        self.dispatcher.queue.wait_idle(timeout)
    }
}

impl Drop for FirmwareChannel {
    fn drop(&mut self) {
        // Closing the inbox ends the loop once queued commands are executed.
        lock(&self.inbox_tx).take();
        if let Some(handle) = self.inbox_thread.take() {
            if let Err(e) = handle.join() {
                error!("FirmwareChannel: inbox thread panicked: {:?}", e);
            }
        }
    }
}

fn run_inbox_loop<C: Coprocessor>(
    mut coprocessor: C,
    inbox_rx: Receiver<InboxMessage>,
    dispatcher: Arc<NotificationDispatcher>,
) {
    debug!("FirmwareChannel: inbox started");
    while let Ok(message) = inbox_rx.recv() {
        match message {
            InboxMessage::Command(envelope) => {
                let output = coprocessor.execute(&envelope.command);
                // Notifications a command raises are dispatched before its reply.
                for notification in output.notifications {
                    dispatcher.dispatch(notification);
                }
                if let (Some(reply_tx), Some(reply)) = (envelope.reply_tx, output.reply) {
                    // The caller may have timed out and dropped its receiver.
                    let _ = reply_tx.send(reply);
                }
            }
            InboxMessage::Notify(notification) => dispatcher.dispatch(notification),
        }
    }
    debug!("FirmwareChannel: inbox closed, exiting");
}
