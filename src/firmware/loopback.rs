// src/firmware/loopback.rs
//! In-process co-processor that answers every command locally.
//!
//! Keeps a byte-addressed AUX space per link, acknowledges hardware locks,
//! and answers SetConfig with a notification. A shared probe records the
//! commands seen and injects latency or rejections.

use super::{
    AuxRequest, Coprocessor, CoprocessorOutput, FirmwareCommand, FirmwareReply, Notification,
    NotificationKind,
};
use crate::model::LinkId;
use crate::sync::lock;
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Shared view into a running `LoopbackCoprocessor`.
#[derive(Debug, Default)]
pub struct LoopbackProbe {
    log: Mutex<Vec<FirmwareCommand>>,
    latency: Mutex<Duration>,
    rejections: Mutex<HashMap<&'static str, u8>>,
}

impl LoopbackProbe {
    /// Commands executed so far, oldest first.
    pub fn commands(&self) -> Vec<FirmwareCommand> {
        lock(&self.log).clone()
    }

    /// Every command sleeps this long before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Answers every `command` (by name) with `status`; 0 clears it.
    pub fn reject(&self, command: &'static str, status: u8) {
        let mut rejections = lock(&self.rejections);
        if status == 0 {
            rejections.remove(command);
        } else {
            rejections.insert(command, status);
        }
    }
}

#[derive(Debug, Default)]
pub struct LoopbackCoprocessor {
    probe: Arc<LoopbackProbe>,
    aux_space: HashMap<(LinkId, u32), u8>,
}

impl LoopbackCoprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> Arc<LoopbackProbe> {
        Arc::clone(&self.probe)
    }

    fn aux(&mut self, request: &AuxRequest) -> FirmwareReply {
        if request.write {
            for (offset, byte) in request.data.iter().enumerate() {
                self.aux_space
                    .insert((request.link, request.address + offset as u32), *byte);
            }
            return FirmwareReply::ok(Vec::new());
        }
        let data = (0..request.length as u32)
            .map(|offset| {
                self.aux_space
                    .get(&(request.link, request.address + offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        FirmwareReply::ok(data)
    }
}

impl Coprocessor for LoopbackCoprocessor {
    fn execute(&mut self, command: &FirmwareCommand) -> CoprocessorOutput {
        trace!("LoopbackCoprocessor: {:?}", command);
        lock(&self.probe.log).push(command.clone());

        let latency = *lock(&self.probe.latency);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if let Some(status) = lock(&self.probe.rejections).get(command.name()).copied() {
            return CoprocessorOutput {
                reply: Some(FirmwareReply {
                    status,
                    data: Vec::new(),
                }),
                notifications: Vec::new(),
            };
        }

        match command {
            FirmwareCommand::Aux(request) => CoprocessorOutput {
                reply: Some(self.aux(request)),
                notifications: Vec::new(),
            },
            FirmwareCommand::SetConfig { link, msg_type, .. } => CoprocessorOutput {
                reply: Some(FirmwareReply::ok(Vec::new())),
                notifications: vec![Notification {
                    kind: NotificationKind::SetConfigReply,
                    link: *link,
                    payload: vec![*msg_type],
                }],
            },
            FirmwareCommand::NotifyStreamMask { .. }
            | FirmwareCommand::Trace(_)
            | FirmwareCommand::HwLock { .. } => CoprocessorOutput {
                reply: Some(FirmwareReply::ok(Vec::new())),
                notifications: Vec::new(),
            },
        }
    }
}
