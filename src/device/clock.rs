// src/device/clock.rs
//! Interrupt clock: a thread standing in for the display's timing
//! interrupts.
//!
//! Every period it raises a vertical update for each lit variable-refresh
//! stream and a vertical blank for every other stream of the LIVE
//! container. It stops when the device powers off or is dropped.

use super::Device;
use anyhow::{Context, Result};
use log::{debug, error, info};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug)]
pub enum ClockCommand {
    SetPeriod(Duration),
}

pub struct IrqClock {
    thread_handle: Option<JoinHandle<()>>,
    control_tx: Option<Sender<ClockCommand>>,
}

impl IrqClock {
    pub fn spawn(device: &Arc<Device>, period: Duration) -> Result<Self> {
        let (control_tx, control_rx) = mpsc::channel();
        let device = Arc::downgrade(device);

        let thread_handle = thread::Builder::new()
            .name("vupdate-clock".to_string())
            .spawn(move || run_clock_loop(device, control_rx, period))
            .context("Failed to spawn interrupt clock thread")?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            control_tx: Some(control_tx),
        })
    }

    pub fn set_period(&self, period: Duration) -> Result<()> {
        self.control_tx
            .as_ref()
            .context("Interrupt clock already stopped")?
            .send(ClockCommand::SetPeriod(period))
            .context("Failed to send SetPeriod command")
    }
}

impl Drop for IrqClock {
    fn drop(&mut self) {
        // Disconnecting the control channel wakes the loop immediately.
        self.control_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                error!("IrqClock: thread panicked: {:?}", e);
            }
        }
    }
}

fn run_clock_loop(device: Weak<Device>, control_rx: Receiver<ClockCommand>, mut period: Duration) {
    info!("IrqClock: started (period {:?})", period);
    loop {
        match control_rx.recv_timeout(period.max(Duration::from_micros(100))) {
            Ok(ClockCommand::SetPeriod(new_period)) => {
                debug!("IrqClock: period changed to {:?}", new_period);
                period = new_period;
            }
            Err(RecvTimeoutError::Timeout) => {
                let Some(device) = device.upgrade() else {
                    debug!("IrqClock: device dropped, exiting");
                    break;
                };
                let Ok(streams) = device.with_current(|state| {
                    state
                        .streams()
                        .iter()
                        .map(|s| (s.id(), s.vrr_active()))
                        .collect::<Vec<_>>()
                }) else {
                    info!("IrqClock: device powered off, exiting");
                    break;
                };
                for (id, vrr_active) in streams {
                    if vrr_active {
                        device.on_vupdate(id);
                    } else {
                        device.on_vblank(id);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("IrqClock: control channel closed, exiting");
                break;
            }
        }
    }
    debug!("IrqClock: thread exiting");
}
