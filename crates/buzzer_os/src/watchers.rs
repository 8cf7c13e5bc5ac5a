#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::ControllerEvent;
use crate::display::StatusDisplay;
use crate::hardware::{BoardLayout, DigitalBoard, HardwareError, Output};
use crate::keypad::{decode_key, KeypadSource};

pub const SWITCH_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DISPLAY_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut t = tokio::time::interval(period);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

/// Samples the confirmation switch and emits one event per edge.
pub async fn watch_confirm_switch(
    board: Arc<dyn DigitalBoard>,
    layout: BoardLayout,
    tx: mpsc::Sender<ControllerEvent>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut tick = ticker(period);
    let mut was_active = false;
    let mut read_failing = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let level = match board.read_input(layout.confirm_switch) {
            Ok(level) => {
                read_failing = false;
                level
            }
            Err(err) => {
                if !read_failing {
                    warn!(error = %err, "confirmation switch unreadable");
                    read_failing = true;
                }
                continue;
            }
        };
        let active = layout.is_active(level);
        if active == was_active {
            continue;
        }
        was_active = active;
        let event = if active {
            ControllerEvent::ConfirmActive
        } else {
            ControllerEvent::ConfirmInactive
        };
        debug!(?event, "confirmation edge");
        if tx.send(event).await.is_err() {
            break;
        }
    }
    debug!("confirmation watcher stopped");
}

/// Switches `output` off whenever its button reads active.
pub async fn watch_output_button(
    board: Arc<dyn DigitalBoard>,
    layout: BoardLayout,
    button: u8,
    output: Arc<Output>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        match board.read_input(button) {
            Ok(level) if layout.is_active(level) && output.is_on() => {
                if let Err(err) = output.off() {
                    warn!(output = output.name(), error = %err, "output could not be switched off");
                }
            }
            Ok(_) => {}
            Err(err) => debug!(button, error = %err, "button unreadable"),
        }
    }
    debug!(output = output.name(), "button watcher stopped");
}

pub async fn refresh_display(
    display: Arc<dyn StatusDisplay>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => display.refresh(Utc::now()),
        }
    }
}

/// Reads the keypad on a dedicated thread. Protocol errors drop the event;
/// any other read failure is fatal and cancels `cancel`.
///
/// The blocking read is not interruptible, so after cancellation the thread
/// exits on the next key press or when the device goes away.
pub fn spawn_keypad_reader(
    mut source: Box<dyn KeypadSource>,
    tx: mpsc::Sender<ControllerEvent>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("keypad-reader".to_string())
        .spawn(move || {
            info!("keypad reader started");
            while !cancel.is_cancelled() {
                match source.next_event() {
                    Ok(raw) => {
                        let Some(key) = decode_key(raw) else {
                            continue;
                        };
                        if cancel.is_cancelled() {
                            break;
                        }
                        if tx.blocking_send(ControllerEvent::from(key)).is_err() {
                            break;
                        }
                    }
                    Err(HardwareError::Protocol(msg)) => {
                        warn!(error = %msg, "malformed keypad event dropped");
                    }
                    Err(err) => {
                        error!(error = %err, "keypad read failed, shutting down");
                        cancel.cancel();
                        break;
                    }
                }
            }
            info!("keypad reader stopped");
        })
}
