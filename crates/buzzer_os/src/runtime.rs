#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use buzzer_contracts::device::DeviceRegistration;
use buzzer_engines::registry_client::RegistryClient;
use buzzer_engines::sink::FanoutSink;
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::controller::{ControllerEvent, ControllerSink, ReleaseController};
use crate::display::{self, ConsoleDisplay, StatusDisplay};
use crate::hardware::{BoardLayout, DigitalBoard, HardwareError, OutputPair, SysfsGpioBoard};
use crate::keypad::{EvdevKeypad, KeypadSource};
use crate::registry::{ReleaseRegistry, RemoteRegistry};
use crate::sync::{default_device_name, local_addresses, RegistryPoller, SyncClient, SyncSummary};
use crate::watchers::{
    refresh_display, spawn_keypad_reader, watch_confirm_switch, watch_output_button,
    DISPLAY_REFRESH_INTERVAL, SWITCH_POLL_INTERVAL,
};

pub const CONTROLLER_QUEUE_CAPACITY: usize = 64;

const SYS_INPUT_ROOT: &str = "/sys/class/input";
const DEV_INPUT_ROOT: &str = "/dev/input";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("could not start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything a buzzer box needs, already opened.
pub struct DeviceParts<R: ReleaseRegistry, P: RegistryPoller> {
    pub registry: R,
    pub poller: Arc<P>,
    pub board: Arc<dyn DigitalBoard>,
    pub layout: BoardLayout,
    pub keypad: Box<dyn KeypadSource>,
    pub display: Arc<dyn StatusDisplay>,
    pub identity: DeviceRegistration,
    pub check_interval: Duration,
    pub display_tz: Tz,
    pub switch_poll: Duration,
}

impl DeviceParts<RemoteRegistry, RegistryClient> {
    /// Opens the real hardware described by `config`. Any failure here is a
    /// hardware-initialization failure and fatal for the process.
    pub fn open(config: &DeviceConfig) -> Result<Self, HardwareError> {
        let board = SysfsGpioBoard::open(&config.gpio_base, &config.layout)?;
        let keypad_path = config
            .keypad
            .resolve(Path::new(SYS_INPUT_ROOT), Path::new(DEV_INPUT_ROOT))?;
        let keypad = EvdevKeypad::open(keypad_path)?;
        let client = RegistryClient::new(config.registry.clone());
        let identity = DeviceRegistration::v1(
            default_device_name(config.device_name.as_deref()),
            local_addresses(),
        );
        Ok(Self {
            registry: RemoteRegistry::new(client.clone()),
            poller: Arc::new(client),
            board: Arc::new(board),
            layout: config.layout,
            keypad: Box::new(keypad),
            display: Arc::new(ConsoleDisplay::new(std::io::stdout(), config.display_tz)),
            identity,
            check_interval: config.check_interval,
            display_tz: config.display_tz,
            switch_poll: SWITCH_POLL_INTERVAL,
        })
    }
}

/// Running buzzer box: sync loop, watchers, keypad thread and the controller,
/// all tied to one cancellation token.
pub struct DeviceRuntime {
    cancel: CancellationToken,
    outputs: OutputPair,
    tasks: Vec<JoinHandle<()>>,
    sync: JoinHandle<SyncSummary>,
    controller: JoinHandle<()>,
}

impl DeviceRuntime {
    /// Spawns every task. Must be called inside a tokio runtime.
    pub fn start<R, P>(parts: DeviceParts<R, P>, cancel: CancellationToken) -> Result<Self, RuntimeError>
    where
        R: ReleaseRegistry + 'static,
        P: RegistryPoller,
    {
        let DeviceParts {
            registry,
            poller,
            board,
            layout,
            keypad,
            display,
            identity,
            check_interval,
            display_tz,
            switch_poll,
        } = parts;

        let outputs = OutputPair::from_layout(board.clone(), &layout);
        outputs.all_off();
        display.show_status(&display::status_text(&identity.ip));
        display.show_keypad(&display::keypad_text(""));

        let (tx, rx) = mpsc::channel(CONTROLLER_QUEUE_CAPACITY);

        spawn_keypad_reader(keypad, tx.clone(), cancel.clone())?;

        let controller = ReleaseController::new(registry, outputs.clone(), display.clone(), display_tz);
        let controller = tokio::task::spawn_blocking(move || controller.run_blocking(rx));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(watch_confirm_switch(
            board.clone(),
            layout,
            tx.clone(),
            cancel.clone(),
            switch_poll,
        )));
        for (button, output) in [
            (layout.light_button, outputs.light.clone()),
            (layout.horn_button, outputs.horn.clone()),
        ] {
            tasks.push(tokio::spawn(watch_output_button(
                board.clone(),
                layout,
                button,
                output,
                cancel.clone(),
                switch_poll,
            )));
        }
        tasks.push(tokio::spawn(refresh_display(
            display.clone(),
            cancel.clone(),
            DISPLAY_REFRESH_INTERVAL,
        )));

        let shutdown_tx = tx.clone();
        let shutdown_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            shutdown_cancel.cancelled().await;
            if shutdown_tx.send(ControllerEvent::Shutdown).await.is_err() {
                warn!("controller already gone at shutdown");
            }
        }));

        let sink = FanoutSink::new().with(Box::new(ControllerSink::new(tx)));
        let sync = SyncClient::new(poller, check_interval, identity.clone());
        let sync = tokio::spawn(sync.run(Box::new(sink), cancel.clone()));

        info!(device = %identity.name, ip = %identity.ip, "buzzer device running");
        Ok(Self {
            cancel,
            outputs,
            tasks,
            sync,
            controller,
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn outputs(&self) -> &OutputPair {
        &self.outputs
    }

    /// Waits for cancellation (signal or fatal keypad failure) and then
    /// tears everything down.
    pub async fn wait(self) -> SyncSummary {
        self.cancel.cancelled().await;
        self.shutdown().await
    }

    /// Cancels, then waits for the sync loop, the watchers and the controller.
    /// Outputs are off when this returns.
    pub async fn shutdown(self) -> SyncSummary {
        self.cancel.cancel();
        let summary = match self.sync.await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "sync loop ended abnormally");
                SyncSummary::default()
            }
        };
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "watcher ended abnormally");
            }
        }
        if let Err(err) = self.controller.await {
            warn!(error = %err, "controller ended abnormally");
        }
        self.outputs.all_off();
        info!("buzzer device stopped");
        summary
    }
}
