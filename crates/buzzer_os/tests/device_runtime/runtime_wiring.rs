#![forbid(unsafe_code)]

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buzzer_contracts::device::DeviceRegistration;
use buzzer_contracts::pitch::{NextPitchSnapshot, PitchDraft, DEFAULT_DISPLAY_TZ};
use buzzer_engines::registry_client::RegistryClientError;
use buzzer_os::display::{ConsoleDisplay, ARMED_TEXT};
use buzzer_os::hardware::{BoardLayout, HardwareError, MemoryBoard};
use buzzer_os::keypad::{scancode_for_digit, KeypadSource, RawInputEvent, EV_KEY, KEY_KPENTER};
use buzzer_os::registry::LocalRegistry;
use buzzer_os::sync::RegistryPoller;
use buzzer_os::{DeviceParts, DeviceRuntime};
use buzzer_storage::PitchStore;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

struct ChannelKeypad(std_mpsc::Receiver<RawInputEvent>);

impl KeypadSource for ChannelKeypad {
    fn next_event(&mut self) -> Result<RawInputEvent, HardwareError> {
        self.0.recv().map_err(|_| {
            HardwareError::Device(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "keypad unplugged",
            ))
        })
    }
}

struct StorePoller {
    store: Arc<PitchStore>,
    registrations: Mutex<Vec<DeviceRegistration>>,
}

impl RegistryPoller for StorePoller {
    fn fetch_next(&self) -> Result<NextPitchSnapshot, RegistryClientError> {
        Ok(self
            .store
            .next(Utc::now())
            .map(NextPitchSnapshot::of)
            .unwrap_or_default())
    }

    fn register(&self, registration: &DeviceRegistration) -> Result<(), RegistryClientError> {
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(())
    }
}

fn key(code: u16) -> RawInputEvent {
    RawInputEvent {
        kind: EV_KEY,
        code,
        value: 1,
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_device_db_01_keypad_code_and_confirmation_release_the_pitch() {
    let store = Arc::new(PitchStore::new_in_memory());
    let now = Utc::now();
    let pitch = store
        .add(
            PitchDraft::v1("Ada", "Engines", now + chrono::Duration::hours(2)),
            now,
        )
        .unwrap();
    let code = pitch.id.to_string();

    let board = Arc::new(MemoryBoard::new());
    let layout = BoardLayout::default();
    let display = Arc::new(ConsoleDisplay::new(std::io::sink(), DEFAULT_DISPLAY_TZ));
    let poller = Arc::new(StorePoller {
        store: store.clone(),
        registrations: Mutex::new(Vec::new()),
    });
    let (keys, key_rx) = std_mpsc::channel();

    let runtime = DeviceRuntime::start(
        DeviceParts {
            registry: LocalRegistry::new(store.clone()),
            poller: poller.clone(),
            board: board.clone(),
            layout,
            keypad: Box::new(ChannelKeypad(key_rx)),
            display: display.clone(),
            identity: DeviceRegistration::v1("hall-a", "10.0.0.2"),
            check_interval: Duration::from_millis(10),
            display_tz: DEFAULT_DISPLAY_TZ,
            switch_poll: Duration::from_millis(5),
        },
        CancellationToken::new(),
    )
    .unwrap();

    wait_until("announcement", || {
        display.state().pitch_line.starts_with("Ada - Engines - ")
    })
    .await;
    assert_eq!(display.state().status, "IP: 10.0.0.2");

    for c in code.chars() {
        keys.send(key(scancode_for_digit(c).unwrap())).unwrap();
    }
    keys.send(key(KEY_KPENTER)).unwrap();
    wait_until("arming", || display.state().keypad == ARMED_TEXT).await;
    assert!(!store.get(&pitch.id).unwrap().is_released());

    board.set_input(layout.confirm_switch, false);
    tokio::time::sleep(Duration::from_millis(30)).await;
    board.set_input(layout.confirm_switch, true);
    wait_until("release", || store.get(&pitch.id).unwrap().is_released()).await;
    wait_until("outputs on", || runtime.outputs().both_on()).await;
    assert!(board.output(layout.light_relay) && board.output(layout.horn_relay));

    board.set_input(layout.light_button, false);
    wait_until("light off", || !runtime.outputs().light.is_on()).await;
    assert!(runtime.outputs().horn.is_on());

    let summary = runtime.shutdown().await;
    assert_eq!(summary.updates, 1);
    assert!(!board.output(layout.horn_relay));
    assert!(!poller.registrations.lock().unwrap().is_empty());
    drop(keys);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_device_db_02_keypad_loss_cancels_the_runtime() {
    let store = Arc::new(PitchStore::new_in_memory());
    let board = Arc::new(MemoryBoard::new());
    let (keys, key_rx) = std_mpsc::channel::<RawInputEvent>();
    let cancel = CancellationToken::new();
    let runtime = DeviceRuntime::start(
        DeviceParts {
            registry: LocalRegistry::new(store.clone()),
            poller: Arc::new(StorePoller {
                store,
                registrations: Mutex::new(Vec::new()),
            }),
            board,
            layout: BoardLayout::default(),
            keypad: Box::new(ChannelKeypad(key_rx)),
            display: Arc::new(ConsoleDisplay::new(std::io::sink(), DEFAULT_DISPLAY_TZ)),
            identity: DeviceRegistration::v1("hall-b", "unknown"),
            check_interval: Duration::from_millis(10),
            display_tz: DEFAULT_DISPLAY_TZ,
            switch_poll: Duration::from_millis(5),
        },
        cancel.clone(),
    )
    .unwrap();

    drop(keys);
    tokio::time::timeout(Duration::from_secs(2), runtime.wait())
        .await
        .unwrap();
    assert!(cancel.is_cancelled());
}
