#![forbid(unsafe_code)]

use std::sync::Arc;

use buzzer_contracts::pitch::{Pitch, PitchId, PITCH_ID_MAX_LEN};
use buzzer_engines::sink::{PitchSink, SinkError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::display::{self, StatusDisplay};
use crate::hardware::OutputPair;
use crate::keypad::KeypadEvent;
use crate::registry::{RegistryError, ReleaseRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Digit(char),
    Enter,
    ConfirmActive,
    ConfirmInactive,
    NextPitch(Pitch),
    Shutdown,
}

impl From<KeypadEvent> for ControllerEvent {
    fn from(ev: KeypadEvent) -> Self {
        match ev {
            KeypadEvent::Digit(d) => ControllerEvent::Digit(d),
            KeypadEvent::Enter => ControllerEvent::Enter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Idle,
    CodeEntered,
    Authorizing,
    Armed,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSession {
    pub entered_code: String,
    pub target_id: Option<PitchId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ignored,
    Accumulated,
    Armed(PitchId),
    Rejected(String),
    ConfirmPressed,
    Released {
        id: PitchId,
        conflict: Option<RegistryError>,
    },
    Announced(PitchId),
    Stopped,
}

/// Result of handling one event: every state entered along the way, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStep {
    pub transitions: Vec<ReleaseState>,
    pub outcome: StepOutcome,
}

impl ControllerStep {
    fn stay(outcome: StepOutcome) -> Self {
        Self {
            transitions: Vec::new(),
            outcome,
        }
    }
}

/// Keypad + confirmation switch state machine.
///
/// A release needs a code that names an unreleased pitch (authorization) and
/// a full press-and-let-go of the confirmation switch while armed. The
/// registry is asked to release only at confirmation time.
pub struct ReleaseController<R: ReleaseRegistry> {
    registry: R,
    outputs: OutputPair,
    display: Arc<dyn StatusDisplay>,
    display_tz: Tz,
    state: ReleaseState,
    pending_code: String,
    session: Option<ReleaseSession>,
    confirm_seen_active: bool,
    announced: Option<PitchId>,
    stopped: bool,
}

impl<R: ReleaseRegistry> ReleaseController<R> {
    pub fn new(
        registry: R,
        outputs: OutputPair,
        display: Arc<dyn StatusDisplay>,
        display_tz: Tz,
    ) -> Self {
        Self {
            registry,
            outputs,
            display,
            display_tz,
            state: ReleaseState::Idle,
            pending_code: String::new(),
            session: None,
            confirm_seen_active: false,
            announced: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> ReleaseState {
        self.state
    }

    pub fn session(&self) -> Option<&ReleaseSession> {
        self.session.as_ref()
    }

    pub fn pending_code(&self) -> &str {
        &self.pending_code
    }

    pub fn announced(&self) -> Option<&PitchId> {
        self.announced.as_ref()
    }

    pub fn handle(&mut self, event: ControllerEvent, now: DateTime<Utc>) -> ControllerStep {
        if self.stopped {
            return ControllerStep::stay(StepOutcome::Ignored);
        }
        match event {
            ControllerEvent::Digit(d) => self.on_digit(d),
            ControllerEvent::Enter => self.on_enter(),
            ControllerEvent::ConfirmActive => self.on_confirm_active(),
            ControllerEvent::ConfirmInactive => self.on_confirm_inactive(now),
            ControllerEvent::NextPitch(pitch) => self.on_next_pitch(pitch),
            ControllerEvent::Shutdown => self.shutdown(),
        }
    }

    /// Consumes events until `Shutdown` or until every sender is gone. Must
    /// run on a thread where blocking is allowed.
    pub fn run_blocking(mut self, mut rx: mpsc::Receiver<ControllerEvent>) {
        info!("release controller started");
        while let Some(event) = rx.blocking_recv() {
            let step = self.handle(event, Utc::now());
            debug!(transitions = ?step.transitions, outcome = ?step.outcome, "controller step");
            if step.outcome == StepOutcome::Stopped {
                break;
            }
        }
        if !self.stopped {
            self.shutdown();
        }
        info!("release controller stopped");
    }

    fn enter_state(&mut self, state: ReleaseState, transitions: &mut Vec<ReleaseState>) {
        self.state = state;
        transitions.push(state);
    }

    fn on_digit(&mut self, digit: char) -> ControllerStep {
        let mut transitions = Vec::new();
        match self.state {
            ReleaseState::Armed => {
                debug!(digit = %digit, "digit dropped while armed");
                return ControllerStep::stay(StepOutcome::Ignored);
            }
            ReleaseState::Released => {
                self.session = None;
                self.pending_code.clear();
                self.enter_state(ReleaseState::Idle, &mut transitions);
            }
            _ => {}
        }
        if self.pending_code.len() >= PITCH_ID_MAX_LEN {
            return ControllerStep {
                transitions,
                outcome: StepOutcome::Ignored,
            };
        }
        self.pending_code.push(digit);
        self.display.show_keypad(&display::keypad_text(&self.pending_code));
        ControllerStep {
            transitions,
            outcome: StepOutcome::Accumulated,
        }
    }

    fn on_enter(&mut self) -> ControllerStep {
        match self.state {
            ReleaseState::Armed => {
                let target = self
                    .session
                    .as_ref()
                    .and_then(|s| s.target_id.as_ref())
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                warn!(target = %target, "enter rejected while armed");
                return ControllerStep::stay(StepOutcome::Rejected(format!(
                    "pitch {target} is armed, press the buzzer"
                )));
            }
            ReleaseState::Released => return ControllerStep::stay(StepOutcome::Ignored),
            _ => {}
        }

        let mut transitions = Vec::new();
        let code = std::mem::take(&mut self.pending_code);
        self.session = Some(ReleaseSession {
            entered_code: code.clone(),
            target_id: None,
        });
        self.enter_state(ReleaseState::CodeEntered, &mut transitions);
        self.enter_state(ReleaseState::Authorizing, &mut transitions);

        match self.authorize(&code) {
            Ok(id) => {
                if let Some(session) = self.session.as_mut() {
                    session.target_id = Some(id.clone());
                }
                self.confirm_seen_active = false;
                self.enter_state(ReleaseState::Armed, &mut transitions);
                self.display.show_keypad(display::ARMED_TEXT);
                info!(pitch = %id, "release armed");
                ControllerStep {
                    transitions,
                    outcome: StepOutcome::Armed(id),
                }
            }
            Err(message) => {
                self.session = None;
                self.enter_state(ReleaseState::Idle, &mut transitions);
                self.display.show_keypad(&display::error_text(&message));
                warn!(code = %code, error = %message, "pitch code rejected");
                ControllerStep {
                    transitions,
                    outcome: StepOutcome::Rejected(message),
                }
            }
        }
    }

    fn authorize(&self, code: &str) -> Result<PitchId, String> {
        if code.is_empty() {
            return Err("no pitch code entered".to_string());
        }
        let id = PitchId::new(code).map_err(|err| err.to_string())?;
        if let Some(announced) = &self.announced {
            if announced != &id {
                info!(code = %id, announced = %announced, "code differs from announced pitch");
            }
        }
        let pitch = self.registry.lookup(&id).map_err(|err| err.to_string())?;
        if pitch.is_released() {
            return Err(RegistryError::AlreadyReleased(id.to_string()).to_string());
        }
        Ok(id)
    }

    fn on_confirm_active(&mut self) -> ControllerStep {
        if self.state != ReleaseState::Armed {
            return ControllerStep::stay(StepOutcome::Ignored);
        }
        self.confirm_seen_active = true;
        ControllerStep::stay(StepOutcome::ConfirmPressed)
    }

    fn on_confirm_inactive(&mut self, now: DateTime<Utc>) -> ControllerStep {
        if self.state != ReleaseState::Armed || !self.confirm_seen_active {
            return ControllerStep::stay(StepOutcome::Ignored);
        }
        self.confirm_seen_active = false;
        let Some(id) = self.session.as_ref().and_then(|s| s.target_id.clone()) else {
            warn!("armed without a target, dropping back to idle");
            self.state = ReleaseState::Idle;
            return ControllerStep {
                transitions: vec![ReleaseState::Idle],
                outcome: StepOutcome::Ignored,
            };
        };

        let conflict = match self.registry.release(&id) {
            Ok(_) => None,
            Err(err) => {
                warn!(pitch = %id, error = %err, "registry release failed, actuating anyway");
                Some(err)
            }
        };
        self.outputs.all_on();
        let text = match &conflict {
            None => display::released_text(now, &id, self.display_tz),
            Some(err) => display::error_text(err),
        };
        self.display.show_keypad(&text);
        info!(pitch = %id, "pitch released");

        let mut transitions = Vec::new();
        self.enter_state(ReleaseState::Released, &mut transitions);
        ControllerStep {
            transitions,
            outcome: StepOutcome::Released { id, conflict },
        }
    }

    fn on_next_pitch(&mut self, pitch: Pitch) -> ControllerStep {
        self.display.show_pitch(&pitch);
        let id = pitch.id;
        self.announced = Some(id.clone());
        ControllerStep::stay(StepOutcome::Announced(id))
    }

    fn shutdown(&mut self) -> ControllerStep {
        self.stopped = true;
        self.pending_code.clear();
        self.session = None;
        self.outputs.all_off();
        let mut transitions = Vec::new();
        if self.state != ReleaseState::Idle {
            self.enter_state(ReleaseState::Idle, &mut transitions);
        }
        ControllerStep {
            transitions,
            outcome: StepOutcome::Stopped,
        }
    }
}

/// Forwards announced pitches from the sync loop into the controller queue.
#[derive(Debug, Clone)]
pub struct ControllerSink {
    tx: mpsc::Sender<ControllerEvent>,
}

impl ControllerSink {
    pub fn new(tx: mpsc::Sender<ControllerEvent>) -> Self {
        Self { tx }
    }
}

impl PitchSink for ControllerSink {
    fn update(&mut self, pitch: &Pitch) -> Result<(), SinkError> {
        match self.tx.try_send(ControllerEvent::NextPitch(pitch.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Busy),
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::ConsoleDisplay;
    use crate::hardware::{BoardLayout, MemoryBoard};
    use buzzer_contracts::pitch::{PitchDraft, DEFAULT_DISPLAY_TZ};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistry {
        pitches: Mutex<BTreeMap<String, Pitch>>,
        lookups: AtomicUsize,
        releases: AtomicUsize,
        offline: bool,
    }

    impl FakeRegistry {
        fn with(ids: &[&str]) -> Arc<Self> {
            let reg = Self::default();
            let now = Utc::now();
            for id in ids {
                let p = Pitch::from_draft(
                    PitchId::new(*id).unwrap(),
                    PitchDraft::v1("Ada", "Engines", now + chrono::Duration::hours(1)),
                    now,
                );
                reg.pitches.lock().unwrap().insert(id.to_string(), p);
            }
            Arc::new(reg)
        }
    }

    impl ReleaseRegistry for Arc<FakeRegistry> {
        fn lookup(&self, id: &PitchId) -> Result<Pitch, RegistryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(RegistryError::Unavailable("connection refused".into()));
            }
            self.pitches
                .lock()
                .unwrap()
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))
        }

        fn release(&self, id: &PitchId) -> Result<Pitch, RegistryError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            let mut pitches = self.pitches.lock().unwrap();
            let p = pitches
                .get_mut(id.as_str())
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if p.is_released() {
                return Err(RegistryError::AlreadyReleased(id.to_string()));
            }
            p.released_at = Some(Utc::now());
            Ok(p.clone())
        }
    }

    struct Rig {
        registry: Arc<FakeRegistry>,
        board: Arc<MemoryBoard>,
        display: Arc<ConsoleDisplay<Vec<u8>>>,
        controller: ReleaseController<Arc<FakeRegistry>>,
    }

    fn rig(registry: Arc<FakeRegistry>) -> Rig {
        let board = Arc::new(MemoryBoard::new());
        let outputs = OutputPair::from_layout(board.clone(), &BoardLayout::default());
        let display = Arc::new(ConsoleDisplay::new(Vec::new(), DEFAULT_DISPLAY_TZ));
        let controller = ReleaseController::new(
            registry.clone(),
            outputs,
            display.clone(),
            DEFAULT_DISPLAY_TZ,
        );
        Rig {
            registry,
            board,
            display,
            controller,
        }
    }

    fn type_code(c: &mut ReleaseController<Arc<FakeRegistry>>, code: &str) -> ControllerStep {
        for d in code.chars() {
            c.handle(ControllerEvent::Digit(d), Utc::now());
        }
        c.handle(ControllerEvent::Enter, Utc::now())
    }

    fn lights_and_horn_on(board: &MemoryBoard) -> bool {
        let layout = BoardLayout::default();
        board.output(layout.light_relay) && board.output(layout.horn_relay)
    }

    #[test]
    fn at_ctrl_01_unknown_code_returns_to_idle_with_error() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        let step = type_code(&mut r.controller, "999999");
        assert_eq!(
            step.transitions,
            vec![
                ReleaseState::CodeEntered,
                ReleaseState::Authorizing,
                ReleaseState::Idle
            ]
        );
        assert!(matches!(step.outcome, StepOutcome::Rejected(_)));
        assert_eq!(r.controller.state(), ReleaseState::Idle);
        assert!(r.display.state().keypad.starts_with("ERROR: "));
        assert_eq!(r.registry.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn at_ctrl_02_valid_code_arms_without_releasing() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        let step = type_code(&mut r.controller, "202401");
        assert_eq!(
            step.transitions,
            vec![
                ReleaseState::CodeEntered,
                ReleaseState::Authorizing,
                ReleaseState::Armed
            ]
        );
        assert_eq!(
            step.outcome,
            StepOutcome::Armed(PitchId::new("202401").unwrap())
        );
        assert_eq!(r.display.state().keypad, display::ARMED_TEXT);
        assert_eq!(r.registry.releases.load(Ordering::SeqCst), 0);
        assert!(!lights_and_horn_on(&r.board));
    }

    #[test]
    fn at_ctrl_03_confirm_press_and_release_fires_exactly_once() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        type_code(&mut r.controller, "202401");
        let now = Utc::now();
        assert_eq!(
            r.controller.handle(ControllerEvent::ConfirmActive, now).outcome,
            StepOutcome::ConfirmPressed
        );
        let step = r.controller.handle(ControllerEvent::ConfirmInactive, now);
        assert_eq!(step.transitions, vec![ReleaseState::Released]);
        assert_eq!(
            step.outcome,
            StepOutcome::Released {
                id: PitchId::new("202401").unwrap(),
                conflict: None
            }
        );
        assert!(lights_and_horn_on(&r.board));
        assert!(r.display.state().keypad.ends_with(" - Pitch 202401 released"));

        // A second press after release does nothing.
        r.controller.handle(ControllerEvent::ConfirmActive, now);
        r.controller.handle(ControllerEvent::ConfirmInactive, now);
        assert_eq!(r.registry.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_ctrl_04_enter_while_armed_is_rejected_and_keeps_target() {
        let mut r = rig(FakeRegistry::with(&["202401", "202402"]));
        type_code(&mut r.controller, "202401");
        let lookups = r.registry.lookups.load(Ordering::SeqCst);
        let step = type_code(&mut r.controller, "202402");
        assert!(matches!(step.outcome, StepOutcome::Rejected(_)));
        assert_eq!(r.controller.state(), ReleaseState::Armed);
        assert_eq!(
            r.controller.session().and_then(|s| s.target_id.clone()),
            Some(PitchId::new("202401").unwrap())
        );
        assert_eq!(r.controller.pending_code(), "");
        assert_eq!(r.registry.lookups.load(Ordering::SeqCst), lookups);
    }

    #[test]
    fn at_ctrl_05_confirm_edges_outside_armed_are_ignored() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        let now = Utc::now();
        for ev in [ControllerEvent::ConfirmActive, ControllerEvent::ConfirmInactive] {
            assert_eq!(r.controller.handle(ev, now).outcome, StepOutcome::Ignored);
        }
        // Inactive without a preceding active edge is not a confirmation.
        type_code(&mut r.controller, "202401");
        assert_eq!(
            r.controller
                .handle(ControllerEvent::ConfirmInactive, now)
                .outcome,
            StepOutcome::Ignored
        );
        assert_eq!(r.registry.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn at_ctrl_06_already_released_code_is_not_armed() {
        let reg = FakeRegistry::with(&["202401"]);
        reg.pitches
            .lock()
            .unwrap()
            .get_mut("202401")
            .unwrap()
            .released_at = Some(Utc::now());
        let mut r = rig(reg);
        let step = type_code(&mut r.controller, "202401");
        assert_eq!(
            step.outcome,
            StepOutcome::Rejected("pitch with id 202401 already released".to_string())
        );
        assert_eq!(r.controller.state(), ReleaseState::Idle);
    }

    #[test]
    fn at_ctrl_07_conflict_at_confirmation_still_actuates() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        type_code(&mut r.controller, "202401");
        // Someone else releases it between arming and confirmation.
        r.registry
            .release(&PitchId::new("202401").unwrap())
            .unwrap();
        let now = Utc::now();
        r.controller.handle(ControllerEvent::ConfirmActive, now);
        let step = r.controller.handle(ControllerEvent::ConfirmInactive, now);
        assert!(matches!(
            step.outcome,
            StepOutcome::Released {
                conflict: Some(RegistryError::AlreadyReleased(_)),
                ..
            }
        ));
        assert!(lights_and_horn_on(&r.board));
        assert!(r.display.state().keypad.starts_with("ERROR: "));
    }

    #[test]
    fn at_ctrl_08_digit_after_release_starts_over() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        type_code(&mut r.controller, "202401");
        let now = Utc::now();
        r.controller.handle(ControllerEvent::ConfirmActive, now);
        r.controller.handle(ControllerEvent::ConfirmInactive, now);
        let step = r.controller.handle(ControllerEvent::Digit('7'), now);
        assert_eq!(step.transitions, vec![ReleaseState::Idle]);
        assert_eq!(r.controller.pending_code(), "7");
        assert!(r.controller.session().is_none());
    }

    #[test]
    fn at_ctrl_09_digits_dropped_while_armed() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        type_code(&mut r.controller, "202401");
        let step = r.controller.handle(ControllerEvent::Digit('5'), Utc::now());
        assert_eq!(step.outcome, StepOutcome::Ignored);
        assert_eq!(r.controller.pending_code(), "");
    }

    #[test]
    fn at_ctrl_10_registry_outage_and_empty_code_are_rejections() {
        let offline = Arc::new(FakeRegistry {
            offline: true,
            ..FakeRegistry::default()
        });
        let mut r = rig(offline);
        assert!(matches!(
            type_code(&mut r.controller, "202401").outcome,
            StepOutcome::Rejected(msg) if msg.contains("unavailable")
        ));
        assert!(matches!(
            type_code(&mut r.controller, "").outcome,
            StepOutcome::Rejected(_)
        ));
        assert_eq!(r.registry.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_ctrl_11_shutdown_drives_outputs_off_and_stops() {
        let mut r = rig(FakeRegistry::with(&["202401"]));
        type_code(&mut r.controller, "202401");
        let now = Utc::now();
        r.controller.handle(ControllerEvent::ConfirmActive, now);
        r.controller.handle(ControllerEvent::ConfirmInactive, now);
        assert!(lights_and_horn_on(&r.board));

        let step = r.controller.handle(ControllerEvent::Shutdown, now);
        assert_eq!(step.outcome, StepOutcome::Stopped);
        assert!(!r.board.output(BoardLayout::default().light_relay));
        assert!(!r.board.output(BoardLayout::default().horn_relay));
        assert_eq!(
            r.controller.handle(ControllerEvent::Digit('1'), now).outcome,
            StepOutcome::Ignored
        );
    }

    #[test]
    fn at_ctrl_12_next_pitch_updates_display_and_sink_forwards() {
        let mut r = rig(FakeRegistry::with(&[]));
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ControllerSink::new(tx);
        let now = Utc::now();
        let pitch = Pitch::from_draft(
            PitchId::new("202401").unwrap(),
            PitchDraft::v1("Ada", "Engines", now),
            now,
        );
        sink.update(&pitch).unwrap();
        assert!(matches!(sink.update(&pitch), Err(SinkError::Busy)));
        let event = rx.try_recv().unwrap();
        let step = r.controller.handle(event, now);
        assert_eq!(
            step.outcome,
            StepOutcome::Announced(PitchId::new("202401").unwrap())
        );
        assert!(r.display.state().pitch_line.starts_with("Ada - Engines"));
        drop(rx);
        assert!(matches!(sink.update(&pitch), Err(SinkError::Closed)));
    }

    #[test]
    fn at_ctrl_13_run_blocking_stops_when_senders_drop() {
        let r = rig(FakeRegistry::with(&["202401"]));
        let board = r.board.clone();
        let registry = r.registry.clone();
        let (tx, rx) = mpsc::channel(16);
        for ev in [
            ControllerEvent::Digit('2'),
            ControllerEvent::Digit('0'),
            ControllerEvent::Digit('2'),
            ControllerEvent::Digit('4'),
            ControllerEvent::Digit('0'),
            ControllerEvent::Digit('1'),
            ControllerEvent::Enter,
            ControllerEvent::ConfirmActive,
            ControllerEvent::ConfirmInactive,
        ] {
            tx.try_send(ev).unwrap();
        }
        drop(tx);
        r.controller.run_blocking(rx);
        assert_eq!(registry.releases.load(Ordering::SeqCst), 1);
        // Outputs are driven off on the way out.
        assert!(!board.output(BoardLayout::default().light_relay));
    }
}
