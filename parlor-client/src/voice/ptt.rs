//! Push-to-talk control input
//!
//! A control input delivers press/release events for one bound key. The
//! activation controller only sees [`ControlEvent`]s; where they come from
//! (global hotkeys, a UI button, a test) is behind [`ControlInput`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::PttMode;
use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// How long the hotkey thread waits for an event before checking for unbind
const HOTKEY_POLL_INTERVAL_MS: u64 = 10;

// =============================================================================
// PTT State
// =============================================================================

/// Current state of push-to-talk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PttState {
    /// Not transmitting
    #[default]
    Idle,
    /// Key held (hold mode) or toggled on (toggle mode)
    Transmitting,
}

/// Turns raw press/release events into PTT state changes
#[derive(Debug, Clone, Default)]
pub struct PttLatch {
    mode: PttMode,
    active: bool,
}

impl PttLatch {
    pub fn new(mode: PttMode) -> Self {
        Self {
            mode,
            active: false,
        }
    }

    pub fn mode(&self) -> PttMode {
        self.mode
    }

    /// Change the mode; the latch is released
    pub fn set_mode(&mut self, mode: PttMode) {
        self.mode = mode;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Force the latch to a state (e.g. an explicit start/stop request)
    pub fn force(&mut self, active: bool) {
        self.active = active;
    }

    /// Handle a key press
    ///
    /// # Returns
    /// * `Some(PttState)` - State changed, caller should act on it
    /// * `None` - No state change
    pub fn handle_press(&mut self) -> Option<PttState> {
        match self.mode {
            PttMode::Hold => {
                if self.active {
                    return None;
                }
                self.active = true;
                Some(PttState::Transmitting)
            }
            PttMode::Toggle => {
                self.active = !self.active;
                Some(if self.active {
                    PttState::Transmitting
                } else {
                    PttState::Idle
                })
            }
        }
    }

    /// Handle a key release; toggle mode ignores releases
    pub fn handle_release(&mut self) -> Option<PttState> {
        match self.mode {
            PttMode::Hold if self.active => {
                self.active = false;
                Some(PttState::Idle)
            }
            _ => None,
        }
    }
}

// =============================================================================
// Control Input
// =============================================================================

/// Raw event from a bound control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Pressed,
    Released,
}

type Unbind = Box<dyn FnOnce() + Send>;

/// A live key binding
///
/// Events arrive on the receiver returned by [`ControlBinding::take_events`].
/// Dropping the binding unbinds the key.
pub struct ControlBinding {
    events: Option<mpsc::UnboundedReceiver<ControlEvent>>,
    unbind: Option<Unbind>,
}

impl ControlBinding {
    pub fn new(
        events: mpsc::UnboundedReceiver<ControlEvent>,
        unbind: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events: Some(events),
            unbind: Some(Box::new(unbind)),
        }
    }

    /// Take the event receiver; `None` if it was already taken
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ControlEvent>> {
        self.events.take()
    }

    pub fn is_bound(&self) -> bool {
        self.unbind.is_some()
    }

    /// Release the key; later calls do nothing
    pub fn unbind(&mut self) {
        if let Some(unbind) = self.unbind.take() {
            unbind();
        }
    }
}

impl Drop for ControlBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Source of push-to-talk events
pub trait ControlInput: Send + Sync {
    /// Bind `key` (see [`parse_key_code`] for accepted names)
    fn bind(&self, key: &str) -> Result<ControlBinding, VoiceError>;
}

// =============================================================================
// Global Hotkeys
// =============================================================================

/// Push-to-talk through a system-wide hotkey
///
/// Each binding runs its own thread owning a `GlobalHotKeyManager`. The
/// hotkey event receiver is process-wide, so only one binding should be live
/// at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct HotkeyControlInput;

impl ControlInput for HotkeyControlInput {
    fn bind(&self, key: &str) -> Result<ControlBinding, VoiceError> {
        let code = parse_key_code(key).map_err(VoiceError::Config)?;
        let hotkey = HotKey::new(Some(Modifiers::empty()), code);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        std::thread::Builder::new()
            .name("ptt-hotkey".to_string())
            .spawn(move || run_hotkey_thread(hotkey, event_tx, ready_tx, thread_stop))
            .map_err(|e| VoiceError::Device(format!("failed to spawn hotkey thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Device("hotkey thread exited during setup".into()))??;

        debug!(key, "push-to-talk hotkey bound");
        Ok(ControlBinding::new(event_rx, move || {
            stop.store(true, Ordering::SeqCst);
        }))
    }
}

fn run_hotkey_thread(
    hotkey: HotKey,
    events: mpsc::UnboundedSender<ControlEvent>,
    ready: crossbeam_channel::Sender<Result<(), VoiceError>>,
    stop: Arc<AtomicBool>,
) {
    let manager = match GlobalHotKeyManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            let _ = ready.send(Err(VoiceError::Device(format!(
                "failed to initialize hotkey manager: {}",
                e
            ))));
            return;
        }
    };
    if let Err(e) = manager.register(hotkey) {
        let _ = ready.send(Err(VoiceError::Device(format!(
            "failed to register hotkey: {}",
            e
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    let receiver = GlobalHotKeyEvent::receiver();
    let poll = Duration::from_millis(HOTKEY_POLL_INTERVAL_MS);
    while !stop.load(Ordering::SeqCst) && !events.is_closed() {
        match receiver.recv_timeout(poll) {
            Ok(event) if event.id() == hotkey.id() => {
                let control = match event.state() {
                    HotKeyState::Pressed => ControlEvent::Pressed,
                    HotKeyState::Released => ControlEvent::Released,
                };
                if events.send(control).is_err() {
                    break;
                }
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("global hotkey event channel closed");
                break;
            }
        }
    }

    let _ = manager.unregister(hotkey);
    debug!("push-to-talk hotkey unbound");
}

// =============================================================================
// Key Code Parsing
// =============================================================================

/// Accepted spellings per key; the first one is used for display
const KEY_NAMES: &[(&[&str], Code)] = &[
    (&["`", "backquote", "grave"], Code::Backquote),
    (&["-", "minus"], Code::Minus),
    (&["=", "equal"], Code::Equal),
    (&["[", "bracketleft"], Code::BracketLeft),
    (&["]", "bracketright"], Code::BracketRight),
    (&["\\", "backslash"], Code::Backslash),
    (&[";", "semicolon"], Code::Semicolon),
    (&["'", "quote"], Code::Quote),
    (&[",", "comma"], Code::Comma),
    (&[".", "period"], Code::Period),
    (&["/", "slash"], Code::Slash),
    (&["f1"], Code::F1),
    (&["f2"], Code::F2),
    (&["f3"], Code::F3),
    (&["f4"], Code::F4),
    (&["f5"], Code::F5),
    (&["f6"], Code::F6),
    (&["f7"], Code::F7),
    (&["f8"], Code::F8),
    (&["f9"], Code::F9),
    (&["f10"], Code::F10),
    (&["f11"], Code::F11),
    (&["f12"], Code::F12),
    (&["0", "digit0"], Code::Digit0),
    (&["1", "digit1"], Code::Digit1),
    (&["2", "digit2"], Code::Digit2),
    (&["3", "digit3"], Code::Digit3),
    (&["4", "digit4"], Code::Digit4),
    (&["5", "digit5"], Code::Digit5),
    (&["6", "digit6"], Code::Digit6),
    (&["7", "digit7"], Code::Digit7),
    (&["8", "digit8"], Code::Digit8),
    (&["9", "digit9"], Code::Digit9),
    (&["a", "keya"], Code::KeyA),
    (&["b", "keyb"], Code::KeyB),
    (&["c", "keyc"], Code::KeyC),
    (&["d", "keyd"], Code::KeyD),
    (&["e", "keye"], Code::KeyE),
    (&["f", "keyf"], Code::KeyF),
    (&["g", "keyg"], Code::KeyG),
    (&["h", "keyh"], Code::KeyH),
    (&["i", "keyi"], Code::KeyI),
    (&["j", "keyj"], Code::KeyJ),
    (&["k", "keyk"], Code::KeyK),
    (&["l", "keyl"], Code::KeyL),
    (&["m", "keym"], Code::KeyM),
    (&["n", "keyn"], Code::KeyN),
    (&["o", "keyo"], Code::KeyO),
    (&["p", "keyp"], Code::KeyP),
    (&["q", "keyq"], Code::KeyQ),
    (&["r", "keyr"], Code::KeyR),
    (&["s", "keys"], Code::KeyS),
    (&["t", "keyt"], Code::KeyT),
    (&["u", "keyu"], Code::KeyU),
    (&["v", "keyv"], Code::KeyV),
    (&["w", "keyw"], Code::KeyW),
    (&["x", "keyx"], Code::KeyX),
    (&["y", "keyy"], Code::KeyY),
    (&["z", "keyz"], Code::KeyZ),
    (&["space"], Code::Space),
    (&["enter", "return"], Code::Enter),
    (&["tab"], Code::Tab),
    (&["escape", "esc"], Code::Escape),
    (&["backspace"], Code::Backspace),
    (&["delete"], Code::Delete),
    (&["insert"], Code::Insert),
    (&["home"], Code::Home),
    (&["end"], Code::End),
    (&["pageup"], Code::PageUp),
    (&["pagedown"], Code::PageDown),
    (&["up", "arrowup"], Code::ArrowUp),
    (&["down", "arrowdown"], Code::ArrowDown),
    (&["left", "arrowleft"], Code::ArrowLeft),
    (&["right", "arrowright"], Code::ArrowRight),
    (&["numpad0"], Code::Numpad0),
    (&["numpad1"], Code::Numpad1),
    (&["numpad2"], Code::Numpad2),
    (&["numpad3"], Code::Numpad3),
    (&["numpad4"], Code::Numpad4),
    (&["numpad5"], Code::Numpad5),
    (&["numpad6"], Code::Numpad6),
    (&["numpad7"], Code::Numpad7),
    (&["numpad8"], Code::Numpad8),
    (&["numpad9"], Code::Numpad9),
    (&["numpadadd"], Code::NumpadAdd),
    (&["numpadsubtract"], Code::NumpadSubtract),
    (&["numpadmultiply"], Code::NumpadMultiply),
    (&["numpaddivide"], Code::NumpadDivide),
    (&["numpaddecimal"], Code::NumpadDecimal),
    (&["numpadenter"], Code::NumpadEnter),
];

/// Parse a key name (e.g. "`", "F1", "Space", "KeyA"), case-insensitively
pub fn parse_key_code(key: &str) -> Result<Code, String> {
    let lower = key.to_lowercase();
    KEY_NAMES
        .iter()
        .find(|(names, _)| names.contains(&lower.as_str()))
        .map(|(_, code)| *code)
        .ok_or_else(|| format!("Unknown key code: {}", key))
}

/// Canonical name of a bindable key, `None` for keys that can't be bound
pub fn key_name(code: Code) -> Option<&'static str> {
    KEY_NAMES
        .iter()
        .find(|(_, c)| *c == code)
        .and_then(|(names, _)| names.first().copied())
}

// =============================================================================
// Tests
// =============================================================================
