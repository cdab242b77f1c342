//! Session state machine for the secure link.
//!
//! # Architecture: Action-Based State Machine
//!
//! The session owns the preshared key, the nonce, the operating mode and the
//! input buffer. It performs no I/O: every entry point returns the
//! [`SessionAction`]s the driver must carry out (print to the console, change
//! the mesh address, hand a frame to the mesh).
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  start   ┌───────────────┐  '1' / '2'  ┌───────────┐
//! │ Initial │─────────>│ ModeSelection │────────────>│ Operating │
//! └─────────┘          └───────────────┘             └───────────┘
//!                              ^                           │
//!                              │  'M' with empty buffer,   │
//!                              │  or undefined mode on tick│
//!                              └───────────────────────────┘
//! ```
//!
//! Nothing here is fatal: bad input and bad frames are reported on the
//! console and the state machine stays where it is.

use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::envelope::{decode_inbound, encode_outbound};
use crate::keystore::{KeyLoad, KeyStore, PresharedKey};
use crate::nonce::Nonce;
use crate::storage::PersistentStore;
use crate::transport::{ConfirmStatus, DataRequest};
use crate::types::{is_line_end, is_printable, LinkError, PskState, Result};

const SENDER_PROMPT: &str = "\r\nEnter message to encrypt (or 'M' to change mode): ";
const LISTENER_PROMPT: &str = "\r\nListening for messages... (Press 'M' to change mode)\r\n";

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write this text to the console
    Print(String),
    /// Change the local mesh address
    SetAddress(u16),
    /// Hand this frame to the mesh
    Send(DataRequest),
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Key not loaded yet
    Initial,
    /// Waiting for '1' (sender) or '2' (listener)
    ModeSelection,
    /// Sending or listening
    Operating,
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// No mode chosen
    Undefined,
    /// Types and sends messages
    Sender,
    /// Waits for messages
    Listener,
}

/// Why the input buffer was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Carriage return or line feed
    LineEnd,
    /// Buffer reached capacity before a line end
    Overflow,
}

/// Secure link session.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    mode: OperatingMode,
    config: LinkConfig,
    key: Option<PresharedKey>,
    psk_state: PskState,
    nonce: Nonce,
    input: Vec<u8>,
    send_busy: bool,
    local_address: u16,
}

impl Session {
    /// Create a new session in [`SessionState::Initial`]
    pub fn new(config: LinkConfig) -> Self {
        let capacity = config.input_capacity();
        Self {
            state: SessionState::Initial,
            mode: OperatingMode::Undefined,
            key: None,
            psk_state: PskState::Invalid,
            nonce: Nonce::ZERO,
            input: Vec::with_capacity(capacity),
            send_busy: false,
            local_address: config.listener_address,
            config,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current operating mode
    #[must_use]
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// State of the preshared key
    #[must_use]
    pub fn psk_state(&self) -> PskState {
        self.psk_state
    }

    /// Nonce the next send will use
    #[must_use]
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Replace the local nonce, e.g. with one restored from elsewhere
    pub fn set_nonce(&mut self, nonce: Nonce) {
        self.nonce = nonce;
    }

    /// Bytes waiting in the input buffer
    #[must_use]
    pub fn pending_input(&self) -> &[u8] {
        &self.input
    }

    /// True while a sent frame has not been confirmed
    #[must_use]
    pub fn is_send_busy(&self) -> bool {
        self.send_busy
    }

    /// Local mesh address
    #[must_use]
    pub fn local_address(&self) -> u16 {
        self.local_address
    }

    /// Loads the key and moves to [`SessionState::ModeSelection`].
    ///
    /// A missing key record is replaced by the fallback key. A corrupt record
    /// leaves the key in [`PskState::Error`]: the session still runs, but
    /// refuses to send or decrypt. Only storage failures are returned as
    /// errors.
    pub fn start<S: PersistentStore>(&mut self, keys: &mut KeyStore<S>) -> Result<Vec<SessionAction>> {
        let mut actions = vec![print("\r\n[INIT] Starting application...\r\n")];

        let loaded = match keys.load()? {
            KeyLoad::Invalid => KeyLoad::Valid(keys.initialize_default()?),
            other => other,
        };

        self.psk_state = loaded.state();
        match loaded {
            KeyLoad::Valid(key) => {
                if key.is_fallback() {
                    actions.push(print("[PSK] Using the compiled-in fallback key\r\n"));
                }
                self.key = Some(key);
            }
            other => {
                if let Some(error) = other.error() {
                    warn!(%error, "Session started without a usable key");
                    actions.push(print(format!("[PSK] ERROR: {}\r\n", error)));
                }
                self.key = None;
            }
        }

        info!(psk_state = ?self.psk_state, "Session started");
        self.enter_mode_selection(&mut actions);
        Ok(actions)
    }

    /// Session task, run on every pass of the polling loop.
    ///
    /// Falls back to mode selection if the session is operating without a
    /// mode.
    pub fn tick(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.state == SessionState::Operating && self.mode == OperatingMode::Undefined {
            warn!("Operating mode undefined, returning to mode selection");
            actions.push(print("\r\n[ERROR] Operating mode undefined!\r\n"));
            self.enter_mode_selection(&mut actions);
        }
        actions
    }

    /// Handles one byte typed on the console.
    pub fn handle_byte(&mut self, byte: u8) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if is_printable(byte) {
            actions.push(print((byte as char).to_string()));
        } else if is_line_end(byte) {
            actions.push(print("\r\n"));
        }

        match self.state {
            SessionState::Initial => {}
            SessionState::ModeSelection => self.handle_mode_selection(byte, &mut actions),
            SessionState::Operating => self.handle_operating(byte, &mut actions),
        }

        actions
    }

    /// Handles bytes typed on the console, in order.
    pub fn handle_input(&mut self, bytes: &[u8]) -> Vec<SessionAction> {
        bytes.iter().flat_map(|&b| self.handle_byte(b)).collect()
    }

    /// Handles an inbound frame from the mesh.
    ///
    /// Returns whether the frame was accepted, plus the actions to run.
    pub fn on_receive(&mut self, data: &[u8]) -> (bool, Vec<SessionAction>) {
        let mut actions = Vec::new();

        let key = match (&self.key, self.psk_state) {
            (Some(key), PskState::Valid) => key,
            _ => {
                warn!("Cannot decrypt data, PSK not valid");
                actions.push(print("\r\n[ERROR] Cannot decrypt data - PSK not valid!\r\n"));
                return (false, actions);
            }
        };

        let message = match decode_inbound(key, data, &self.config) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "Rejected inbound frame");
                actions.push(print(format!("\r\n[ERROR] {}\r\n", error)));
                return (false, actions);
            }
        };

        actions.push(print(format!(
            "\r\n[MESSAGE RECEIVED] {}\r\n",
            message.printable()
        )));

        let before = self.nonce;
        if self.nonce.resync_on_receive(&message.nonce) {
            info!(from = %before, to = %self.nonce, "Local nonce resynchronized");
        }

        match self.mode {
            OperatingMode::Sender => actions.push(print(SENDER_PROMPT)),
            OperatingMode::Listener => actions.push(print(LISTENER_PROMPT)),
            OperatingMode::Undefined => {}
        }

        (true, actions)
    }

    /// Handles the mesh's confirmation of the last send.
    pub fn on_send_confirm(&mut self, status: ConfirmStatus) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        self.send_busy = false;

        if !status.is_success() {
            warn!(?status, "Send not accepted by the mesh");
            actions.push(print(format!("\r\n[ERROR] Send failed: {:?}\r\n", status)));
        }

        if self.mode == OperatingMode::Sender {
            actions.push(print(SENDER_PROMPT));
        }
        actions
    }

    /// Undoes a mode selection whose address the transport could not take.
    ///
    /// `current` is the address the transport still holds. The session goes
    /// back to [`SessionState::ModeSelection`] with no mode.
    pub fn on_address_rejected(&mut self, current: u16, error: &LinkError) -> Vec<SessionAction> {
        let rejected = self.local_address;
        warn!(rejected, current, %error, "Mesh address rejected");

        self.mode = OperatingMode::Undefined;
        self.local_address = current;
        self.input.clear();

        let mut actions = vec![print(format!(
            "\r\n[ERROR] Cannot take address {}: {}\r\n",
            rejected, error
        ))];
        self.enter_mode_selection(&mut actions);
        actions
    }

    fn handle_mode_selection(&mut self, byte: u8, actions: &mut Vec<SessionAction>) {
        let (mode, address, label) = match byte {
            b'1' => (OperatingMode::Sender, self.config.sender_address, "SENDER"),
            b'2' => (OperatingMode::Listener, self.config.listener_address, "LISTENER"),
            b'\r' | b'\n' => return,
            _ => {
                actions.push(print("\r\nInvalid choice. Please enter 1 or 2: "));
                return;
            }
        };

        self.mode = mode;
        self.local_address = address;
        self.state = SessionState::Operating;
        info!(?mode, address, "Operating mode selected");

        actions.push(print(format!(
            "\r\nMode set to {} with address {}\r\n",
            label, address
        )));
        actions.push(SessionAction::SetAddress(address));
        self.display_mode_status(actions);
    }

    fn handle_operating(&mut self, byte: u8, actions: &mut Vec<SessionAction>) {
        if (byte == b'M' || byte == b'm') && self.input.is_empty() {
            actions.push(print("\r\nChanging operating mode...\r\n"));
            self.enter_mode_selection(actions);
            return;
        }

        match self.mode {
            OperatingMode::Listener => {
                if is_line_end(byte) {
                    self.display_mode_status(actions);
                }
            }
            OperatingMode::Sender => {
                if is_line_end(byte) {
                    self.flush_and_send(FlushReason::LineEnd, actions);
                    return;
                }

                let capacity = self.config.input_capacity();
                if is_printable(byte) && self.input.len() < capacity {
                    self.input.push(byte);
                }
                if self.input.len() >= capacity {
                    self.flush_and_send(FlushReason::Overflow, actions);
                }
            }
            OperatingMode::Undefined => {}
        }
    }

    fn flush_and_send(&mut self, reason: FlushReason, actions: &mut Vec<SessionAction>) {
        if self.input.is_empty() {
            return;
        }
        debug!(?reason, len = self.input.len(), "Flushing input buffer");

        let key = match (&self.key, self.psk_state) {
            (Some(key), PskState::Valid) => key,
            _ => {
                warn!("Cannot send data, PSK not valid");
                actions.push(print("\r\n[ERROR] Cannot send data - PSK not valid!\r\n"));
                self.input.clear();
                return;
            }
        };

        if self.send_busy {
            let error = LinkError::SendSuppressed;
            warn!(%error, len = self.input.len(), "Dropping message");
            actions.push(print(format!("\r\n[ERROR] {}\r\n", error)));
            self.input.clear();
            return;
        }

        let envelope = match encode_outbound(key, &self.nonce, &self.input, &self.config) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "Encryption failed");
                actions.push(print(format!("\r\n[ERROR] {}\r\n", error)));
                self.input.clear();
                return;
            }
        };

        debug!(nonce = %self.nonce, len = envelope.len(), "Sending envelope");
        self.nonce.increment();

        actions.push(SessionAction::Send(DataRequest {
            dst_addr: self.config.peer_of(self.local_address),
            src_endpoint: self.config.endpoint,
            dst_endpoint: self.config.endpoint,
            options: self.config.tx_options,
            data: envelope.encode(),
        }));

        self.input.clear();
        self.send_busy = true;
    }

    fn enter_mode_selection(&mut self, actions: &mut Vec<SessionAction>) {
        self.state = SessionState::ModeSelection;
        actions.push(print(
            "\r\nSelect operating mode:\r\n 1) Sender\r\n 2) Listener\r\n",
        ));
    }

    fn display_mode_status(&self, actions: &mut Vec<SessionAction>) {
        let status = match self.mode {
            OperatingMode::Sender => {
                "Mode: SENDER - This device will send messages\r\nEnter message to encrypt: "
            }
            OperatingMode::Listener => {
                "Mode: LISTENER - This device is waiting for messages\r\n(Press 'M' to change mode)\r\n"
            }
            OperatingMode::Undefined => "Mode: UNDEFINED\r\n",
        };
        actions.push(print(format!(
            "\r\n----- Current Operating Mode -----\r\n{}",
            status
        )));
    }
}

fn print(text: impl Into<String>) -> SessionAction {
    SessionAction::Print(text.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEeprom;
    use crate::types::{INPUT_BUFFER_SIZE, LISTENER_ADDRESS, SENDER_ADDRESS};

    fn started(config: LinkConfig) -> Session {
        let mut keys = KeyStore::new(MemoryEeprom::new());
        let mut session = Session::new(config);
        session.start(&mut keys).unwrap();
        session
    }

    fn sender() -> Session {
        let mut session = started(LinkConfig::default());
        session.handle_byte(b'1');
        session
    }

    fn listener() -> Session {
        let mut session = started(LinkConfig::default());
        session.handle_byte(b'2');
        session
    }

    fn printed(actions: &[SessionAction]) -> String {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Print(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn sends(actions: &[SessionAction]) -> Vec<DataRequest> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_installs_fallback_key() {
        let mut keys = KeyStore::new(MemoryEeprom::new());
        let mut session = Session::new(LinkConfig::default());
        assert_eq!(session.state(), SessionState::Initial);

        let actions = session.start(&mut keys).unwrap();
        assert_eq!(session.state(), SessionState::ModeSelection);
        assert_eq!(session.psk_state(), PskState::Valid);
        assert!(printed(&actions).contains("Select operating mode"));
        assert_eq!(
            keys.load().unwrap(),
            KeyLoad::Valid(PresharedKey::fallback())
        );
    }

    #[test]
    fn test_start_with_corrupt_key() {
        let mut keys = KeyStore::new(MemoryEeprom::new());
        keys.store(&PresharedKey::from_bytes([7; 32])).unwrap();
        keys.storage_mut().as_bytes_mut()[0] ^= 0x80;

        let mut session = Session::new(LinkConfig::default());
        let actions = session.start(&mut keys).unwrap();
        assert_eq!(session.psk_state(), PskState::Error);
        assert_eq!(session.state(), SessionState::ModeSelection);
        assert!(printed(&actions).contains("checksum mismatch"));
    }

    #[test]
    fn test_select_sender() {
        let mut session = started(LinkConfig::default());
        let actions = session.handle_byte(b'1');
        assert_eq!(session.state(), SessionState::Operating);
        assert_eq!(session.mode(), OperatingMode::Sender);
        assert_eq!(session.local_address(), SENDER_ADDRESS);
        assert!(actions.contains(&SessionAction::SetAddress(SENDER_ADDRESS)));
    }

    #[test]
    fn test_select_listener() {
        let mut session = started(LinkConfig::default());
        let actions = session.handle_byte(b'2');
        assert_eq!(session.mode(), OperatingMode::Listener);
        assert_eq!(session.local_address(), LISTENER_ADDRESS);
        assert!(actions.contains(&SessionAction::SetAddress(LISTENER_ADDRESS)));
    }

    #[test]
    fn test_address_rejected_returns_to_selection() {
        let mut session = started(LinkConfig::default());
        session.handle_byte(b'1');
        assert_eq!(session.local_address(), SENDER_ADDRESS);

        let error = LinkError::Io(std::io::Error::from(std::io::ErrorKind::AddrInUse));
        let actions = session.on_address_rejected(LISTENER_ADDRESS, &error);

        assert_eq!(session.state(), SessionState::ModeSelection);
        assert_eq!(session.mode(), OperatingMode::Undefined);
        assert_eq!(session.local_address(), LISTENER_ADDRESS);
        let text = printed(&actions);
        assert!(text.starts_with("\r\n[ERROR] Cannot take address 1: I/O error"));
        assert!(text.ends_with(" 1) Sender\r\n 2) Listener\r\n"));

        // Idle ticks in mode selection do not complain about the missing mode.
        assert!(session.tick().is_empty());

        let actions = session.handle_byte(b'2');
        assert!(actions.contains(&SessionAction::SetAddress(LISTENER_ADDRESS)));
        assert_eq!(session.mode(), OperatingMode::Listener);
    }

    #[test]
    fn test_invalid_selection() {
        let mut session = started(LinkConfig::default());
        let actions = session.handle_byte(b'x');
        assert_eq!(session.state(), SessionState::ModeSelection);
        assert!(printed(&actions).contains("Invalid choice"));

        let actions = session.handle_byte(b'\r');
        assert_eq!(session.state(), SessionState::ModeSelection);
        assert!(!printed(&actions).contains("Invalid choice"));
    }

    #[test]
    fn test_sender_sends_line() {
        let mut session = sender();
        let before = session.nonce();

        let mut actions = session.handle_input(b"HI");
        assert_eq!(session.pending_input(), b"HI");
        actions.extend(session.handle_byte(b'\r'));

        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.len(), 10);
        assert_eq!(&sent[0].data[..8], before.as_bytes());
        assert_eq!(sent[0].dst_addr, LISTENER_ADDRESS);
        assert!(session.pending_input().is_empty());
        assert_eq!(session.nonce(), before.next());
        assert!(session.is_send_busy());
    }

    #[test]
    fn test_empty_line_sends_nothing() {
        let mut session = sender();
        let actions = session.handle_byte(b'\n');
        assert!(sends(&actions).is_empty());
        assert_eq!(session.nonce(), Nonce::ZERO);
    }

    #[test]
    fn test_non_printable_not_buffered() {
        let mut session = sender();
        let actions = session.handle_input(&[0x01, b'a', 0x7F]);
        assert_eq!(session.pending_input(), b"a");
        assert_eq!(printed(&actions), "a");
    }

    #[test]
    fn test_overflow_flushes() {
        let mut session = sender();
        let text = vec![b'z'; INPUT_BUFFER_SIZE];
        let actions = session.handle_input(&text);
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.len(), INPUT_BUFFER_SIZE + 8);
        assert!(session.pending_input().is_empty());
    }

    #[test]
    fn test_send_suppressed_until_confirm() {
        let mut session = sender();
        let first = session.handle_input(b"one\r");
        assert_eq!(sends(&first).len(), 1);

        let second = session.handle_input(b"two\r");
        assert!(sends(&second).is_empty());
        assert!(printed(&second).contains("not confirmed"));
        assert!(session.pending_input().is_empty());
        assert_eq!(session.nonce(), Nonce::ZERO.next());

        let confirm = session.on_send_confirm(ConfirmStatus::Success);
        assert!(printed(&confirm).contains("Enter message to encrypt"));
        assert!(!session.is_send_busy());

        let third = session.handle_input(b"three\r");
        assert_eq!(sends(&third).len(), 1);
    }

    #[test]
    fn test_failed_confirm_reported() {
        let mut session = sender();
        session.handle_input(b"x\r");
        let actions = session.on_send_confirm(ConfirmStatus::NoAck);
        assert!(printed(&actions).contains("Send failed: NoAck"));
        assert!(!session.is_send_busy());
    }

    #[test]
    fn test_send_refused_without_valid_key() {
        let mut session = sender();
        session.psk_state = PskState::Error;
        let actions = session.handle_input(b"hello\r");
        assert!(sends(&actions).is_empty());
        assert!(printed(&actions).contains("PSK not valid"));
        assert!(session.pending_input().is_empty());
    }

    #[test]
    fn test_mode_switch_only_with_empty_buffer() {
        let mut session = sender();
        session.handle_input(b"a");
        session.handle_byte(b'M');
        assert_eq!(session.state(), SessionState::Operating);
        assert_eq!(session.pending_input(), b"aM");

        let mut session = sender();
        let actions = session.handle_byte(b'm');
        assert_eq!(session.state(), SessionState::ModeSelection);
        assert!(printed(&actions).contains("Changing operating mode"));
    }

    #[test]
    fn test_listener_ignores_text() {
        let mut session = listener();
        let actions = session.handle_input(b"abc");
        assert!(session.pending_input().is_empty());
        assert!(sends(&actions).is_empty());

        let actions = session.handle_byte(b'\r');
        assert!(printed(&actions).contains("Current Operating Mode"));
    }

    #[test]
    fn test_receive_decrypts_and_resyncs() {
        let mut tx = sender();
        tx.set_nonce(Nonce::from_bytes([7, 0, 0, 0, 0, 0, 0, 0]));
        let frame = sends(&tx.handle_input(b"hello\r")).remove(0);

        let mut rx = listener();
        let (handled, actions) = rx.on_receive(&frame.data);
        assert!(handled);
        let text = printed(&actions);
        assert!(text.contains("[MESSAGE RECEIVED] hello"));
        assert!(text.contains("Listening for messages"));
        assert_eq!(rx.nonce().as_bytes(), &[8, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_receive_keeps_greater_local_nonce() {
        let mut tx = sender();
        let frame = sends(&tx.handle_input(b"hi\r")).remove(0);

        let mut rx = listener();
        let local = Nonce::from_bytes([9, 0, 0, 0, 0, 0, 0, 0]);
        rx.set_nonce(local);
        let (handled, _) = rx.on_receive(&frame.data);
        assert!(handled);
        assert_eq!(rx.nonce(), local);
    }

    #[test]
    fn test_receive_too_short() {
        let mut rx = listener();
        let (handled, actions) = rx.on_receive(&[0u8; 8]);
        assert!(!handled);
        assert!(printed(&actions).contains("too short"));
        assert_eq!(rx.state(), SessionState::Operating);
        assert_eq!(rx.nonce(), Nonce::ZERO);
    }

    #[test]
    fn test_receive_refused_without_valid_key() {
        let mut rx = listener();
        rx.psk_state = PskState::Invalid;
        let (handled, actions) = rx.on_receive(&[1u8; 12]);
        assert!(!handled);
        assert!(printed(&actions).contains("PSK not valid"));
    }

    #[test]
    fn test_tick_recovers_from_undefined_mode() {
        let mut session = sender();
        assert!(session.tick().is_empty());

        session.mode = OperatingMode::Undefined;
        let actions = session.tick();
        assert_eq!(session.state(), SessionState::ModeSelection);
        assert!(printed(&actions).contains("Operating mode undefined"));
    }

    #[test]
    fn test_echo() {
        let mut session = started(LinkConfig::default());
        assert_eq!(
            session.handle_byte(b'\n').first(),
            Some(&SessionAction::Print("\r\n".to_string()))
        );
        assert_eq!(
            session.handle_byte(b'q').first(),
            Some(&SessionAction::Print("q".to_string()))
        );
        let bell = session.handle_byte(0x07);
        assert_eq!(printed(&bell), "\r\nInvalid choice. Please enter 1 or 2: ");
    }
}
