//! A session wired to a mesh transport and a console.
//!
//! [`Node`] is the single cooperative loop: each [`Node::poll`] services the
//! transport, delivers confirms and inbound frames to the session and runs the
//! session task. Console input is fed in with [`Node::type_bytes`]. Console
//! output is collected and drained by the caller.

use tracing::{debug, warn};

use crate::config::LinkConfig;
use crate::keystore::KeyStore;
use crate::session::{Session, SessionAction};
use crate::storage::PersistentStore;
use crate::transport::{ConfirmStatus, MeshTransport, TransportEvent};
use crate::types::Result;

/// One end of the secure link.
#[derive(Debug)]
pub struct Node<T: MeshTransport> {
    session: Session,
    transport: T,
    console: String,
}

impl<T: MeshTransport> Node<T> {
    /// Starts a session over `transport`, loading the key from `keys`.
    pub fn start<S: PersistentStore>(
        config: LinkConfig,
        transport: T,
        keys: &mut KeyStore<S>,
    ) -> Result<Self> {
        let mut node = Self {
            session: Session::new(config),
            transport,
            console: String::new(),
        };
        let actions = node.session.start(keys)?;
        node.execute(actions)?;
        Ok(node)
    }

    /// Feeds console bytes to the session.
    ///
    /// Each byte's actions run before the next byte is handled.
    pub fn type_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            let actions = self.session.handle_byte(byte);
            self.execute(actions)?;
        }
        Ok(())
    }

    /// Services the transport once and runs the session task.
    ///
    /// Returns the number of transport events handled.
    pub fn poll(&mut self) -> Result<usize> {
        let events = self.transport.poll();
        let handled = events.len();

        for event in events {
            let actions = match event {
                TransportEvent::Confirm(status) => self.session.on_send_confirm(status),
                TransportEvent::Indication { src_addr, data } => {
                    let (accepted, actions) = self.session.on_receive(&data);
                    debug!(src_addr, len = data.len(), accepted, "Inbound frame");
                    actions
                }
            };
            self.execute(actions)?;
        }

        let actions = self.session.tick();
        self.execute(actions)?;
        Ok(handled)
    }

    /// Drains console output produced so far.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.console)
    }

    /// The session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable access to the session.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn execute(&mut self, actions: Vec<SessionAction>) -> Result<()> {
        for action in actions {
            match action {
                SessionAction::Print(text) => self.console.push_str(&text),
                SessionAction::SetAddress(address) => {
                    if let Err(error) = self.transport.set_local_address(address) {
                        // The rest of the batch belongs to the rejected mode.
                        let current = self.transport.local_address();
                        let actions = self.session.on_address_rejected(current, &error);
                        return self.execute(actions);
                    }
                }
                SessionAction::Send(request) => {
                    // A refused frame never gets a confirm from the mesh.
                    if let Err(error) = self.transport.send(request) {
                        warn!(%error, "Transport refused frame");
                        let actions = self.session.on_send_confirm(ConfirmStatus::Error);
                        self.execute(actions)?;
                    }
                }
            }
        }
        Ok(())
    }
}
