//! Contract with the underlying mesh network.
//!
//! The mesh handles addressing, routing and retransmission. The secure link
//! only needs to send a data request, learn whether the mesh accepted it and
//! be handed inbound frames. Everything here runs from the single polling
//! loop, so implementations never block and need no locking.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::types::Result;

/// Request an acknowledgement from the destination.
pub const NWK_OPT_ACK_REQUEST: u8 = 1 << 0;

/// Enable mesh-level frame security.
pub const NWK_OPT_ENABLE_SECURITY: u8 = 1 << 1;

/// Outbound frame handed to the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// Destination network address.
    pub dst_addr: u16,
    /// Source endpoint.
    pub src_endpoint: u8,
    /// Destination endpoint.
    pub dst_endpoint: u8,
    /// Mesh options (`NWK_OPT_*`).
    pub options: u8,
    /// Encoded envelope.
    pub data: Vec<u8>,
}

/// Result of handing a request to the mesh.
///
/// This only reports local acceptance, not end-to-end delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStatus {
    /// Frame accepted and transmitted.
    Success,
    /// Generic failure.
    Error,
    /// No acknowledgement from the destination.
    NoAck,
    /// No route to the destination.
    NoRoute,
}

impl ConfirmStatus {
    /// True for [`ConfirmStatus::Success`].
    pub fn is_success(self) -> bool {
        self == ConfirmStatus::Success
    }
}

/// Event delivered by the mesh on a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Outcome of the last data request.
    Confirm(ConfirmStatus),
    /// Inbound frame.
    Indication {
        /// Source network address.
        src_addr: u16,
        /// Frame payload.
        data: Vec<u8>,
    },
}

/// Trait for the mesh network beneath the secure link.
pub trait MeshTransport {
    /// Queue a frame for transmission. The outcome arrives later as
    /// [`TransportEvent::Confirm`].
    fn send(&mut self, request: DataRequest) -> Result<()>;

    /// Change this node's network address.
    fn set_local_address(&mut self, address: u16) -> Result<()>;

    /// This node's network address.
    fn local_address(&self) -> u16;

    /// Drain pending events.
    fn poll(&mut self) -> Vec<TransportEvent>;
}

// ============================================================================
// Loopback Mesh
// ============================================================================

#[derive(Debug, Default)]
struct Medium {
    addresses: Vec<u16>,
    inboxes: Vec<VecDeque<TransportEvent>>,
    link_up: bool,
    delivered: usize,
    dropped: usize,
}

/// In-process mesh connecting any number of nodes.
///
/// Frames are delivered to every node holding the destination address on its
/// next poll. Confirms report [`ConfirmStatus::NoRoute`] when no node holds the
/// destination. A frame lost to a downed link is confirmed as success, or as
/// [`ConfirmStatus::NoAck`] if it asked for an acknowledgement.
#[derive(Debug, Clone)]
pub struct LoopbackMesh {
    medium: Rc<RefCell<Medium>>,
}

impl LoopbackMesh {
    /// Creates an empty mesh with the link up.
    pub fn new() -> Self {
        Self {
            medium: Rc::new(RefCell::new(Medium {
                link_up: true,
                ..Medium::default()
            })),
        }
    }

    /// Attaches a new node with address 0.
    pub fn node(&self) -> LoopbackNode {
        let mut medium = self.medium.borrow_mut();
        medium.addresses.push(0);
        medium.inboxes.push(VecDeque::new());
        LoopbackNode {
            id: medium.addresses.len() - 1,
            medium: Rc::clone(&self.medium),
        }
    }

    /// When the link is down, frames are confirmed but never delivered.
    pub fn set_link_up(&self, up: bool) {
        self.medium.borrow_mut().link_up = up;
    }

    /// Number of frames delivered to at least one node.
    pub fn delivered(&self) -> usize {
        self.medium.borrow().delivered
    }

    /// Number of frames lost.
    pub fn dropped(&self) -> usize {
        self.medium.borrow().dropped
    }
}

impl Default for LoopbackMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One node attached to a [`LoopbackMesh`].
#[derive(Debug)]
pub struct LoopbackNode {
    id: usize,
    medium: Rc<RefCell<Medium>>,
}

impl MeshTransport for LoopbackNode {
    fn send(&mut self, request: DataRequest) -> Result<()> {
        let mut medium = self.medium.borrow_mut();
        let src_addr = medium.addresses[self.id];
        trace!(src_addr, dst_addr = request.dst_addr, len = request.data.len(), "Loopback send");

        let targets: Vec<usize> = medium
            .addresses
            .iter()
            .enumerate()
            .filter(|&(id, &addr)| id != self.id && addr == request.dst_addr)
            .map(|(id, _)| id)
            .collect();

        let status = if targets.is_empty() {
            ConfirmStatus::NoRoute
        } else if !medium.link_up && request.options & NWK_OPT_ACK_REQUEST != 0 {
            ConfirmStatus::NoAck
        } else {
            ConfirmStatus::Success
        };

        if medium.link_up && !targets.is_empty() {
            for id in targets {
                medium.inboxes[id].push_back(TransportEvent::Indication {
                    src_addr,
                    data: request.data.clone(),
                });
            }
            medium.delivered += 1;
        } else {
            debug!(dst_addr = request.dst_addr, ?status, "Loopback frame lost");
            medium.dropped += 1;
        }

        medium.inboxes[self.id].push_back(TransportEvent::Confirm(status));
        Ok(())
    }

    fn set_local_address(&mut self, address: u16) -> Result<()> {
        self.medium.borrow_mut().addresses[self.id] = address;
        Ok(())
    }

    fn local_address(&self) -> u16 {
        self.medium.borrow().addresses[self.id]
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.medium.borrow_mut().inboxes[self.id].drain(..).collect()
    }
}
