//! Link configuration.

use crate::transport::NWK_OPT_ENABLE_SECURITY;
use crate::types::{
    APP_ENDPOINT, LISTENER_ADDRESS, MAX_PAYLOAD_SIZE, NONCE_HEADER_SIZE, SENDER_ADDRESS,
};

/// How the Salsa20 block counter behaves across the blocks of one message.
///
/// Both peers must use the same mode. The modes only differ for messages
/// longer than one 64-byte keystream block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterMode {
    /// Advance the 64-bit block counter after every block (standard Salsa20).
    #[default]
    Incrementing,
    /// Keep the block counter at zero for every block.
    ///
    /// This is what the deployed firmware does. It repeats the keystream every
    /// 64 bytes, so only use it to talk to nodes that have not been updated.
    Frozen,
}

/// Configuration for a secure link session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Maximum envelope size accepted by the mesh.
    pub max_payload_size: usize,
    /// Endpoint used as source and destination.
    pub endpoint: u8,
    /// Address taken in sender mode.
    pub sender_address: u16,
    /// Address taken in listener mode.
    pub listener_address: u16,
    /// Transport options attached to every data request.
    pub tx_options: u8,
    /// Block counter behaviour.
    pub counter_mode: CounterMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            endpoint: APP_ENDPOINT,
            sender_address: SENDER_ADDRESS,
            listener_address: LISTENER_ADDRESS,
            tx_options: NWK_OPT_ENABLE_SECURITY,
            counter_mode: CounterMode::default(),
        }
    }
}

impl LinkConfig {
    /// Creates a configuration compatible with unmodified firmware nodes.
    pub fn firmware_compatible() -> Self {
        Self::default().with_counter_mode(CounterMode::Frozen)
    }

    /// Sets the block counter behaviour.
    pub fn with_counter_mode(mut self, counter_mode: CounterMode) -> Self {
        self.counter_mode = counter_mode;
        self
    }

    /// Sets the maximum envelope size.
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Capacity of the sender input buffer.
    pub fn input_capacity(&self) -> usize {
        self.max_payload_size.saturating_sub(NONCE_HEADER_SIZE)
    }

    /// Address of the counterpart node for a given local address.
    pub fn peer_of(&self, local: u16) -> u16 {
        if local == self.sender_address {
            self.listener_address
        } else {
            self.sender_address
        }
    }
}
