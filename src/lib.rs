//! salsalink - Salsa20 end-to-end encryption over a two-node mesh link
//!
//! Preshared key storage, a Salsa20 stream cipher, nonce resynchronization
//! and the sender/listener session state machine.

mod cipher;
mod config;
mod envelope;
mod keystore;
mod node;
mod nonce;
mod session;
mod storage;
mod transport;
mod types;
mod udp;

pub use cipher::*;
pub use config::*;
pub use envelope::*;
pub use keystore::*;
pub use node::*;
pub use nonce::*;
pub use session::*;
pub use storage::*;
pub use transport::*;
pub use types::*;
pub use udp::*;
