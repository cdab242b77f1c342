//! Salsa20/20 stream cipher.
//!
//! State layout (16 little-endian 32-bit words):
//! - \[0, 5, 10, 15\]: constant (`"expand 32-byte k"` or `"expand 16-byte k"`)
//! - \[1..5\]:        key bytes 0..16
//! - \[6, 7\]:        nonce
//! - \[8, 9\]:        block counter (low, high)
//! - \[11..15\]:      key bytes 16..32 (repeated first half for 128-bit keys)
//!
//! The state is fully determined by (key, nonce, block index) and is cheap
//! to rebuild, so a fresh [`Salsa20`] is created for every message.

use crate::config::CounterMode;
use crate::types::PSK_LENGTH;

/// Size of one keystream block in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Size of the nonce in bytes.
pub const NONCE_SIZE: usize = 8;

const SIGMA: &[u8; 16] = b"expand 32-byte k";
const TAU: &[u8; 16] = b"expand 16-byte k";

/// Number of double rounds (20 rounds in total).
const DOUBLE_ROUNDS: usize = 10;

/// Salsa20 cipher state.
#[derive(Clone)]
pub struct Salsa20 {
    input: [u32; 16],
    counter_mode: CounterMode,
}

impl Salsa20 {
    /// Creates a cipher ready to produce keystream for one message.
    pub fn new(key: &[u8; PSK_LENGTH], nonce: &[u8; NONCE_SIZE], counter_mode: CounterMode) -> Self {
        let mut cipher = Self::key_setup(key).with_counter_mode(counter_mode);
        cipher.iv_setup(nonce);
        cipher
    }

    /// Seeds the state from a 256-bit key. The nonce words are left at zero
    /// until [`Salsa20::iv_setup`] is called.
    pub fn key_setup(key: &[u8; PSK_LENGTH]) -> Self {
        let mut input = [0u32; 16];
        load_constants(&mut input, SIGMA);
        for i in 0..4 {
            input[1 + i] = load_le(&key[i * 4..]);
            input[11 + i] = load_le(&key[16 + i * 4..]);
        }
        Self {
            input,
            counter_mode: CounterMode::default(),
        }
    }

    /// Seeds the state from a 128-bit key.
    pub fn key_setup_128(key: &[u8; 16]) -> Self {
        let mut input = [0u32; 16];
        load_constants(&mut input, TAU);
        for i in 0..4 {
            let word = load_le(&key[i * 4..]);
            input[1 + i] = word;
            input[11 + i] = word;
        }
        Self {
            input,
            counter_mode: CounterMode::default(),
        }
    }

    /// Sets how the block counter moves between blocks.
    pub fn with_counter_mode(mut self, counter_mode: CounterMode) -> Self {
        self.counter_mode = counter_mode;
        self
    }

    /// Loads the nonce and resets the block counter.
    pub fn iv_setup(&mut self, nonce: &[u8; NONCE_SIZE]) {
        self.input[6] = load_le(&nonce[0..]);
        self.input[7] = load_le(&nonce[4..]);
        self.input[8] = 0;
        self.input[9] = 0;
    }

    /// Current 64-bit block counter.
    pub fn block_counter(&self) -> u64 {
        u64::from(self.input[8]) | (u64::from(self.input[9]) << 32)
    }

    /// Generates the keystream block for the current state.
    ///
    /// Runs 10 double rounds (column round then row round), adds the input
    /// words back mod 2^32 and serializes the result little-endian.
    pub fn block(&self) -> [u8; BLOCK_SIZE] {
        let mut x = self.input;

        for _ in 0..DOUBLE_ROUNDS {
            // Column round
            quarter_round(&mut x, 0, 4, 8, 12);
            quarter_round(&mut x, 5, 9, 13, 1);
            quarter_round(&mut x, 10, 14, 2, 6);
            quarter_round(&mut x, 15, 3, 7, 11);

            // Row round
            quarter_round(&mut x, 0, 1, 2, 3);
            quarter_round(&mut x, 5, 6, 7, 4);
            quarter_round(&mut x, 10, 11, 8, 9);
            quarter_round(&mut x, 15, 12, 13, 14);
        }

        let mut out = [0u8; BLOCK_SIZE];
        for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&x[i].wrapping_add(self.input[i]).to_le_bytes());
        }
        out
    }

    /// XORs the input with successive keystream blocks.
    ///
    /// The output has the same length as the input; the final chunk may be
    /// shorter than a block. Encryption and decryption are the same call.
    pub fn apply_keystream(&mut self, input: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(input.len());

        for chunk in input.chunks(BLOCK_SIZE) {
            let block = self.block();
            output.extend(chunk.iter().zip(block.iter()).map(|(b, k)| b ^ k));
            self.advance_counter();
        }

        output
    }

    fn advance_counter(&mut self) {
        if self.counter_mode == CounterMode::Frozen {
            return;
        }
        self.input[8] = self.input[8].wrapping_add(1);
        if self.input[8] == 0 {
            self.input[9] = self.input[9].wrapping_add(1);
        }
    }
}

impl std::fmt::Debug for Salsa20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Salsa20")
            .field("block_counter", &self.block_counter())
            .field("counter_mode", &self.counter_mode)
            .finish_non_exhaustive()
    }
}

/// Encrypts or decrypts one message with a fresh cipher state.
pub fn salsa20_xor(
    key: &[u8; PSK_LENGTH],
    nonce: &[u8; NONCE_SIZE],
    counter_mode: CounterMode,
    input: &[u8],
) -> Vec<u8> {
    Salsa20::new(key, nonce, counter_mode).apply_keystream(input)
}

fn quarter_round(x: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    x[b] ^= x[a].wrapping_add(x[d]).rotate_left(7);
    x[c] ^= x[b].wrapping_add(x[a]).rotate_left(9);
    x[d] ^= x[c].wrapping_add(x[b]).rotate_left(13);
    x[a] ^= x[d].wrapping_add(x[c]).rotate_left(18);
}

fn load_constants(input: &mut [u32; 16], constants: &[u8; 16]) {
    input[0] = load_le(&constants[0..]);
    input[5] = load_le(&constants[4..]);
    input[10] = load_le(&constants[8..]);
    input[15] = load_le(&constants[12..]);
}

fn load_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
