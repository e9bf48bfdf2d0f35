//! Authenticated encryption of data-slot payloads.
//!
//! Each stream derives its own key from the network master key. Frames are
//! tagged with a truncated AES-CMAC and optionally encrypted AES-CTR style;
//! the nonce never travels on the air, both endpoints rebuild it from
//! `(dataSuperframeNumber, streamSequenceNumber, masterIndex)`, which the
//! slot discipline keeps aligned across the mesh.
//!
//! ```norust
//! nonce (16) = superframe:u32 LE | seqNo:u64 LE | masterIndex:u32 LE
//!
//! tag = aes128_cmac(K_stream, frame)[0..4]
//! S_i = aes128_ecb(K_stream, nonce ^ i), i = 0..k
//! ciphertext = payload ^ (S_0 | S_1 | ... )
//! ```

use crate::stream::StreamId;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

pub const TAG_SIZE: usize = 4;

/// Execution budget of the tag + encrypt path, subtracted from the send
/// wakeup deadline.
pub const CRYPTO_EXECUTION_TIME: i64 = 110_000;

/// Network master key plus its rotation index.
#[derive(Clone)]
pub struct KeyManager {
    master_key: [u8; 16],
    master_index: u32,
}

impl KeyManager {
    pub fn new(master_key: [u8; 16], master_index: u32) -> Self {
        KeyManager {
            master_key,
            master_index,
        }
    }

    pub fn master_index(&self) -> u32 {
        self.master_index
    }

    /// K_stream = aes128_cmac(K_master, 0x01 | StreamId)
    pub fn stream_aead(&self, id: StreamId) -> StreamAead {
        let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&self.master_key).unwrap();
        mac.update(&[0x01]);
        mac.update(&id.to_bytes());
        let derived = mac.finalize().into_bytes();
        StreamAead {
            key: derived.as_slice().try_into().unwrap(),
        }
    }
}

/// Per-stream tagging and encryption context.
#[derive(Clone)]
pub struct StreamAead {
    key: [u8; 16],
}

fn nonce(superframe: u32, seq_no: u64, master_index: u32) -> [u8; 16] {
    let mut n = [0u8; 16];
    n[0..4].copy_from_slice(&superframe.to_le_bytes());
    n[4..12].copy_from_slice(&seq_no.to_le_bytes());
    n[12..16].copy_from_slice(&master_index.to_le_bytes());
    n
}

impl StreamAead {
    pub fn tag(&self, frame: &[u8]) -> [u8; TAG_SIZE] {
        let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&self.key).unwrap();
        mac.update(frame);
        mac.finalize().into_bytes().as_slice()[..TAG_SIZE]
            .try_into()
            .unwrap()
    }

    pub fn verify(&self, frame: &[u8], tag: &[u8]) -> bool {
        tag.len() == TAG_SIZE && self.tag(frame) == *tag
    }

    /// XOR the payload with the AES-CTR keystream; applying it twice with
    /// the same nonce decrypts.
    pub fn apply_keystream(
        &self,
        superframe: u32,
        seq_no: u64,
        master_index: u32,
        payload: &mut [u8],
    ) {
        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        let base = nonce(superframe, seq_no, master_index);
        for (i, chunk) in payload.chunks_mut(16).enumerate() {
            let mut block = base;
            block[15] ^= i as u8;
            let mut block = GenericArray::from(block);
            cipher.encrypt_block(&mut block);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }
}
