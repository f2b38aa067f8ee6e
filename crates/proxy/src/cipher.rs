//! The per-generation wire ciphers.
//!
//! Dc/Pc/Patch use a shared keystream generator seeded with a 32-bit value
//! (`stream`), Gc uses a longer-period keystream (`console`), and Bb uses a
//! keyed 8-byte block mixer (`block`) whose key table is not carried on the
//! wire, so the inbound side has to detect which key table the client was
//! shipped with (`detect`).
//!
//! Ciphers are used strictly once per direction of a session; there is no
//! seek or reset.

use crate::error::{ProxyError, Result};

/// One direction's cipher. `block_size` is the granularity the framing layer
/// must respect: only whole blocks are ever passed to encrypt/decrypt.
pub trait PacketCipher: Send {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<()>;
    fn decrypt(&mut self, data: &mut [u8]) -> Result<()>;
    fn block_size(&self) -> usize {
        4
    }
}

pub mod stream {
    use super::*;

    const LAG: usize = 55;
    const SHORT_LAG: usize = 24;

    /// Subtractive lagged-Fibonacci keystream, XORed over the frame as
    /// little-endian u32 words. Symmetric: encrypt and decrypt are the same
    /// operation. Used by the Dc, Pc, and Patch generations.
    pub struct StreamCipher {
        table: [u32; LAG],
        i: usize,
        j: usize,
    }

    impl StreamCipher {
        pub fn new(seed: u32) -> Self {
            let mut table = [0u32; LAG];
            let mut j = seed;
            let mut k: u32 = 1;
            table[LAG - 1] = j;
            for i in 1..LAG {
                let idx = (21 * i) % LAG;
                table[idx] = k;
                k = j.wrapping_sub(k);
                j = table[idx];
            }
            // Warm-up passes so early output does not correlate with the seed.
            for _ in 0..4 {
                for i in 0..LAG {
                    table[i] = table[i].wrapping_sub(table[(i + 31) % LAG]);
                }
            }
            Self {
                table,
                i: 0,
                j: LAG - SHORT_LAG,
            }
        }

        pub fn next_key(&mut self) -> u32 {
            let v = self.table[self.i].wrapping_sub(self.table[self.j]);
            self.table[self.i] = v;
            self.i = (self.i + 1) % LAG;
            self.j = (self.j + 1) % LAG;
            v
        }

        fn apply(&mut self, data: &mut [u8]) {
            for chunk in data.chunks_exact_mut(4) {
                let key = self.next_key().to_le_bytes();
                for (b, k) in chunk.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
        }
    }

    impl PacketCipher for StreamCipher {
        fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.apply(data);
            Ok(())
        }

        fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.apply(data);
            Ok(())
        }
    }
}

pub mod console {
    use super::*;

    const LAG: usize = 521;
    const SHORT_LAG: usize = 32;

    /// Additive lagged-Fibonacci keystream with a much longer period than
    /// the legacy stream, seeded through an LCG expansion. Used by the Gc
    /// generation.
    pub struct ConsoleCipher {
        table: [u32; LAG],
        i: usize,
        j: usize,
    }

    impl ConsoleCipher {
        pub fn new(seed: u32) -> Self {
            let mut table = [0u32; LAG];
            let mut x = seed;
            for entry in table.iter_mut() {
                x = x.wrapping_mul(0x41C6_4E6D).wrapping_add(0x3039);
                *entry = x;
            }
            let mut cipher = Self {
                table,
                i: 0,
                j: LAG - SHORT_LAG,
            };
            for _ in 0..LAG {
                cipher.next_key();
            }
            cipher
        }

        pub fn next_key(&mut self) -> u32 {
            let v = self.table[self.i].wrapping_add(self.table[self.j]);
            self.table[self.i] = v;
            self.i = (self.i + 1) % LAG;
            self.j = (self.j + 1) % LAG;
            v
        }

        fn apply(&mut self, data: &mut [u8]) {
            for chunk in data.chunks_exact_mut(4) {
                let key = self.next_key().to_le_bytes();
                for (b, k) in chunk.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
        }
    }

    impl PacketCipher for ConsoleCipher {
        fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.apply(data);
            Ok(())
        }

        fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.apply(data);
            Ok(())
        }
    }
}

pub mod block {
    use super::*;
    use crate::wire::fnv1a64;

    const ROUNDS: usize = 16;
    pub const SEED_SIZE: usize = 0x30;

    /// A named key table for the Bb block cipher. Clients ship with one of
    /// several table variants; the wire only carries the per-session seed,
    /// so the proxy keeps a palette of these and detects which one the
    /// client uses (see [`super::detect`]).
    pub struct BlockKey {
        pub name: String,
        p: [u32; ROUNDS + 2],
        s: [[u32; 256]; 4],
    }

    impl BlockKey {
        /// Expands opaque key material into the base tables.
        pub fn derive(name: impl Into<String>, material: &[u8]) -> Self {
            let mut gen = stream::StreamCipher::new(fnv1a64(material) as u32);
            let mut p = [0u32; ROUNDS + 2];
            for entry in p.iter_mut() {
                *entry = gen.next_key();
            }
            let mut s = [[0u32; 256]; 4];
            for table in s.iter_mut() {
                for entry in table.iter_mut() {
                    *entry = gen.next_key();
                }
            }
            Self {
                name: name.into(),
                p,
                s,
            }
        }
    }

    /// Feistel-network block cipher over 8-byte little-endian blocks, keyed
    /// by a [`BlockKey`] and a 0x30-byte session seed. Blocks are position
    /// independent, which is what makes key detection on the first frame
    /// possible.
    pub struct BlockCipher {
        p: [u32; ROUNDS + 2],
        s: [[u32; 256]; 4],
    }

    impl BlockCipher {
        pub fn new(key: &BlockKey, seed: &[u8]) -> Self {
            let mut cipher = Self { p: key.p, s: key.s };

            let words: Vec<u32> = seed
                .chunks(4)
                .map(|c| {
                    let mut w = [0u8; 4];
                    w[..c.len()].copy_from_slice(c);
                    u32::from_le_bytes(w)
                })
                .collect();
            if !words.is_empty() {
                for (i, entry) in cipher.p.iter_mut().enumerate() {
                    *entry ^= words[i % words.len()];
                }
            }

            // Standard schedule: run the cipher over a zero block and feed
            // the output back into the tables.
            let (mut l, mut r) = (0u32, 0u32);
            for i in (0..ROUNDS + 2).step_by(2) {
                (l, r) = cipher.encrypt_block(l, r);
                cipher.p[i] = l;
                cipher.p[i + 1] = r;
            }
            for t in 0..4 {
                for i in (0..256).step_by(2) {
                    (l, r) = cipher.encrypt_block(l, r);
                    cipher.s[t][i] = l;
                    cipher.s[t][i + 1] = r;
                }
            }
            cipher
        }

        fn feistel(&self, x: u32) -> u32 {
            let [a, b, c, d] = x.to_be_bytes();
            self.s[0][a as usize]
                .wrapping_add(self.s[1][b as usize])
                ^ self.s[2][c as usize].wrapping_add(self.s[3][d as usize])
        }

        fn encrypt_block(&self, mut l: u32, mut r: u32) -> (u32, u32) {
            for i in 0..ROUNDS {
                l ^= self.p[i];
                r ^= self.feistel(l);
                std::mem::swap(&mut l, &mut r);
            }
            std::mem::swap(&mut l, &mut r);
            r ^= self.p[ROUNDS];
            l ^= self.p[ROUNDS + 1];
            (l, r)
        }

        fn decrypt_block(&self, mut l: u32, mut r: u32) -> (u32, u32) {
            l ^= self.p[ROUNDS + 1];
            r ^= self.p[ROUNDS];
            std::mem::swap(&mut l, &mut r);
            for i in (0..ROUNDS).rev() {
                std::mem::swap(&mut l, &mut r);
                r ^= self.feistel(l);
                l ^= self.p[i];
            }
            (l, r)
        }

        pub fn encrypt_data(&self, data: &mut [u8]) {
            for chunk in data.chunks_exact_mut(8) {
                let l = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                let r = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
                let (l, r) = self.encrypt_block(l, r);
                chunk[0..4].copy_from_slice(&l.to_le_bytes());
                chunk[4..8].copy_from_slice(&r.to_le_bytes());
            }
        }

        pub fn decrypt_data(&self, data: &mut [u8]) {
            for chunk in data.chunks_exact_mut(8) {
                let l = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                let r = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
                let (l, r) = self.decrypt_block(l, r);
                chunk[0..4].copy_from_slice(&l.to_le_bytes());
                chunk[4..8].copy_from_slice(&r.to_le_bytes());
            }
        }
    }

    impl PacketCipher for BlockCipher {
        fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.encrypt_data(data);
            Ok(())
        }

        fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.decrypt_data(data);
            Ok(())
        }

        fn block_size(&self) -> usize {
            8
        }
    }
}

pub mod detect {
    use super::block::{BlockCipher, BlockKey};
    use super::*;
    use std::sync::{Arc, OnceLock};

    /// The key decision shared between one detector and its imitators. The
    /// session owns one of these behind an `Arc`; all four Bb ciphers refer
    /// to it, and they are dropped together when the session dies.
    pub struct KeyDetector {
        palette: Vec<Arc<BlockKey>>,
        sentinel: Vec<u8>,
        locked: OnceLock<Arc<BlockKey>>,
    }

    impl KeyDetector {
        pub fn new(palette: Vec<Arc<BlockKey>>, sentinel: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                palette,
                sentinel,
                locked: OnceLock::new(),
            })
        }

        pub fn locked_key(&self) -> Option<&Arc<BlockKey>> {
            self.locked.get()
        }
    }

    /// Inbound client cipher for Bb. The first decrypted block must equal
    /// the sentinel (the fixed header of the login frame every client sends
    /// first); the candidate key that produces it wins and is published to
    /// the imitators.
    pub struct DetectorCipher {
        shared: Arc<KeyDetector>,
        seed: Vec<u8>,
        inner: Option<BlockCipher>,
    }

    impl DetectorCipher {
        pub fn new(shared: Arc<KeyDetector>, seed: &[u8]) -> Self {
            Self {
                shared,
                seed: seed.to_vec(),
                inner: None,
            }
        }

        fn lock_on(&mut self, first_block: &[u8]) -> Result<()> {
            if let Some(key) = self.shared.locked.get() {
                self.inner = Some(BlockCipher::new(key, &self.seed));
                return Ok(());
            }
            for key in &self.shared.palette {
                let candidate = BlockCipher::new(key, &self.seed);
                let mut trial = [0u8; 8];
                trial.copy_from_slice(&first_block[..8]);
                candidate.decrypt_data(&mut trial);
                if trial[..] == self.shared.sentinel[..] {
                    log::info!("cipher.detect.locked key={}", key.name);
                    let _ = self.shared.locked.set(key.clone());
                    self.inner = Some(candidate);
                    return Ok(());
                }
            }
            Err(ProxyError::CipherMismatch)
        }
    }

    impl PacketCipher for DetectorCipher {
        fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
            let inner = self.inner.as_ref().ok_or(ProxyError::CipherMismatch)?;
            inner.encrypt_data(data);
            Ok(())
        }

        fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
            if self.inner.is_none() {
                if data.len() < 8 {
                    return Err(ProxyError::ShortRead);
                }
                let first: Vec<u8> = data[..8].to_vec();
                self.lock_on(&first)?;
            }
            self.inner.as_ref().unwrap().decrypt_data(data);
            Ok(())
        }

        fn block_size(&self) -> usize {
            8
        }
    }

    /// Any of the three sibling ciphers that follow the detector's key
    /// decision with their own seed.
    pub struct ImitatorCipher {
        shared: Arc<KeyDetector>,
        seed: Vec<u8>,
        inner: Option<BlockCipher>,
    }

    impl ImitatorCipher {
        pub fn new(shared: Arc<KeyDetector>, seed: &[u8]) -> Self {
            Self {
                shared,
                seed: seed.to_vec(),
                inner: None,
            }
        }

        fn inner(&mut self) -> Result<&BlockCipher> {
            if self.inner.is_none() {
                let key = self
                    .shared
                    .locked
                    .get()
                    .ok_or(ProxyError::CipherMismatch)?;
                self.inner = Some(BlockCipher::new(key, &self.seed));
            }
            Ok(self.inner.as_ref().unwrap())
        }
    }

    impl PacketCipher for ImitatorCipher {
        fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.inner()?.encrypt_data(data);
            Ok(())
        }

        fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
            self.inner()?.decrypt_data(data);
            Ok(())
        }

        fn block_size(&self) -> usize {
            8
        }
    }
}
