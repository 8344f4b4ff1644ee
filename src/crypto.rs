// Key derivation, AES-256-CTR and shard hashing shared by uploads, downloads and the stream controller.

use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use rand::RngCore;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::TransferError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const INDEX_LEN: usize = 32;

const SEED_ROUNDS: u32 = 2048;

/// A user's recovery phrase. Never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Mnemonic(String);

impl Mnemonic {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self(phrase.into())
    }

    fn normalized(&self) -> Zeroizing<String> {
        Zeroizing::new(self.0.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

impl fmt::Debug for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mnemonic(<redacted>)")
    }
}

/// BIP-39 seed: PBKDF2-HMAC-SHA512 over the phrase with salt `"mnemonic"`.
pub fn mnemonic_to_seed(mnemonic: &Mnemonic) -> Zeroizing<[u8; 64]> {
    let mut seed = Zeroizing::new([0u8; 64]);
    pbkdf2::pbkdf2_hmac::<Sha512>(
        mnemonic.normalized().as_bytes(),
        b"mnemonic",
        SEED_ROUNDS,
        &mut seed[..],
    );
    seed
}

fn deterministic_key(key: &[u8], data: &[u8]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(key);
    hasher.update(data);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// SHA-512(seed ‖ bucket id bytes).
pub fn generate_bucket_key(
    mnemonic: &Mnemonic,
    bucket_id: &str,
) -> Result<Zeroizing<[u8; 64]>, TransferError> {
    let bucket = hex::decode(bucket_id)
        .map_err(|e| TransferError::Crypto(format!("bucket id is not hex: {e}")))?;
    let seed = mnemonic_to_seed(mnemonic);
    Ok(deterministic_key(&seed[..], &bucket))
}

/// First 32 bytes of SHA-512(bucket_key[..32] ‖ index).
pub fn generate_file_key(
    mnemonic: &Mnemonic,
    bucket_id: &str,
    index: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, TransferError> {
    let bucket_key = generate_bucket_key(mnemonic, bucket_id)?;
    let file_key = deterministic_key(&bucket_key[..KEY_LEN], index);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&file_key[..KEY_LEN]);
    Ok(key)
}

/// Fresh random file index for an upload.
pub fn random_index() -> [u8; INDEX_LEN] {
    let mut index = [0u8; INDEX_LEN];
    rand::thread_rng().fill_bytes(&mut index);
    index
}

/// Key and IV for one file. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl FileKeys {
    /// Derive the key from `(mnemonic, bucket_id, index)`; the IV is the index prefix.
    pub fn derive(mnemonic: &Mnemonic, bucket_id: &str, index: &[u8]) -> Result<Self, TransferError> {
        if index.len() < IV_LEN {
            return Err(TransferError::Crypto(format!(
                "file index too short: {} bytes",
                index.len()
            )));
        }
        let key = generate_file_key(mnemonic, bucket_id, index)?;
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&index[..IV_LEN]);
        Ok(Self { key: *key, iv })
    }

    /// Same as [`FileKeys::derive`] for a hex-encoded index.
    pub fn derive_hex(mnemonic: &Mnemonic, bucket_id: &str, index_hex: &str) -> Result<Self, TransferError> {
        let index = Zeroizing::new(
            hex::decode(index_hex)
                .map_err(|e| TransferError::Crypto(format!("file index is not hex: {e}")))?,
        );
        Self::derive(mnemonic, bucket_id, &index)
    }

    pub fn cipher(&self) -> FileCipher {
        FileCipher::new(self)
    }
}

impl fmt::Debug for FileKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKeys(<redacted>)")
    }
}

/// AES-256-CTR keystream positioned by absolute plaintext offset.
pub struct FileCipher {
    inner: Aes256Ctr,
}

impl FileCipher {
    pub fn new(keys: &FileKeys) -> Self {
        Self {
            inner: Aes256Ctr::new(&keys.key.into(), &keys.iv.into()),
        }
    }

    /// Encrypt or decrypt `buf` in place, continuing from the current position.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }

    /// Encrypt or decrypt `buf` in place as if it started at byte `offset` of the file.
    pub fn apply_at(&mut self, offset: u64, buf: &mut [u8]) {
        self.inner.seek(offset);
        self.inner.apply_keystream(buf);
    }
}

/// Incremental shard hash: RIPEMD-160 over SHA-256 of the ciphertext.
#[derive(Default)]
pub struct ShardHasher {
    inner: Sha256,
}

impl ShardHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Lowercase hex digest.
    pub fn finalize(self) -> String {
        let sha = self.inner.finalize();
        hex::encode(Ripemd160::digest(sha))
    }
}

/// One-shot [`ShardHasher`].
pub fn shard_hash(data: &[u8]) -> String {
    let mut hasher = ShardHasher::new();
    hasher.update(data);
    hasher.finalize()
}
