use crate::format::{
    read_block, read_up_to, BlockRead, MasterKey, BLOCK_MAGIC, MAC_LEN, PAYLOAD_CAPACITY,
};
use crate::merkle::PlaintextDigest;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Successful decryption of a whole file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verified {
    pub plaintext_len: u64,
    pub checksum: blake3::Hash,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    /// The content is intact as far as we can tell but does not open under this version.
    #[error("content does not verify under version {version}: {reason}")]
    Mismatch { version: u32, reason: String },
    /// Reading the content failed for reasons unrelated to the version.
    #[error("storage error while verifying: {0}")]
    Io(#[from] io::Error),
}

/// Decrypt-and-verify capability consulted by the repair engine.
///
/// Implementations must not mutate stored metadata and must be safe to call
/// repeatedly for the same file.
pub trait DecryptVerify {
    fn verify(&self, path: &Path, version: u32) -> Result<Verified, VerifyError>;

    /// True when `verify` judges the version it is handed, without consulting
    /// the metadata store. Such oracles let candidates be checked before any
    /// metadata write happens.
    fn dry_run(&self) -> bool {
        true
    }
}

/// Oracle for files produced by [`crate::format::seal`].
#[derive(Debug, Clone)]
pub struct SealedBlockOracle {
    key: MasterKey,
}

fn mismatch(version: u32, reason: impl Into<String>) -> VerifyError {
    VerifyError::Mismatch { version, reason: reason.into() }
}

impl SealedBlockOracle {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Decrypt `reader` under `version`, streaming plaintext into `sink`.
    ///
    /// Version 0 means "not encrypted": the content must not carry block headers
    /// and is passed through as-is.
    pub fn open_to<R: Read, W: Write>(
        &self,
        reader: R,
        version: u32,
        mut sink: W,
    ) -> Result<Verified, VerifyError> {
        let mut reader = BufReader::new(reader);
        let mut digest = PlaintextDigest::new();

        if version == 0 {
            let mut buf = vec![0u8; PAYLOAD_CAPACITY];
            let mut first = true;
            loop {
                let n = read_up_to(&mut reader, &mut buf)?;
                if n == 0 {
                    break;
                }
                if first && n >= BLOCK_MAGIC.len() && &buf[..BLOCK_MAGIC.len()] == BLOCK_MAGIC {
                    return Err(mismatch(0, "content is sealed"));
                }
                first = false;
                digest.push_block(&buf[..n]);
                sink.write_all(&buf[..n])?;
            }
            return Ok(Verified { plaintext_len: digest.len(), checksum: digest.finish() });
        }

        let keys = self.key.version_keys(version);
        let mut body = Vec::with_capacity(PAYLOAD_CAPACITY + MAC_LEN);
        let mut index = 0u32;
        let mut seen_final = false;
        loop {
            let header = match read_block(&mut reader, &mut body)? {
                BlockRead::End if seen_final || index == 0 => break,
                BlockRead::End => return Err(mismatch(version, "final block missing")),
                BlockRead::Torn { .. } => {
                    return Err(mismatch(version, format!("block {index} truncated")))
                }
                BlockRead::BadHeader(e) => {
                    return Err(mismatch(version, format!("block {index}: {e}")))
                }
                BlockRead::Block(h) => h,
            };
            if seen_final {
                return Err(mismatch(version, "data after final block"));
            }
            if header.index != index {
                return Err(mismatch(version, format!("block {index} out of order")));
            }
            if !header.is_final() && header.payload_len as usize != PAYLOAD_CAPACITY {
                return Err(mismatch(version, format!("block {index} short")));
            }
            let (payload, tag) = body.split_at_mut(header.payload_len as usize);
            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(tag);
            // blake3::Hash equality is constant time.
            if keys.mac(&header.encode(), payload) != blake3::Hash::from(mac) {
                return Err(mismatch(version, format!("block {index} failed authentication")));
            }
            keys.apply_keystream(index, payload);
            digest.push_block(payload);
            sink.write_all(payload)?;
            seen_final = header.is_final();
            index += 1;
        }
        Ok(Verified { plaintext_len: digest.len(), checksum: digest.finish() })
    }
}

impl DecryptVerify for SealedBlockOracle {
    fn verify(&self, path: &Path, version: u32) -> Result<Verified, VerifyError> {
        let f = File::open(path)?;
        self.open_to(f, version, io::sink())
    }
}
