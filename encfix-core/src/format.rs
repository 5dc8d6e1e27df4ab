//! Sealed block layout shared by the scanner and the reference oracle.
//!
//! A sealed file is a run of blocks, each at most [`BLOCK_SIZE`] bytes:
//!
//! ```text
//! [magic "EVB1"][version u32][index u32][payload_len u16][flags u16][crc32 u32]  (20 bytes)
//! [ciphertext; payload_len]
//! [blake3 keyed MAC over header + ciphertext]                                      (32 bytes)
//! ```
//!
//! Every block except the last carries exactly [`PAYLOAD_CAPACITY`] payload bytes.
//! The header is readable without any key, which is what lets the scanner recover
//! the version tag cheaply. The tag is only a hint: the MAC and keystream are bound
//! to the version the block was actually sealed with.
//!
//! Detection is by prefix only. Unencrypted content that happens to begin with
//! `EVB1` is not taken for plaintext: it fails to parse as a block stream and the
//! file is reported as malformed, never repaired.

use anyhow::{Context, Result};
use crc32fast::Hasher as Crc32;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 8192;
pub const BLOCK_MAGIC: &[u8; 4] = b"EVB1";
pub const HEADER_LEN: usize = 4 + 4 + 4 + 2 + 2 + 4; // magic + version + index + len + flags + crc
pub const MAC_LEN: usize = 32;
pub const PAYLOAD_CAPACITY: usize = BLOCK_SIZE - HEADER_LEN - MAC_LEN;
pub const FLAG_FINAL: u16 = 0x0001;

const KEY_CONTEXT: &str = "encfix 2024-05 master key";
const ENC_CONTEXT: &str = "encfix 2024-05 block keystream";
const MAC_CONTEXT: &str = "encfix 2024-05 block mac";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("bad block magic")]
    BadMagic,
    #[error("header CRC mismatch")]
    BadCrc,
    #[error("payload length {0} exceeds block capacity")]
    Oversize(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub index: u32,
    pub payload_len: u16,
    pub flags: u16,
}

impl BlockHeader {
    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }

    /// Bytes that follow the header on disk.
    pub fn body_len(&self) -> usize {
        self.payload_len as usize + MAC_LEN
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(BLOCK_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.index.to_le_bytes());
        buf[12..14].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[14..16].copy_from_slice(&self.flags.to_le_bytes());
        let mut h = Crc32::new();
        h.update(&buf[..16]);
        buf[16..20].copy_from_slice(&h.finalize().to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        if &buf[0..4] != BLOCK_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let mut h = Crc32::new();
        h.update(&buf[..16]);
        let mut crc4 = [0u8; 4];
        crc4.copy_from_slice(&buf[16..20]);
        if h.finalize() != u32::from_le_bytes(crc4) {
            return Err(HeaderError::BadCrc);
        }
        let mut v4 = [0u8; 4];
        v4.copy_from_slice(&buf[4..8]);
        let mut i4 = [0u8; 4];
        i4.copy_from_slice(&buf[8..12]);
        let payload_len = u16::from_le_bytes([buf[12], buf[13]]);
        let flags = u16::from_le_bytes([buf[14], buf[15]]);
        if payload_len as usize > PAYLOAD_CAPACITY {
            return Err(HeaderError::Oversize(payload_len));
        }
        Ok(Self {
            version: u32::from_le_bytes(v4),
            index: u32::from_le_bytes(i4),
            payload_len,
            flags,
        })
    }
}

/// One step of walking a block stream.
#[derive(Debug)]
pub enum BlockRead {
    /// Clean end of stream on a block boundary.
    End,
    /// Stream ended inside a block after `got` bytes.
    Torn { got: usize },
    /// A full header was read but did not parse.
    BadHeader(HeaderError),
    /// A whole block; its ciphertext and MAC are in the caller's buffer.
    Block(BlockHeader),
}

/// Fill `buf` as far as the reader allows; returns the number of bytes read.
pub fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Read the next block. On `Block`, `body` holds `payload_len + MAC_LEN` bytes.
pub fn read_block<R: Read>(r: &mut R, body: &mut Vec<u8>) -> io::Result<BlockRead> {
    let mut hdr = [0u8; HEADER_LEN];
    let got = read_up_to(r, &mut hdr)?;
    if got == 0 {
        return Ok(BlockRead::End);
    }
    if got < HEADER_LEN {
        return Ok(BlockRead::Torn { got });
    }
    let header = match BlockHeader::decode(&hdr) {
        Ok(h) => h,
        Err(e) => return Ok(BlockRead::BadHeader(e)),
    };
    body.resize(header.body_len(), 0);
    let n = read_up_to(r, body)?;
    if n < body.len() {
        return Ok(BlockRead::Torn { got: HEADER_LEN + n });
    }
    Ok(BlockRead::Block(header))
}

/// Secret from which per-version block keys are derived.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, secret))
    }

    /// Derive the key from the raw bytes of a secret file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let secret =
            std::fs::read(path).with_context(|| format!("read key file {}", path.display()))?;
        anyhow::ensure!(!secret.is_empty(), "key file {} is empty", path.display());
        Ok(Self::from_secret(&secret))
    }

    pub(crate) fn version_keys(&self, version: u32) -> VersionKeys {
        let mut material = [0u8; 36];
        material[..32].copy_from_slice(&self.0);
        material[32..].copy_from_slice(&version.to_le_bytes());
        VersionKeys {
            enc: blake3::derive_key(ENC_CONTEXT, &material),
            mac: blake3::derive_key(MAC_CONTEXT, &material),
        }
    }
}

pub(crate) struct VersionKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl VersionKeys {
    pub(crate) fn apply_keystream(&self, index: u32, data: &mut [u8]) {
        let mut h = blake3::Hasher::new_keyed(&self.enc);
        h.update(&index.to_le_bytes());
        let mut ks = vec![0u8; data.len()];
        h.finalize_xof().fill(&mut ks);
        for (b, k) in data.iter_mut().zip(ks) {
            *b ^= k;
        }
    }

    pub(crate) fn mac(&self, header: &[u8; HEADER_LEN], ciphertext: &[u8]) -> blake3::Hash {
        let mut h = blake3::Hasher::new_keyed(&self.mac);
        h.update(header);
        h.update(ciphertext);
        h.finalize()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SealSummary {
    pub blocks: u32,
    pub plaintext_len: u64,
}

/// Encrypt `input` into sealed blocks tagged and keyed with `version`.
///
/// Empty input produces empty output.
pub fn seal<R: Read, W: Write>(
    mut input: R,
    mut out: W,
    key: &MasterKey,
    version: u32,
) -> io::Result<SealSummary> {
    let keys = key.version_keys(version);
    let mut summary = SealSummary::default();
    let mut cur = vec![0u8; PAYLOAD_CAPACITY];
    let mut cur_len = read_up_to(&mut input, &mut cur)?;
    let mut next = vec![0u8; PAYLOAD_CAPACITY];
    while cur_len > 0 {
        let next_len = read_up_to(&mut input, &mut next)?;
        let header = BlockHeader {
            version,
            index: summary.blocks,
            payload_len: cur_len as u16,
            flags: if next_len == 0 { FLAG_FINAL } else { 0 },
        };
        let hdr = header.encode();
        let payload = &mut cur[..cur_len];
        keys.apply_keystream(header.index, payload);
        let mac = keys.mac(&hdr, payload);
        out.write_all(&hdr)?;
        out.write_all(payload)?;
        out.write_all(mac.as_bytes())?;
        summary.blocks += 1;
        summary.plaintext_len += cur_len as u64;
        std::mem::swap(&mut cur, &mut next);
        cur_len = next_len;
    }
    out.flush()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_survives_encode_decode() {
        let h = BlockHeader { version: 7, index: 3, payload_len: 100, flags: FLAG_FINAL };
        let got = BlockHeader::decode(&h.encode()).unwrap();
        assert_eq!(got, h);
        assert!(got.is_final());
    }

    #[test]
    fn header_crc_catches_flipped_tag() {
        let h = BlockHeader { version: 2, index: 0, payload_len: 10, flags: 0 };
        let mut raw = h.encode();
        raw[4] ^= 0x01;
        assert_eq!(BlockHeader::decode(&raw), Err(HeaderError::BadCrc));
    }

    #[test]
    fn seal_splits_on_capacity() {
        let key = MasterKey::from_secret(b"k");
        let data = vec![0x42u8; PAYLOAD_CAPACITY * 2 + 5];
        let mut out = Vec::new();
        let s = seal(&data[..], &mut out, &key, 4).unwrap();
        assert_eq!(s.blocks, 3);
        assert_eq!(s.plaintext_len, data.len() as u64);
        assert_eq!(out.len(), 2 * BLOCK_SIZE + HEADER_LEN + 5 + MAC_LEN);
        // Ciphertext must not leak the plaintext pattern.
        assert_ne!(&out[HEADER_LEN..HEADER_LEN + 16], &data[..16]);
    }

    #[test]
    fn seal_of_empty_input_is_empty() {
        let key = MasterKey::from_secret(b"k");
        let mut out = Vec::new();
        let s = seal(&b""[..], &mut out, &key, 1).unwrap();
        assert_eq!(s.blocks, 0);
        assert!(out.is_empty());
    }
}
