use crate::format::{read_block, read_up_to, BlockRead, BLOCK_MAGIC, PAYLOAD_CAPACITY};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("malformed block layout at block {block}: {reason}")]
    Malformed { block: u32, reason: String },
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// What a header-only pass over a file's blocks found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockScan {
    /// Tag of the final complete block; 0 for unsealed content.
    pub version: u32,
    /// Adjacent block pairs whose tags differ.
    pub transitions: u32,
    pub blocks: u32,
    /// Content ended inside a block or before the block marked final.
    pub torn_tail: bool,
    pub sealed: bool,
}

impl BlockScan {
    fn plain() -> Self {
        Self { version: 0, transitions: 0, blocks: 0, torn_tail: false, sealed: false }
    }
}

fn malformed(block: u32, reason: impl Into<String>) -> ScanError {
    ScanError::Malformed { block, reason: reason.into() }
}

/// Walk block headers and report the embedded version tag without decrypting.
///
/// Returns `None` for empty content. Content that does not start with the block
/// magic is treated as plaintext (version 0); content that starts with it but
/// is not a valid block stream is [`ScanError::Malformed`]. When blocks
/// disagree the tag of the final complete block wins, since appends and
/// truncation happen at the tail.
pub fn scan<R: Read>(reader: R) -> Result<Option<BlockScan>, ScanError> {
    let mut reader = BufReader::new(reader);
    let mut magic = [0u8; 4];
    let n = read_up_to(&mut reader, &mut magic)?;
    if n == 0 {
        return Ok(None);
    }
    if n < magic.len() || &magic != BLOCK_MAGIC {
        return Ok(Some(BlockScan::plain()));
    }

    let mut stream = io::Cursor::new(magic).chain(reader);
    let mut body = Vec::with_capacity(PAYLOAD_CAPACITY + 32);
    let mut blocks = 0u32;
    let mut transitions = 0u32;
    let mut last_version: Option<u32> = None;
    let mut seen_final = false;
    let mut torn_tail = false;
    loop {
        match read_block(&mut stream, &mut body)? {
            BlockRead::End => {
                torn_tail = !seen_final;
                break;
            }
            BlockRead::Torn { .. } => {
                torn_tail = true;
                break;
            }
            BlockRead::BadHeader(e) => return Err(malformed(blocks, e.to_string())),
            BlockRead::Block(h) => {
                if seen_final {
                    return Err(malformed(blocks, "data after final block"));
                }
                if h.index != blocks {
                    return Err(malformed(blocks, format!("block index {} out of order", h.index)));
                }
                if !h.is_final() && h.payload_len as usize != PAYLOAD_CAPACITY {
                    return Err(malformed(blocks, "short block before end of stream"));
                }
                if let Some(prev) = last_version {
                    if prev != h.version {
                        transitions += 1;
                    }
                }
                last_version = Some(h.version);
                seen_final = h.is_final();
                blocks += 1;
            }
        }
    }

    match last_version {
        Some(version) => {
            Ok(Some(BlockScan { version, transitions, blocks, torn_tail, sealed: true }))
        }
        None => Err(malformed(0, "no complete block")),
    }
}

pub fn scan_path(path: &Path) -> Result<Option<BlockScan>, ScanError> {
    scan(File::open(path)?)
}
