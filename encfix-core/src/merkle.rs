/// Incremental Merkle checksum over decrypted block payloads.
///
/// Leaves are BLAKE3 hashes of each plaintext block. Interior nodes hash the
/// concatenation of their children; an odd node is paired with itself.
#[derive(Debug, Default, Clone)]
pub struct PlaintextDigest {
    leaves: Vec<[u8; 32]>,
    total_len: u64,
}

impl PlaintextDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_block(&mut self, plaintext: &[u8]) {
        self.leaves.push(*blake3::hash(plaintext).as_bytes());
        self.total_len += plaintext.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn finish(self) -> blake3::Hash {
        root(&self.leaves)
    }
}

pub fn root(leaves: &[[u8; 32]]) -> blake3::Hash {
    if leaves.is_empty() {
        return blake3::hash(&[]);
    }
    let mut layer = leaves.to_vec();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut h = blake3::Hasher::new();
                h.update(&pair[0]);
                h.update(right);
                *h.finalize().as_bytes()
            })
            .collect();
    }
    blake3::Hash::from(layer[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_is_its_own_root() {
        let mut d = PlaintextDigest::new();
        d.push_block(b"abc");
        assert_eq!(d.len(), 3);
        assert_eq!(d.finish(), blake3::hash(b"abc"));
    }

    #[test]
    fn block_order_changes_root() {
        let mut a = PlaintextDigest::new();
        a.push_block(b"one");
        a.push_block(b"two");
        a.push_block(b"three");
        let mut b = PlaintextDigest::new();
        b.push_block(b"two");
        b.push_block(b"one");
        b.push_block(b"three");
        assert_ne!(a.finish(), b.finish());
    }
}
