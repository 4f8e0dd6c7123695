//! Content-hash dispatch and the two-level on-disk layout.
//!
//! Files are addressed purely by their hex digest. The digest algorithm is
//! selected from the hash length (32 hex chars for MD5, 40 for SHA-1), and
//! every storage backend stores a file under `<first-two-hex>/<hash>` so
//! enumeration can walk the 256 possible prefix directories.

use crate::error::{EdgeError, Result};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Digest algorithm selected from the hash length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha1,
}

impl HashAlgo {
    /// Select the digest algorithm for a hex hash string.
    pub fn for_hash(hash: &str) -> Result<Self> {
        match hash.len() {
            32 => Ok(HashAlgo::Md5),
            40 => Ok(HashAlgo::Sha1),
            n => Err(EdgeError::UnknownHash(n)),
        }
    }

    /// Start a streaming hasher for this algorithm.
    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgo::Md5 => Hasher::Md5(Md5::new()),
            HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
        }
    }
}

/// Streaming hasher producing a lowercase hex digest.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
        }
    }

    pub fn finish_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

/// Relative two-level filename for a hash: `<hash[0:2]>/<hash>`.
pub fn hash_to_filename(hash: &str) -> String {
    format!("{}/{}", &hash[..2], hash)
}

/// Absolute path of a hash under a storage root.
pub fn cached_hash_path(root: &Path, hash: &str) -> PathBuf {
    root.join(&hash[..2]).join(hash)
}

/// The 256 two-character hex prefixes, in order.
pub fn hex_prefixes() -> impl Iterator<Item = String> {
    (0u16..256).map(|i| format!("{:02x}", i))
}

/// Quick sanity check that a string looks like a content hash. The serve
/// path uses this to reject junk before touching storage.
pub fn looks_like_hash(hash: &str) -> bool {
    (hash.len() == 32 || hash.len() == 40) && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algo_dispatch() {
        assert_eq!(HashAlgo::for_hash(&"a".repeat(32)).unwrap(), HashAlgo::Md5);
        assert_eq!(HashAlgo::for_hash(&"b".repeat(40)).unwrap(), HashAlgo::Sha1);
        for n in [0, 31, 33, 41, 64] {
            match HashAlgo::for_hash(&"c".repeat(n)) {
                Err(EdgeError::UnknownHash(len)) => assert_eq!(len, n),
                other => panic!("expected UnknownHash, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_known_digests() {
        // md5("abc") and sha1("abc")
        let mut h = HashAlgo::Md5.hasher();
        h.update(b"abc");
        assert_eq!(h.finish_hex(), "900150983cd24fb0d6963f7d28e17f72");

        let mut h = HashAlgo::Sha1.hasher();
        h.update(b"abc");
        assert_eq!(h.finish_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_hash_layout() {
        let hash = "a9993e364706816aba3e25717850c26c9cd0d89d";
        assert_eq!(
            hash_to_filename(hash),
            "a9/a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        let p = cached_hash_path(Path::new("/base/cache"), hash);
        assert_eq!(
            p,
            Path::new("/base/cache/a9/a9993e364706816aba3e25717850c26c9cd0d89d")
        );
    }

    #[test]
    fn test_hex_prefixes() {
        let all: Vec<String> = hex_prefixes().collect();
        assert_eq!(all.len(), 256);
        assert_eq!(all[0], "00");
        assert_eq!(all[255], "ff");
    }

    #[test]
    fn test_looks_like_hash() {
        assert!(looks_like_hash(&"a".repeat(32)));
        assert!(looks_like_hash(&"f".repeat(40)));
        assert!(!looks_like_hash(&"g".repeat(32)));
        assert!(!looks_like_hash("abc"));
        assert!(!looks_like_hash("../../../../etc/passwd"));
    }
}
