use rjw_types::ContentHash;

/// Domain-separated BLAKE3 content hasher.
///
/// The domain tag is prepended to every hash computation, so identical bytes
/// hashed under different domains yield different digests.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for generated document bytes.
    pub const DOCUMENT: Self = Self {
        domain: "rjw-document-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        ContentHash::from_hash(*hasher.finalize().as_bytes())
    }

    /// Verify that data produces the expected hash.
    pub fn verify(&self, data: &[u8], expected: &ContentHash) -> bool {
        self.hash(data) == *expected
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"dear test group";
        assert_eq!(ContentHasher::DOCUMENT.hash(data), ContentHasher::DOCUMENT.hash(data));
    }

    #[test]
    fn domains_separate_hashes() {
        let data = b"same content";
        let custom = ContentHasher::new("rjw-other-v1");
        assert_ne!(ContentHasher::DOCUMENT.hash(data), custom.hash(data));
        assert_eq!(custom.domain(), "rjw-other-v1");
    }

    #[test]
    fn verify_detects_tampering() {
        let id = ContentHasher::DOCUMENT.hash(b"original");
        assert!(ContentHasher::DOCUMENT.verify(b"original", &id));
        assert!(!ContentHasher::DOCUMENT.verify(b"tampered", &id));
    }

    #[test]
    fn differs_from_raw_blake3() {
        let raw = *blake3::hash(b"doc").as_bytes();
        assert_ne!(ContentHasher::DOCUMENT.hash(b"doc").as_bytes(), &raw);
    }

    proptest! {
        #[test]
        fn distinct_inputs_distinct_prefixes(a in proptest::collection::vec(any::<u8>(), 0..64),
                                             b in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assume!(a != b);
            let ha = ContentHasher::DOCUMENT.hash(&a);
            let hb = ContentHasher::DOCUMENT.hash(&b);
            prop_assert_ne!(ha.prefix(), hb.prefix());
        }
    }
}
