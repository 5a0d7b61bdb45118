//! SHA3-256 digests used to check stored artifacts against their source.

use sha3::{Digest, Sha3_256};

/// Lower-case hex SHA3-256 of `data`.
pub fn sha3_hex(data: &[u8]) -> String {
    let digest = Sha3_256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_digest() {
        assert_eq!(
            sha3_hex(b""),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn digest_differs_per_input() {
        assert_ne!(sha3_hex(b"a"), sha3_hex(b"b"));
        assert_eq!(sha3_hex(b"a").len(), 64);
    }
}
