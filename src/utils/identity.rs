//! Local peer identities: short human-typable ids.

use crate::core::config::{PEER_ID_ALPHABET, PEER_ID_LENGTH};
use rand::Rng;

/// Mint a fresh random peer id (`PEER_ID_LENGTH` chars from `PEER_ID_ALPHABET`).
pub fn generate_peer_id() -> String {
    let alphabet = PEER_ID_ALPHABET.as_bytes();
    let mut rng = rand::rng();
    (0..PEER_ID_LENGTH)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

/// Whether `id` has the shape of a peer id.
pub fn is_valid_peer_id(id: &str) -> bool {
    id.len() == PEER_ID_LENGTH && id.chars().all(|c| PEER_ID_ALPHABET.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..200 {
            let id = generate_peer_id();
            assert!(is_valid_peer_id(&id), "{id}");
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(!is_valid_peer_id(""));
        assert!(!is_valid_peer_id("ABCDE"));
        assert!(!is_valid_peer_id("ABCDEFG"));
        // O and 0 are excluded from the alphabet.
        assert!(!is_valid_peer_id("ABCDE0"));
        assert!(!is_valid_peer_id("abcdef"));
        assert!(is_valid_peer_id("AB12CD"));
    }
}
