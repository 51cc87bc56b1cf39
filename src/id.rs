//! Generates the per-connection identifier (spec §3: "16-char base-32 random
//! id"). Kept as a tiny hand-rolled helper rather than a dependency: the
//! alphabet and length are fixed by the spec and there is no decoding side
//! to justify pulling in a codec crate for it.

use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
const LENGTH: usize = 16;

/// Generates a fresh 16-character lowercase base-32 connection id.
pub fn generate_connection_id() -> String {
    let mut rng = rand::thread_rng();
    (0..LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sixteen_chars_from_the_alphabet() {
        for _ in 0..100 {
            let id = generate_connection_id();
            assert_eq!(id.len(), LENGTH);
            assert!(id.chars().all(|c| ALPHABET.contains(&(c as u8))));
        }
    }

    #[test]
    fn ids_are_not_trivially_repeated() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_ne!(a, b);
    }
}
