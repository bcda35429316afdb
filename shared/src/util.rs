use rand::Rng;

/// Generates a random string for cryptographic usage from the given rune set.
pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = rand::rng();

    (0..n)
        .map(|_| {
            let idx = rng.random_range(0..runes.len());
            runes[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod util_test {
    use super::*;

    #[test]
    fn test_generate_crypto_random_string() {
        let s = generate_crypto_random_string(16, b"ab");
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }
}
