//! Base62 alphabet utilities used for short-token generation.

use rand::Rng;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Returns the base62 alphabet as bytes.
pub fn alphabet() -> &'static [u8] {
    &ALPHABET[..]
}

/// True when `s` is non-empty and made only of base62 symbols.
pub fn is_base62(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Draw `len` symbols uniformly from the alphabet.
pub fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    let symbols = alphabet();
    (0..len)
        .map(|_| symbols[rng.gen_range(0..symbols.len())] as char)
        .collect()
}
