//! Short-token generation and custom-token validation.

use rand::rngs::OsRng;
use rand::Rng;

use crate::base62::{is_base62, random_string};
use crate::{CoreError, LinkRepository, ShortToken, TokenGenerator};

/// Path segments owned by the service itself. Compared case-insensitively.
pub const RESERVED_ROUTES: [&str; 3] = ["api", "docs", "not-found"];

/// Bound on candidate draws before giving up.
pub const GENERATION_ATTEMPTS: usize = 10;

/// Shortest and longest generated token.
pub const MIN_GENERATED_LEN: usize = 3;
pub const MAX_GENERATED_LEN: usize = 6;

/// Draws tokens of random length in `3..=6` from the OS CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn next_token(&self) -> String {
        let mut rng = OsRng;
        let len = rng.gen_range(MIN_GENERATED_LEN..=MAX_GENERATED_LEN);
        random_string(&mut rng, len)
    }
}

pub fn is_reserved(candidate: &str) -> bool {
    RESERVED_ROUTES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(candidate))
}

/// A token is taken when it names a reserved route or any stored link,
/// active or not.
pub fn is_taken<L: LinkRepository + ?Sized>(repo: &L, token: &ShortToken) -> Result<bool, CoreError> {
    if is_reserved(token.as_str()) {
        return Ok(true);
    }
    Ok(repo.get(token)?.is_some())
}

/// Allocate a fresh token, retrying up to [`GENERATION_ATTEMPTS`] times.
pub fn generate_unique<L, G>(repo: &L, generator: &G) -> Result<ShortToken, CoreError>
where
    L: LinkRepository + ?Sized,
    G: TokenGenerator + ?Sized,
{
    for _ in 0..GENERATION_ATTEMPTS {
        let Ok(candidate) = ShortToken::new(generator.next_token()) else {
            continue;
        };
        if !is_taken(repo, &candidate)? {
            return Ok(candidate);
        }
    }
    Err(CoreError::GenerationExhausted(GENERATION_ATTEMPTS))
}

/// Check a caller-supplied token: purely alphanumeric, not reserved, not in use.
pub fn validate_custom<L: LinkRepository + ?Sized>(
    repo: &L,
    candidate: &str,
) -> Result<ShortToken, CoreError> {
    if !is_base62(candidate) {
        return Err(CoreError::InvalidToken(
            "custom url must be alphanumeric".into(),
        ));
    }
    let token = ShortToken::new(candidate)?;
    if is_taken(repo, &token)? {
        return Err(CoreError::TokenTaken);
    }
    Ok(token)
}
