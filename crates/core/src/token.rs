//! Server bearer tokens.

use rand::Rng;

use crate::error::CoreError;

/// Length of a generated server token.
pub const TOKEN_LENGTH: usize = 48;

/// Shortest token accepted from configuration.
const MIN_TOKEN_LENGTH: usize = 16;

/// Generate a new random alphanumeric server token.
///
/// Tokens are generated once when the server row is created and never
/// rotated.
pub fn generate_server_token() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Check that a configured token is plausible before it is used to look up
/// a server row.
pub fn validate_token(token: &str) -> Result<(), CoreError> {
    if token.len() < MIN_TOKEN_LENGTH {
        return Err(CoreError::Validation(format!(
            "Server token must be at least {MIN_TOKEN_LENGTH} characters"
        )));
    }
    if !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(CoreError::Validation(
            "Server token may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}
