use std::collections::HashMap;

use thiserror::Error;

use crate::config::AuthConfig;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,
    #[error("Invalid credentials")]
    InvalidToken,
}

/// Bearer-token verification against a static token table.
///
/// Authorization scoping (which principal may touch which board) is
/// delegated to the storage layer's own access control; this only
/// establishes that a known caller is present.
#[derive(Clone)]
pub struct Authentication {
    // token -> principal
    tokens: HashMap<String, String>,
}

impl Authentication {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.pairs())
    }

    /// Verify an `Authorization` header value and return the principal.
    pub fn authorize(&self, header: Option<&str>) -> Result<&str, AuthError> {
        let header = header.ok_or(AuthError::MissingCredential)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::MissingCredential)?
            .trim();

        self.tokens
            .get(token)
            .map(String::as_str)
            .ok_or(AuthError::InvalidToken)
    }
}
