//! Bearer-token sources for the streaming request.

use secrecy::{ExposeSecret, SecretString};

/// Supplies the bearer token used to authorize backend calls.
/// `None` means the user is not signed in; callers must not issue the request.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<SecretString>;
}

/// A fixed token (tests, offline replay, tokens handed over by a login flow).
pub struct StaticToken(Option<SecretString>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(SecretString::from(token.into())))
    }

    pub fn absent() -> Self {
        Self(None)
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<SecretString> {
        let token = self.0.as_ref()?.expose_secret().trim();
        (!token.is_empty()).then(|| SecretString::from(token.to_string()))
    }
}

/// Reads the token from an environment variable on every call, so a token
/// refreshed by another component is picked up by the next session.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenSource for EnvToken {
    fn bearer_token(&self) -> Option<SecretString> {
        std::env::var(&self.var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_exposes_value() {
        let t = StaticToken::new("abc").bearer_token().unwrap();
        assert_eq!(t.expose_secret(), "abc");
    }

    #[test]
    fn blank_static_token_counts_as_absent() {
        assert!(StaticToken::new("   ").bearer_token().is_none());
        assert!(StaticToken::absent().bearer_token().is_none());
    }

    #[test]
    fn env_token_missing_var_is_absent() {
        let src = EnvToken::new("CHATSTREAM_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert!(src.bearer_token().is_none());
    }
}
