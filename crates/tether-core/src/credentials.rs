use secrecy::SecretString;

/// Server endpoint plus bearer credential for the current session.
#[derive(Clone)]
pub struct SessionCredentials {
    pub server_url: String,
    pub token: SecretString,
}

impl SessionCredentials {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: SecretString::from(token.into()),
        }
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Token stays redacted
        f.debug_struct("SessionCredentials")
            .field("server_url", &self.server_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Source of the current session credentials.
///
/// Clients call [`CredentialSource::current`] on every connection attempt so
/// a rotated token or changed server URL is picked up across reconnects
/// instead of reusing a stale snapshot.
pub trait CredentialSource: Send + Sync {
    fn current(&self) -> SessionCredentials;
}

/// Fixed credentials, for tools and tests.
pub struct StaticCredentials {
    credentials: SessionCredentials,
}

impl StaticCredentials {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            credentials: SessionCredentials::new(server_url, token),
        }
    }
}

impl CredentialSource for StaticCredentials {
    fn current(&self) -> SessionCredentials {
        self.credentials.clone()
    }
}
