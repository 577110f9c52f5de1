//! Bearer token holder shared by the HTTP client and the lease worker.

use secrecy::SecretString;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct Credentials {
    token: RwLock<Option<SecretString>>,
}

impl Credentials {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Install or rotate the token.
    pub async fn set_token(&self, token: SecretString) {
        *self.token.write().await = Some(token);
        tracing::info!("Authentication token installed");
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }

    pub async fn token(&self) -> Option<SecretString> {
        self.token.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }
}
