use super::KeyValueStorage;
use crate::error::DocFiscalResult;
use std::sync::Arc;

pub const AUTH_TOKEN_STORAGE_KEY: &str = "docfiscal-auth-token";

/// Bearer token kept alongside the rest of the session state
#[derive(Clone)]
pub struct AuthTokenStore {
    storage: Arc<dyn KeyValueStorage>,
}

impl AuthTokenStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    pub fn token(&self) -> DocFiscalResult<Option<String>> {
        self.storage.get(AUTH_TOKEN_STORAGE_KEY)
    }

    pub fn set_token(&self, token: &str) -> DocFiscalResult<()> {
        self.storage.set(AUTH_TOKEN_STORAGE_KEY, token)
    }

    pub fn clear(&self) -> DocFiscalResult<()> {
        self.storage.remove(AUTH_TOKEN_STORAGE_KEY)
    }
}
