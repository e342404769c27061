//! Credential capability and the coordinator that owns cached tokens and
//! invalid-token counting.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::status;
use crate::types::{BoxError, Error};

/// Called with the new token whenever a provider's credential changes.
pub type TokenListener = Box<dyn Fn(Option<String>) + Send + Sync>;

/// A source of credentials (auth or app-check).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch the current token. `Ok(None)` means "no credential".
    async fn get_token(&self, force_refresh: bool) -> Result<Option<String>, BoxError>;

    /// Register for credential changes.
    fn add_token_change_listener(&self, _listener: TokenListener) {}

    /// The server keeps rejecting this provider's tokens.
    fn notify_for_invalid_token(&self) {}
}

/// Result of the concurrent pre-connect fetch. Each provider fails on its own.
#[derive(Debug)]
pub(crate) struct FetchedTokens {
    pub auth: Result<Option<String>, BoxError>,
    pub app_check: Result<Option<String>, BoxError>,
}

/// What the supervisor must do after a revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Revocation {
    /// The invalid-token threshold was reached on this revocation.
    pub escalate: bool,
}

pub(crate) struct TokenCoordinator {
    auth: Arc<dyn TokenProvider>,
    app_check: Option<Arc<dyn TokenProvider>>,
    auth_token: Option<String>,
    app_check_token: Option<String>,
    force_auth_refresh: bool,
    force_app_check_refresh: bool,
    invalid_auth_count: u32,
    invalid_app_check_count: u32,
    threshold: u32,
}

impl TokenCoordinator {
    pub fn new(
        auth: Arc<dyn TokenProvider>,
        app_check: Option<Arc<dyn TokenProvider>>,
        threshold: u32,
    ) -> Self {
        Self {
            auth,
            app_check,
            auth_token: None,
            app_check_token: None,
            force_auth_refresh: false,
            force_app_check_refresh: false,
            invalid_auth_count: 0,
            invalid_app_check_count: 0,
            threshold,
        }
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn app_check_token(&self) -> Option<&str> {
        self.app_check_token.as_deref()
    }

    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.auth_token = token.filter(|t| !t.is_empty());
    }

    pub fn set_app_check_token(&mut self, token: Option<String>) {
        self.app_check_token = token.filter(|t| !t.is_empty());
    }

    /// Build the fetch for the next connect attempt. Consumes the
    /// force-refresh flags; both providers are queried concurrently.
    pub fn prepare_for_connect(
        &mut self,
    ) -> impl Future<Output = FetchedTokens> + Send + use<> {
        let force_auth = std::mem::take(&mut self.force_auth_refresh);
        let force_app_check = std::mem::take(&mut self.force_app_check_refresh);
        let auth = Arc::clone(&self.auth);
        let app_check = self.app_check.clone();
        async move {
            let app_check_fetch = async {
                match app_check {
                    Some(provider) => provider.get_token(force_app_check).await,
                    None => Ok(None),
                }
            };
            let (auth, app_check) = tokio::join!(auth.get_token(force_auth), app_check_fetch);
            FetchedTokens { auth, app_check }
        }
    }

    /// Cache the fetched tokens. An auth failure fails the attempt; an
    /// app-check failure only drops the app-check token.
    pub fn apply_fetched(&mut self, fetched: FetchedTokens) -> Result<(), Error> {
        match fetched.app_check {
            Ok(token) => self.set_app_check_token(token),
            Err(e) => {
                tracing::warn!("Failed to get app check token: {e}");
                self.app_check_token = None;
            }
        }
        let token = fetched.auth.map_err(Error::TokenFetch)?;
        self.set_auth_token(token);
        Ok(())
    }

    pub fn on_auth_accepted(&mut self) {
        self.invalid_auth_count = 0;
    }

    pub fn on_app_check_accepted(&mut self) {
        self.invalid_app_check_count = 0;
    }

    /// Drop the cached auth token and force a refresh on the next attempt.
    /// The caller closes the connection.
    pub fn on_auth_revoked(&mut self, status: &str, explanation: &str) -> Revocation {
        tracing::info!(status, explanation, "Auth token revoked");
        self.auth_token = None;
        self.force_auth_refresh = true;
        let escalate = Self::count_invalid(&mut self.invalid_auth_count, self.threshold, status);
        if escalate {
            self.auth.notify_for_invalid_token();
        }
        Revocation { escalate }
    }

    /// Same counting as auth, but app-check enforcement is optional so the
    /// connection stays open.
    pub fn on_app_check_revoked(&mut self, status: &str, explanation: &str) -> Revocation {
        tracing::info!(status, explanation, "App check token revoked");
        self.app_check_token = None;
        self.force_app_check_refresh = true;
        let escalate =
            Self::count_invalid(&mut self.invalid_app_check_count, self.threshold, status);
        if escalate && let Some(provider) = &self.app_check {
            provider.notify_for_invalid_token();
        }
        Revocation { escalate }
    }

    fn count_invalid(count: &mut u32, threshold: u32, code: &str) -> bool {
        if code != status::INVALID_TOKEN && code != status::PERMISSION_DENIED {
            return false;
        }
        *count += 1;
        if *count >= threshold {
            tracing::warn!(count = *count, "Token rejected repeatedly, backing off");
            *count = 0;
            return true;
        }
        false
    }
}
