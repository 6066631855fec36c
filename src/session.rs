use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::auth::{Credential, OAuthProvider, Pkce};
use crate::callback::{CodeGrant, GrantRequest};
use crate::error::{SyncError, SyncResult};
use crate::token_store::TokenStore;

/// How the credential behind a connected session was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cached,
    Refreshed,
    Authorized,
}

/// A live session: the credential in force and the client derived from it.
/// Refreshing produces a new value rather than mutating this one.
pub struct Session<C, T> {
    pub credential: C,
    pub client: T,
    pub source: TokenSource,
}

/// Produces an authenticated client for one provider, refreshing or
/// re-authorizing as needed.
pub struct ProviderSession<P: OAuthProvider> {
    provider: P,
    store: TokenStore<P::Credential>,
    grant: Arc<dyn CodeGrant>,
    interactive: bool,
}

impl<P: OAuthProvider> ProviderSession<P> {
    pub fn new(
        provider: P,
        store: TokenStore<P::Credential>,
        grant: Arc<dyn CodeGrant>,
        interactive: bool,
    ) -> Self {
        Self {
            provider,
            store,
            grant,
            interactive,
        }
    }

    pub fn store(&self) -> &TokenStore<P::Credential> {
        &self.store
    }

    pub async fn connect(&self) -> SyncResult<P::Client> {
        Ok(self.open().await?.client)
    }

    pub async fn open(&self) -> SyncResult<Session<P::Credential, P::Client>> {
        let name = self.provider.name();

        if let Some(cached) = self.store.read() {
            if !cached.is_expired(Utc::now()) {
                info!("Using cached {} token", name);
                return self.session(cached, TokenSource::Cached);
            }

            info!("{} token expired", name);
            if let Some(refreshed) = self.try_refresh(&cached).await? {
                return self.session(refreshed, TokenSource::Refreshed);
            }
        }

        self.reauthorize().await
    }

    /// Refreshes the stored credential even if it is still valid, falling
    /// back to a fresh authorization when there is nothing to refresh with.
    pub async fn refresh_now(&self) -> SyncResult<Session<P::Credential, P::Client>> {
        if let Some(cached) = self.store.read() {
            info!("Refreshing {} token", self.provider.name());
            if let Some(refreshed) = self.try_refresh(&cached).await? {
                return self.session(refreshed, TokenSource::Refreshed);
            }
        }

        self.reauthorize().await
    }

    /// `Ok(None)` when the credential has no refresh token or the provider
    /// rejected it; the new credential is persisted on success.
    async fn try_refresh(&self, cached: &P::Credential) -> SyncResult<Option<P::Credential>> {
        let name = self.provider.name();
        if cached.refresh_token().is_none() {
            info!("{} token cannot be refreshed", name);
            return Ok(None);
        }

        match self.provider.refresh(cached).await {
            Ok(refreshed) => {
                self.store.write(&refreshed)?;
                Ok(Some(refreshed))
            }
            Err(e) => {
                let e = SyncError::token_refresh(name, e.to_string());
                warn!("{}; falling back to interactive authorization", e);
                Ok(None)
            }
        }
    }

    async fn reauthorize(&self) -> SyncResult<Session<P::Credential, P::Client>> {
        let authorized = self.authorize().await?;
        self.store.write(&authorized)?;
        self.session(authorized, TokenSource::Authorized)
    }

    async fn authorize(&self) -> SyncResult<P::Credential> {
        let name = self.provider.name();
        self.provider.check_configured()?;

        if !self.interactive {
            return Err(SyncError::AuthorizationRequired {
                provider: name.to_string(),
            });
        }

        let pkce = Pkce::new();
        let redirect_uri = |port: u16| self.provider.redirect_uri(port);
        let authorization_url = |redirect: &str| self.provider.authorization_url(redirect, &pkce);
        let code = self
            .grant
            .obtain_code(GrantRequest {
                provider: name,
                port: self.provider.redirect_port(),
                state: &pkce.state,
                redirect_uri: &redirect_uri,
                authorization_url: &authorization_url,
            })
            .await?;

        info!("Exchanging {} authorization code for tokens", name);
        self.provider
            .exchange_code(&code.code, &code.redirect_uri, &pkce.verifier)
            .await
    }

    fn session(
        &self,
        credential: P::Credential,
        source: TokenSource,
    ) -> SyncResult<Session<P::Credential, P::Client>> {
        let client = self.provider.client(&credential)?;
        Ok(Session {
            credential,
            client,
            source,
        })
    }
}
