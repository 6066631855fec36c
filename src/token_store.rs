use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::error::SyncResult;

/// File-backed token storage for a single provider.
#[derive(Debug, Clone)]
pub struct TokenStore<C> {
    path: PathBuf,
    _credential: PhantomData<fn() -> C>,
}

impl<C: Credential> TokenStore<C> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _credential: PhantomData,
        }
    }

    /// Loads the stored token. Missing or unreadable files yield `None` so the
    /// caller falls through to a fresh authorization.
    pub fn read(&self) -> Option<C> {
        if !self.path.exists() {
            info!("No token file at {}", self.path.display());
            return None;
        }

        debug!("Loading token from: {}", self.path.display());
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not read token file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Ignoring unparsable token file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Persists the token through a temp file and rename, so readers never
    /// see a half-written record.
    pub fn write(&self, token: &C) -> SyncResult<()> {
        debug!("Saving token to: {}", self.path.display());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(token).map_err(std::io::Error::from)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;

        // Restrict before the rename so the token is never world-readable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600)) {
                warn!("Could not restrict permissions on {}: {}", temp_path.display(), e);
            }
        }

        fs::rename(&temp_path, &self.path)?;

        info!("Saved token to {}", self.path.display());
        Ok(())
    }

    /// Writes raw JSON injected from outside (e.g. a secret store) after
    /// checking it parses as this provider's token format.
    pub fn import_json(&self, raw: &str) -> SyncResult<()> {
        let token: C = serde_json::from_str(raw).map_err(|e| {
            crate::error::SyncError::configuration(format!(
                "injected token for {} is not valid: {}",
                self.path.display(),
                e
            ))
        })?;
        self.write(&token)
    }
}
