use anyhow::Result;
use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::args::Args;
use crate::callback::DEFAULT_TIMEOUT;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Cfg {
    pub fitbit: FitbitConfig,
    pub google: GoogleConfig,
    pub auth: AuthConfig,
    pub serverless: ServerlessConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FitbitConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_path: String,
    pub redirect_uri: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GoogleConfig {
    pub credentials_path: String,
    pub token_path: String,
    /// 0 binds an ephemeral port for the callback.
    pub redirect_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AuthConfig {
    pub callback_timeout_secs: u64,
    pub interactive: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerlessConfig {
    pub timeout_secs: u64,
}

const ENV_OVERRIDES: [&str; 5] = [
    "FITBIT_CLIENT_ID",
    "FITBIT_CLIENT_SECRET",
    "FITBIT_TOKEN_PATH",
    "GOOGLE_CREDENTIALS_PATH",
    "GOOGLE_TOKEN_PATH",
];

impl Cfg {
    pub fn load(args: &Args) -> Result<Self> {
        info!("Loading configuration from: {}", args.config);

        let mut cfg = Cfg::from_file(&args.config);
        cfg.apply_env(|key| std::env::var(key).ok());

        // Command line wins over file and environment
        if args.headless {
            debug!("Disabling interactive authorization from command line");
            cfg.auth.interactive = false;
        }

        debug!("Final configuration: {:?}", cfg.redacted());
        Ok(cfg)
    }

    /// Defaults overlaid with whatever keys the TOML file provides.
    pub fn from_file(path: &str) -> Self {
        let mut cfg = Cfg::default();

        if !std::path::Path::new(path).exists() {
            debug!("Config file not found, using defaults");
            return cfg;
        }

        let config = match Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()
        {
            Ok(config) => config,
            Err(e) => {
                debug!("Could not parse config file, using defaults: {}", e);
                return cfg;
            }
        };

        if let Ok(client_id) = config.get_string("fitbit.client_id") {
            cfg.fitbit.client_id = client_id;
        }
        if let Ok(client_secret) = config.get_string("fitbit.client_secret") {
            cfg.fitbit.client_secret = client_secret;
        }
        if let Ok(token_path) = config.get_string("fitbit.token_path") {
            cfg.fitbit.token_path = token_path;
        }
        if let Ok(redirect_uri) = config.get_string("fitbit.redirect_uri") {
            cfg.fitbit.redirect_uri = redirect_uri;
        }
        if let Ok(credentials_path) = config.get_string("google.credentials_path") {
            cfg.google.credentials_path = credentials_path;
        }
        if let Ok(token_path) = config.get_string("google.token_path") {
            cfg.google.token_path = token_path;
        }
        if let Ok(port) = config.get_int("google.redirect_port") {
            if let Ok(port) = u16::try_from(port) {
                cfg.google.redirect_port = port;
            }
        }
        if let Ok(timeout) = config.get_int("auth.callback_timeout_secs") {
            cfg.auth.callback_timeout_secs = timeout.max(0) as u64;
        }
        if let Ok(interactive) = config.get_bool("auth.interactive") {
            cfg.auth.interactive = interactive;
        }
        if let Ok(timeout) = config.get_int("serverless.timeout_secs") {
            cfg.serverless.timeout_secs = timeout.max(0) as u64;
        }

        debug!("Loaded configuration from file");
        cfg
    }

    /// Applies the credential environment variables; empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in ENV_OVERRIDES {
            let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
                continue;
            };
            debug!("Overriding {} from environment", key);
            match key {
                "FITBIT_CLIENT_ID" => self.fitbit.client_id = value,
                "FITBIT_CLIENT_SECRET" => self.fitbit.client_secret = value,
                "FITBIT_TOKEN_PATH" => self.fitbit.token_path = value,
                "GOOGLE_CREDENTIALS_PATH" => self.google.credentials_path = value,
                "GOOGLE_TOKEN_PATH" => self.google.token_path = value,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.callback_timeout_secs == 0 {
            anyhow::bail!("auth.callback_timeout_secs must be greater than zero");
        }
        if self.serverless.timeout_secs == 0 {
            anyhow::bail!("serverless.timeout_secs must be greater than zero");
        }

        let redirect = Url::parse(&self.fitbit.redirect_uri).map_err(|e| {
            anyhow::anyhow!("fitbit.redirect_uri {:?} is not a URL: {}", self.fitbit.redirect_uri, e)
        })?;
        if redirect.port_or_known_default().is_none() {
            anyhow::bail!("fitbit.redirect_uri must include a port");
        }

        if self.fitbit.token_path.is_empty() || self.google.token_path.is_empty() {
            anyhow::bail!("token paths cannot be empty");
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Copy safe to log.
    fn redacted(&self) -> Cfg {
        let mut copy = self.clone();
        if !copy.fitbit.client_secret.is_empty() {
            copy.fitbit.client_secret = "***".to_string();
        }
        copy
    }
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            fitbit: FitbitConfig {
                client_id: String::new(),
                client_secret: String::new(),
                token_path: "credentials/fitbit_token.json".to_string(),
                redirect_uri: "http://localhost:8080/".to_string(),
            },
            google: GoogleConfig {
                credentials_path: "credentials/google.json".to_string(),
                token_path: "credentials/google_token.json".to_string(),
                redirect_port: 0,
            },
            auth: AuthConfig {
                callback_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
                interactive: true,
            },
            serverless: ServerlessConfig { timeout_secs: 30 },
        }
    }
}
