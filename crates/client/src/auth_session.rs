//! Authenticated session and the URLs derived from it.
//!
//! The session (auth token plus tenant domain) is written by the login flow,
//! which lives outside this crate. The chat core only reads it.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::api_client::ApiClient;
use crate::config::ChatConfig;
use crate::storage::Storage;

const STORAGE_KEY: &str = "scholaris_session";

/// Stored session data
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub user_id: i64,
    #[serde(default)]
    pub token: Option<String>,
    /// Tenant (school) domain, e.g. "greenfield.scholaris.app".
    #[serde(default)]
    pub tenant_domain: Option<String>,
}

impl AuthSession {
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    fn tenant(&self) -> Option<&str> {
        self.tenant_domain
            .as_deref()
            .map(|d| {
                d.trim()
                    .trim_start_matches("http://")
                    .trim_start_matches("https://")
                    .trim_end_matches('/')
            })
            .filter(|d| !d.is_empty())
    }

    /// Base URL for REST calls: `https://{tenant}{api_path}` when the tenant is
    /// known, otherwise `http://{default_host}{api_path}`.
    pub fn api_base_url(&self, config: &ChatConfig) -> String {
        let api_path = config.api_path.trim_end_matches('/');
        match self.tenant() {
            Some(tenant) => format!("https://{}{}", tenant, api_path),
            None => format!("http://{}{}", config.default_host, api_path),
        }
    }

    /// Socket URL with the token as a query parameter; secure when the tenant
    /// is known. `None` when there is no token.
    pub fn ws_url(&self, config: &ChatConfig) -> Option<String> {
        if !self.is_authenticated() {
            return None;
        }
        let token = self.token.as_deref()?;
        let base = match self.tenant() {
            Some(tenant) => format!("wss://{}{}", tenant, config.ws_path),
            None => format!("ws://{}{}", config.default_host, config.ws_path),
        };
        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(e) => {
                crate::log_error!("Invalid socket URL {}: {}", base, e);
                return None;
            }
        };
        url.query_pairs_mut().append_pair("token", token);
        Some(url.to_string())
    }

    /// Create an API client configured for this session
    pub fn client(&self, config: &ChatConfig) -> ApiClient {
        ApiClient::new()
            .with_base_url(self.api_base_url(config))
            .with_token(self.token.clone())
    }
}

/// Read the persisted session, if any.
pub fn load_session(storage: &Storage) -> Option<AuthSession> {
    storage.load(STORAGE_KEY)
}

pub fn save_session(storage: &Storage, session: &AuthSession) -> bool {
    storage.save(STORAGE_KEY, session)
}

pub fn clear_session(storage: &Storage) {
    storage.remove(STORAGE_KEY);
}
