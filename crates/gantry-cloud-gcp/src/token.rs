//! Service account bearer tokens
//!
//! The compute API authenticates with OAuth bearer tokens. The provider
//! signs a short-lived RS256 assertion with the service account key and
//! exchanges it at the token endpoint; tokens are cached per account and
//! refreshed shortly before expiry.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use gantry_common::error::{CloudError, Result};

use crate::config::ServiceAccountKey;

/// OAuth scope covering the compute API
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const GRANT_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Lifetime requested in the signed assertion; the token endpoint caps
/// anything longer at one hour anyway
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Clone)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub struct TokenProvider {
    key: ServiceAccountKey,
    signer: EncodingKey,
    /// Cached tokens keyed by service account email
    tokens: DashMap<String, TokenInfo>,
}

impl TokenProvider {
    pub fn new(key: ServiceAccountKey) -> Result<Self> {
        let signer = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|err| {
            CloudError::Config(format!(
                "private key of service account '{}': {err}",
                key.client_email
            ))
        })?;
        Ok(Self { key, signer, tokens: DashMap::new() })
    }

    /// Valid bearer token for the next request, refreshed when the cached
    /// one is within [`TOKEN_REFRESH_BUFFER`] of expiry
    pub async fn bearer_token(&self, http: &reqwest::Client) -> Result<String> {
        if let Some(token) = self.tokens.get(&self.key.client_email) {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_BUFFER {
                return Ok(token.access_token.clone());
            }
        }
        self.authenticate(http).await
    }

    async fn authenticate(&self, http: &reqwest::Client) -> Result<String> {
        let assertion = self.sign_assertion()?;
        let params = [("grant_type", GRANT_TYPE_JWT_BEARER), ("assertion", assertion.as_str())];
        let response = http
            .post(&self.key.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|err| CloudError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Config(format!(
                "token request for service account '{}' failed with status {}",
                self.key.client_email, status
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| CloudError::Other(anyhow::anyhow!("decoding token response: {err}")))?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.max(0) as u64);
        self.tokens.insert(
            self.key.client_email.clone(),
            TokenInfo { access_token: token.access_token.clone(), expires_at },
        );
        debug!(account = %self.key.client_email, "refreshed compute token");
        Ok(token.access_token)
    }

    fn sign_assertion(&self) -> Result<String> {
        let iat = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.key.token_uri,
            exp: iat + ASSERTION_LIFETIME_SECS,
            iat,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.signer)
            .map_err(|err| CloudError::Other(anyhow::anyhow!("signing token assertion: {err}")))
    }
}
