//! OpenID Connect authorization-code flow with PKCE
//!
//! # Flow
//!
//! 1. [`OidcClient::begin`] stores a random state, the PKCE verifier and a
//!    validated local redirect, then returns the provider's authorization URL.
//! 2. [`OidcClient::complete`] consumes the state (single use, under ten
//!    minutes old), exchanges the code, and verifies the ID token signature
//!    against the provider's JWKS plus its issuer, audience and expiry.
//!
//! JWKS documents are cached for an hour per issuer; an unknown `kid`
//! triggers exactly one refresh before the token is rejected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crypto::token;
use crate::settings::OidcSettings;
use crate::store::{ExternalUser, Store, now_secs};
use crate::{Error, Result};

const JWKS_TTL: Duration = Duration::from_secs(3600);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// OIDC failures
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// OIDC is disabled or incomplete
    #[error("OIDC is not configured")]
    NotConfigured,
    /// Discovery document missing or malformed
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),
    /// Transport failure talking to the provider
    #[error("OIDC provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// State unknown, reused or expired
    #[error("OIDC state is invalid or expired")]
    InvalidState,
    /// Token endpoint refused the code
    #[error("OIDC code exchange failed: {0}")]
    Exchange(String),
    /// Signature or claim validation failed
    #[error("ID token rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    /// Token header carries no `kid`
    #[error("ID token has no key id")]
    MissingKeyId,
    /// `kid` not present even after a refresh
    #[error("Unknown signing key: {0}")]
    UnknownKeyId(String),
    /// A required claim is absent
    #[error("ID token lacks claim {0}")]
    MissingClaim(&'static str),
}

impl From<OidcError> for Error {
    fn from(err: OidcError) -> Self {
        match err {
            OidcError::NotConfigured => Error::NotFound("OIDC is not configured".into()),
            OidcError::Discovery(_) | OidcError::Http(_) => Error::Internal(err.to_string()),
            other => {
                warn!(error = %other, "OIDC login rejected");
                Error::InvalidCredentials
            }
        }
    }
}

/// The subset of the discovery document the flow needs
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// Authorization endpoint
    pub authorization_endpoint: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// JWKS endpoint
    pub jwks_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// OIDC relying party: discovery cache, JWKS cache and the login flow
pub struct OidcClient {
    http: reqwest::Client,
    metadata: RwLock<Option<Arc<ProviderMetadata>>>,
    jwks: DashMap<String, CachedJwks>,
}

impl OidcClient {
    /// Client with empty caches
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build OIDC client: {e}")))?;
        Ok(Self {
            http,
            metadata: RwLock::new(None),
            jwks: DashMap::new(),
        })
    }

    /// Provider metadata for `issuer`, fetched once and cached until the
    /// issuer changes
    pub async fn discover(&self, issuer: &str) -> std::result::Result<Arc<ProviderMetadata>, OidcError> {
        let issuer = issuer.trim().trim_end_matches('/');
        if let Some(cached) = self.metadata.read().as_ref() {
            if cached.issuer.trim_end_matches('/') == issuer {
                return Ok(Arc::clone(cached));
            }
        }

        let url = format!("{issuer}/.well-known/openid-configuration");
        debug!(%url, "Fetching OIDC discovery document");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(OidcError::Discovery(format!("HTTP {}", response.status())));
        }
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| OidcError::Discovery(e.to_string()))?;
        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(OidcError::Discovery(format!(
                "document names issuer {}",
                metadata.issuer
            )));
        }

        let metadata = Arc::new(metadata);
        *self.metadata.write() = Some(Arc::clone(&metadata));
        info!(issuer, "OIDC provider discovered");
        Ok(metadata)
    }

    /// Drop cached metadata and keys (after the settings change)
    pub fn invalidate(&self) {
        *self.metadata.write() = None;
        self.jwks.clear();
    }

    /// Start a login: persist state + verifier, return the provider URL
    pub async fn begin(&self, store: &Store, settings: &OidcSettings, redirect_to: &str) -> Result<String> {
        if !settings.is_configured() {
            return Err(OidcError::NotConfigured.into());
        }
        let metadata = self.discover(&settings.issuer).await?;
        let state = token::oidc_state();
        let (verifier, challenge) = token::pkce_pair();
        store
            .insert_oidc_state(&state, validate_redirect(redirect_to), &verifier)
            .await?;
        authorization_url(&metadata, settings, &state, &challenge)
    }

    /// Finish a login: the provider's profile and the stored redirect
    pub async fn complete(
        &self,
        store: &Store,
        settings: &OidcSettings,
        state: &str,
        code: &str,
    ) -> Result<(ExternalUser, String)> {
        if !settings.is_configured() {
            return Err(OidcError::NotConfigured.into());
        }
        let stored = store
            .consume_oidc_state(state, now_secs())
            .await?
            .ok_or(OidcError::InvalidState)?;
        let metadata = self.discover(&settings.issuer).await?;

        let id_token = self.exchange_code(&metadata, settings, code, &stored.code_verifier).await?;
        let claims = self.verify_id_token(&metadata, settings, &id_token).await?;
        let profile = profile_from_claims(&claims, &settings.groups_claim)?;
        Ok((profile, stored.redirect_to))
    }

    async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        settings: &OidcSettings,
        code: &str,
        verifier: &str,
    ) -> std::result::Result<String, OidcError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", settings.redirect_url.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("code_verifier", verifier),
        ];
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OidcError::Exchange(format!("HTTP {}", response.status())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| OidcError::Exchange(e.to_string()))?;
        body.id_token.ok_or(OidcError::MissingClaim("id_token"))
    }

    /// Verify signature, issuer, audience and expiry; return the claims
    pub async fn verify_id_token(
        &self,
        metadata: &ProviderMetadata,
        settings: &OidcSettings,
        id_token: &str,
    ) -> std::result::Result<Value, OidcError> {
        let header = jsonwebtoken::decode_header(id_token)?;
        let kid = header.kid.clone().ok_or(OidcError::MissingKeyId)?;
        let key = self.find_decoding_key(metadata, &kid).await?;

        let mut validation = Validation::new(supported_algorithm(header.alg)?);
        validation.set_issuer(&[metadata.issuer.as_str()]);
        validation.set_audience(&[settings.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 60;

        Ok(jsonwebtoken::decode::<Value>(id_token, &key, &validation)?.claims)
    }

    async fn find_decoding_key(
        &self,
        metadata: &ProviderMetadata,
        kid: &str,
    ) -> std::result::Result<DecodingKey, OidcError> {
        let jwks = self.jwks_for(metadata, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }
        debug!(kid, "Key not in cached JWKS, refreshing once");
        let jwks = self.jwks_for(metadata, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }

    async fn jwks_for(
        &self,
        metadata: &ProviderMetadata,
        force_refresh: bool,
    ) -> std::result::Result<JwkSet, OidcError> {
        if !force_refresh {
            if let Some(cached) = self.jwks.get(&metadata.issuer) {
                if cached.fetched_at.elapsed() < JWKS_TTL {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(issuer = %metadata.issuer, "Fetching JWKS");
        let keys: JwkSet = self
            .http
            .get(&metadata.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.jwks.insert(
            metadata.issuer.clone(),
            CachedJwks {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }
}

fn supported_algorithm(alg: Algorithm) -> std::result::Result<Algorithm, OidcError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        _ => Err(OidcError::Jwt(jsonwebtoken::errors::ErrorKind::InvalidAlgorithm.into())),
    }
}

fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|k| k.common.key_id.as_deref() == Some(kid))?;
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Provider authorization URL for a new flow
pub fn authorization_url(
    metadata: &ProviderMetadata,
    settings: &OidcSettings,
    state: &str,
    challenge: &str,
) -> Result<String> {
    let mut url = url::Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| Error::Config(format!("Bad authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &settings.client_id)
        .append_pair("redirect_uri", &settings.redirect_url)
        .append_pair("scope", &settings.scopes)
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

/// Only same-site absolute paths survive; anything else becomes `/`
#[must_use]
pub fn validate_redirect(target: &str) -> &str {
    let ok = target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains("://")
        && !target.contains('\\');
    if ok { target } else { "/" }
}

fn claim_str<'a>(claims: &'a Value, name: &str) -> Option<&'a str> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Map ID token claims to a user profile
pub fn profile_from_claims(claims: &Value, groups_claim: &str) -> std::result::Result<ExternalUser, OidcError> {
    let sub = claim_str(claims, "sub").ok_or(OidcError::MissingClaim("sub"))?;
    let email = claim_str(claims, "email").map(ToString::to_string);
    let username = claim_str(claims, "preferred_username")
        .map(ToString::to_string)
        .or_else(|| email.clone())
        .unwrap_or_else(|| sub.to_string());
    let display_name = claim_str(claims, "name").map_or_else(|| username.clone(), ToString::to_string);

    let claim = if groups_claim.trim().is_empty() { "groups" } else { groups_claim.trim() };
    let groups = match claims.get(claim) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    };

    Ok(ExternalUser {
        username,
        email,
        display_name,
        groups,
    })
}
