//! JWT Authentication
//!
//! Validates ID tokens from an external OAuth provider (Google sign-in or
//! any OIDC issuer). The server does NOT issue tokens - only validates
//! them - and maps a valid token onto a store username.

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Token login settings. Token login is off unless a key or secret is set.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Required `iss`, if any.
    pub issuer: Option<String>,
    /// Required `aud`, normally the OAuth client id.
    pub audience: Option<String>,
    /// Provider public key (PEM), verified with RS256.
    pub public_key_pem: Option<String>,
    /// Shared secret, verified with HS256.
    pub secret: Option<String>,
    /// Accept expired tokens. Local testing only.
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let flag = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: flag("AUTH_SKIP_EXPIRY"),
        }
    }

    /// True when a key or secret is available to verify tokens with.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    /// Verification key and the algorithm it implies. A PEM key wins over
    /// a shared secret.
    fn decoding_key(&self) -> Result<(DecodingKey, Algorithm), AuthError> {
        match (&self.public_key_pem, &self.secret) {
            (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map(|key| (key, Algorithm::RS256))
                .map_err(|e| AuthError::BadKey(e.to_string())),
            (None, Some(secret)) => Ok((DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)),
            (None, None) => Err(AuthError::NotConfigured),
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        // Claims are checked below so tokens without exp still pass
        validation.required_spec_claims.clear();
        validation.validate_exp = !self.skip_expiry;

        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

/// Claims we read from provider ID tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Account id at the provider.
    pub sub: String,
    /// Expiry (Unix seconds, 0 when absent).
    #[serde(default)]
    pub exp: u64,
    /// Issue time (Unix seconds).
    #[serde(default)]
    pub iat: u64,
    /// Provider that issued the token.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience, either a string or a list.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Email address, when the provider shares it.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

impl TokenClaims {
    /// Username this token logs in as.
    ///
    /// The email when present, otherwise a stable key derived from the
    /// issuer and subject so the same account always maps to the same user.
    pub fn username(&self) -> String {
        if let Some(email) = self.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            return email.to_lowercase();
        }

        let digest = Sha256::new()
            .chain_update(b"roamie-account:")
            .chain_update(self.iss.as_deref().unwrap_or_default().as_bytes())
            .chain_update(b":")
            .chain_update(self.sub.as_bytes())
            .finalize();

        format!("oauth-{}", hex::encode(&digest[..8]))
    }

    /// Provider account key, `issuer|subject`. Users created by a token
    /// login are bound to this.
    pub fn subject(&self) -> String {
        format!("{}|{}", self.iss.as_deref().unwrap_or_default(), self.sub)
    }

    fn is_expired_at(&self, now: u64) -> bool {
        self.exp > 0 && now > self.exp
    }
}

/// Token validation errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Server has no key or secret.
    #[error("token login is not enabled on this server")]
    NotConfigured,
    /// Not a well-formed JWT.
    #[error("malformed token")]
    Malformed,
    /// Signature did not verify.
    #[error("token signature mismatch")]
    BadSignature,
    /// Token is past its expiry.
    #[error("token expired")]
    Expired,
    /// Issued by someone else.
    #[error("unexpected token issuer")]
    WrongIssuer,
    /// Issued for another client.
    #[error("unexpected token audience")]
    WrongAudience,
    /// No subject to identify the account.
    #[error("token has no subject")]
    MissingSubject,
    /// Configured public key could not be parsed.
    #[error("bad verification key: {0}")]
    BadKey(String),
    /// Any other rejection from the JWT library.
    #[error("token rejected: {0}")]
    Rejected(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed
            }
            _ => AuthError::Rejected(err.to_string()),
        }
    }
}

/// Verify a provider ID token and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = config.decoding_key()?;
    let claims = decode::<TokenClaims>(token, &key, &config.validation(algorithm))?.claims;

    if claims.sub.trim().is_empty() {
        return Err(AuthError::MissingSubject);
    }

    let now = Utc::now().timestamp().max(0) as u64;
    if !config.skip_expiry && claims.is_expired_at(now) {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "roamie-test-secret-0123456789abcdef";

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn google_claims() -> TokenClaims {
        let now = Utc::now().timestamp() as u64;
        TokenClaims {
            sub: "108234567890".into(),
            exp: now + 3600,
            iat: now,
            iss: Some("https://accounts.google.com".into()),
            aud: Some(serde_json::json!("roamie-client")),
            email: Some("Quark@Example.com".into()),
            name: Some("Quark".into()),
        }
    }

    fn with_secret() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_signed_token() {
        let token = sign(&google_claims(), SECRET);
        let claims = validate_token(&token, &with_secret()).unwrap();
        assert_eq!(claims.sub, "108234567890");
        assert_eq!(claims.username(), "quark@example.com");
    }

    #[test]
    fn test_rejects_expired() {
        let claims = TokenClaims { exp: 1, ..google_claims() };
        let token = sign(&claims, SECRET);
        assert!(matches!(validate_token(&token, &with_secret()), Err(AuthError::Expired)));

        // Unless expiry checks are off
        let lax = AuthConfig { skip_expiry: true, ..with_secret() };
        assert!(validate_token(&token, &lax).is_ok());
    }

    #[test]
    fn test_rejects_other_secret() {
        let token = sign(&google_claims(), "some-other-secret-entirely-0000");
        assert!(matches!(validate_token(&token, &with_secret()), Err(AuthError::BadSignature)));
    }

    #[test]
    fn test_rejects_blank_subject() {
        let claims = TokenClaims { sub: "  ".into(), ..google_claims() };
        let token = sign(&claims, SECRET);
        assert!(matches!(validate_token(&token, &with_secret()), Err(AuthError::MissingSubject)));
    }

    #[test]
    fn test_issuer_and_audience() {
        let token = sign(&google_claims(), SECRET);

        let other_issuer = AuthConfig {
            issuer: Some("https://login.example.org".into()),
            ..with_secret()
        };
        assert!(matches!(validate_token(&token, &other_issuer), Err(AuthError::WrongIssuer)));

        let other_client = AuthConfig {
            audience: Some("another-app".into()),
            ..with_secret()
        };
        assert!(matches!(validate_token(&token, &other_client), Err(AuthError::WrongAudience)));

        let pinned = AuthConfig {
            issuer: Some("https://accounts.google.com".into()),
            audience: Some("roamie-client".into()),
            ..with_secret()
        };
        assert!(validate_token(&token, &pinned).is_ok());
    }

    #[test]
    fn test_malformed_token() {
        let result = validate_token("definitely not a jwt", &with_secret());
        assert!(matches!(result, Err(AuthError::Malformed) | Err(AuthError::Rejected(_))));
    }

    #[test]
    fn test_disabled_without_key() {
        let config = AuthConfig::default();
        assert!(!config.is_configured());
        assert!(matches!(validate_token("a.b.c", &config), Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_bad_public_key() {
        let config = AuthConfig {
            public_key_pem: Some("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----".into()),
            ..Default::default()
        };
        let token = sign(&google_claims(), SECRET);
        assert!(matches!(validate_token(&token, &config), Err(AuthError::BadKey(_))));
    }

    #[test]
    fn test_subject_key() {
        assert_eq!(google_claims().subject(), "https://accounts.google.com|108234567890");
        let no_issuer = TokenClaims { iss: None, ..google_claims() };
        assert_eq!(no_issuer.subject(), "|108234567890");
    }

    #[test]
    fn test_username_from_subject() {
        let anonymous = TokenClaims { email: None, ..google_claims() };
        let name = anonymous.username();
        assert!(name.starts_with("oauth-"));
        assert_eq!(name.len(), "oauth-".len() + 16);
        assert_eq!(name, anonymous.username());

        let someone_else = TokenClaims { sub: "999".into(), ..anonymous };
        assert_ne!(name, someone_else.username());
    }
}
