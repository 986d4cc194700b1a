//! Join Authentication
//!
//! A world can be opened to anyone or gated behind bearer tokens minted by
//! an identity provider. When gated, a join must present a token whose
//! subject hashes to the player id it claims; the server never issues
//! tokens itself.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::game::entity::PlayerId;
use crate::network::protocol::ClientInfo;

/// Prefix hashed ahead of a token subject to form a player id.
const SUBJECT_SALT: &[u8] = b"gridlock/player/";

/// Key used to check token signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyKey {
    /// HS256 shared secret.
    Shared(String),
    /// RS256 public key, PEM encoded.
    PublicPem(String),
}

impl VerifyKey {
    fn algorithm(&self) -> Algorithm {
        match self {
            VerifyKey::Shared(_) => Algorithm::HS256,
            VerifyKey::PublicPem(_) => Algorithm::RS256,
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match self {
            VerifyKey::Shared(secret) => Ok(DecodingKey::from_secret(secret.as_bytes())),
            VerifyKey::PublicPem(pem) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::BadKey(e.to_string())),
        }
    }
}

/// Join gate. Without a key every join is admitted.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Signature key; `None` leaves the world open.
    pub key: Option<VerifyKey>,
    /// Required `iss`, if any.
    pub issuer: Option<String>,
    /// Required `aud`, if any.
    pub audience: Option<String>,
    /// Seconds of clock skew tolerated on `exp`.
    pub leeway_secs: u64,
}

impl AuthConfig {
    /// Gate joins behind an HS256 secret.
    pub fn shared_secret(secret: impl Into<String>) -> Self {
        Self {
            key: Some(VerifyKey::Shared(secret.into())),
            ..Self::default()
        }
    }

    /// Read `GRIDLOCK_AUTH_*`. A public key wins over a secret when both
    /// are set.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let key = var("GRIDLOCK_AUTH_PUBLIC_KEY")
            .map(VerifyKey::PublicPem)
            .or_else(|| var("GRIDLOCK_AUTH_SECRET").map(VerifyKey::Shared));
        Self {
            key,
            issuer: var("GRIDLOCK_AUTH_ISSUER"),
            audience: var("GRIDLOCK_AUTH_AUDIENCE"),
            leeway_secs: var("GRIDLOCK_AUTH_LEEWAY_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    /// True when joins must carry a token.
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Check `token` and return its claims.
    pub fn verify(&self, token: &str) -> Result<JoinClaims, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NotConfigured)?;

        let mut rules = Validation::new(key.algorithm());
        rules.required_spec_claims.clear();
        rules.leeway = self.leeway_secs;
        if let Some(issuer) = &self.issuer {
            rules.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => rules.set_audience(&[audience]),
            None => rules.validate_aud = false,
        }

        let claims = decode::<JoinClaims>(token, &key.decoding_key()?, &rules)
            .map_err(AuthError::from)?
            .claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }
        Ok(claims)
    }
}

/// The claims a join token must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinClaims {
    /// Provider account.
    pub sub: String,
    /// Expiry, Unix seconds. Tokens without one never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl JoinClaims {
    /// The player this account plays as.
    pub fn player_id(&self) -> PlayerId {
        let digest = Sha256::new()
            .chain_update(SUBJECT_SALT)
            .chain_update(self.sub.as_bytes())
            .finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PlayerId::new(id)
    }
}

/// Why a join token was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No key configured.
    #[error("world is not gated")]
    NotConfigured,
    /// Gated world, join carried no token.
    #[error("join needs a token")]
    MissingToken,
    /// Configured key could not be loaded.
    #[error("verification key unusable: {0}")]
    BadKey(String),
    /// Not a decodable JWT.
    #[error("token is not a JWT")]
    Malformed,
    /// Signed with a different key.
    #[error("token signature does not verify")]
    BadSignature,
    /// `exp` is past, beyond the leeway.
    #[error("token has expired")]
    Expired,
    /// `iss` does not match.
    #[error("token issued by someone else")]
    WrongIssuer,
    /// `aud` does not match.
    #[error("token meant for another audience")]
    WrongAudience,
    /// Claim absent or blank.
    #[error("token lacks claim {0}")]
    MissingClaim(String),
    /// Token subject maps to a different player id than the one claimed.
    #[error("token is for {token}, join claimed {claimed}")]
    PlayerMismatch {
        /// Id derived from the token
        token: PlayerId,
        /// Id in the join request
        claimed: PlayerId,
    },
    /// Any other decode failure.
    #[error("token rejected: {0}")]
    Rejected(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed
            }
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
            _ => AuthError::Rejected(err.to_string()),
        }
    }
}

/// Admit or refuse a join against the gate in `config`.
pub fn authorize_join(info: &ClientInfo, config: &AuthConfig) -> Result<(), AuthError> {
    if !config.is_configured() {
        return Ok(());
    }
    let token = info.token.as_deref().ok_or(AuthError::MissingToken)?;
    let owner = config.verify(token)?.player_id();
    if owner != info.player_id {
        return Err(AuthError::PlayerMismatch {
            token: owner,
            claimed: info.player_id,
        });
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "hs256-secret-used-only-in-tests";

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    fn mint(claims: &JoinClaims, secret: &str) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn account(sub: &str) -> JoinClaims {
        JoinClaims {
            sub: sub.into(),
            exp: Some(now() + 600),
            iss: Some("idp.example".into()),
            aud: Some("gridlock".into()),
        }
    }

    #[test]
    fn test_verify_accepts_signed_token() {
        let token = mint(&account("carol"), SECRET);
        let claims = AuthConfig::shared_secret(SECRET).verify(&token).unwrap();
        assert_eq!(claims.sub, "carol");
        assert_eq!(claims.player_id(), account("carol").player_id());
    }

    #[test]
    fn test_token_without_expiry_is_accepted() {
        let mut claims = account("dave");
        claims.exp = None;
        let token = mint(&claims, SECRET);
        assert!(AuthConfig::shared_secret(SECRET).verify(&token).is_ok());
    }

    #[test]
    fn test_expiry_respects_leeway() {
        let mut claims = account("erin");
        claims.exp = Some(now() - 30);
        let token = mint(&claims, SECRET);

        let strict = AuthConfig::shared_secret(SECRET);
        assert_eq!(strict.verify(&token).unwrap_err(), AuthError::Expired);

        let lenient = AuthConfig { leeway_secs: 120, ..strict };
        assert!(lenient.verify(&token).is_ok());
    }

    #[test]
    fn test_signature_issuer_and_audience_checks() {
        let forged = mint(&account("frank"), "not-the-server-secret");
        let config = AuthConfig::shared_secret(SECRET);
        assert_eq!(config.verify(&forged).unwrap_err(), AuthError::BadSignature);

        let token = mint(&account("frank"), SECRET);
        let issuer = AuthConfig { issuer: Some("other.idp".into()), ..config.clone() };
        assert_eq!(issuer.verify(&token).unwrap_err(), AuthError::WrongIssuer);

        let audience = AuthConfig { audience: Some("another-game".into()), ..config.clone() };
        assert_eq!(audience.verify(&token).unwrap_err(), AuthError::WrongAudience);

        assert_eq!(config.verify("definitely not a jwt").unwrap_err(), AuthError::Malformed);
    }

    #[test]
    fn test_blank_subject_rejected() {
        let token = mint(&account("  "), SECRET);
        assert_eq!(
            AuthConfig::shared_secret(SECRET).verify(&token).unwrap_err(),
            AuthError::MissingClaim("sub".into())
        );
    }

    #[test]
    fn test_subjects_map_to_distinct_players() {
        assert_ne!(account("gina").player_id(), account("hank").player_id());
    }

    #[test]
    fn test_open_world_admits_anyone() {
        let open = AuthConfig::default();
        assert!(!open.is_configured());
        let info = ClientInfo::new(PlayerId::new([1; 16]), "anyone");
        assert_eq!(authorize_join(&info, &open), Ok(()));
        assert_eq!(open.verify("a.b.c").unwrap_err(), AuthError::NotConfigured);
    }

    #[test]
    fn test_gated_join_needs_own_token() {
        let config = AuthConfig::shared_secret(SECRET);
        let claims = account("ivy");
        let token = mint(&claims, SECRET);

        let bare = ClientInfo::new(claims.player_id(), "ivy");
        assert_eq!(authorize_join(&bare, &config), Err(AuthError::MissingToken));
        assert_eq!(authorize_join(&bare.clone().with_token(token.clone()), &config), Ok(()));

        let impostor = ClientInfo::new(PlayerId::new([9; 16]), "ivy").with_token(token);
        assert!(matches!(
            authorize_join(&impostor, &config),
            Err(AuthError::PlayerMismatch { claimed, .. }) if claimed == PlayerId::new([9; 16])
        ));
    }

    #[test]
    fn test_bad_pem_is_reported() {
        let config = AuthConfig {
            key: Some(VerifyKey::PublicPem("not a pem".into())),
            ..AuthConfig::default()
        };
        assert!(matches!(config.verify("a.b.c"), Err(AuthError::BadKey(_))));
    }
}
