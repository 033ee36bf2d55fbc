//! Bearer-token session derivation.
//!
//! A ready-made session extractor for endpoints whose callers authenticate
//! with an HMAC-signed JWT in the `authorization` header. This is purely a
//! convenience; `.session(..)` accepts any extractor.

use crate::endpoint::SessionArgs;
use crate::env::Env;
use crate::web::error::ResultExt;
use anyhow::Context;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use warp::http::StatusCode;

const PREFIX_BEARER_TOKEN: &str = "Bearer ";

pub const CLAIM_SUB: &str = "sub";
pub const CLAIM_TENANT: &str = "tenant";

/// The claims of a verified token.
pub type ClaimsSet = BTreeMap<String, Value>;

/// Validates HMAC-signed JWTs against a shared secret.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens without an exp claim are accepted; present claims are
        // still validated.
        validation.required_spec_claims.clear();
        validation.validate_nbf = true;

        TokenVerifier {
            decoding_key: DecodingKey::from_secret(secret.as_ref().as_bytes()),
            validation,
        }
    }

    /// Reads the shared secret from `AUTH_SECRET`.
    pub fn from_env(env: &Env) -> anyhow::Result<Self> {
        Ok(Self::new(env.var("AUTH_SECRET")?))
    }

    pub fn verify(&self, jwt_token: &str) -> anyhow::Result<ClaimsSet> {
        let token = decode::<ClaimsSet>(jwt_token, &self.decoding_key, &self.validation)
            .context("Invalid JWT present")
            .with_status(StatusCode::UNAUTHORIZED)?;

        Ok(token.claims)
    }

    /// Verifies an `authorization` header value, with or without the
    /// `Bearer ` prefix.
    pub fn verify_bearer(&self, authorization: &str) -> anyhow::Result<ClaimsSet> {
        let token = authorization
            .strip_prefix(PREFIX_BEARER_TOKEN)
            .unwrap_or(authorization);
        self.verify(token)
    }
}

/// A session extractor deriving a [`ClaimsSet`] from the `authorization`
/// header.
///
/// A missing header yields no session (endpoints decide through their
/// authorizer whether that is acceptable); an invalid token is rejected
/// with 401.
pub fn bearer_session(
    verifier: Arc<TokenVerifier>,
) -> impl Fn(SessionArgs) -> futures_util::future::Ready<anyhow::Result<Option<ClaimsSet>>>
+ Send
+ Sync
+ 'static {
    move |args| {
        let result = match args.header.get("authorization") {
            Some(authorization) => verifier.verify_bearer(&authorization).map(Some),
            None => Ok(None),
        };
        futures_util::future::ready(result)
    }
}
