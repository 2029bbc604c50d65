use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const TOKEN_TYPE: &str = "survey-access";

/// Claims binding a survey to a person for the lifetime of the invitation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub survey_id: String,
    pub person_id: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs bounded-lifetime access tokens. Constructed once from config and
/// passed to the dispatch driver.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    ttl_days: i64,
}

impl TokenIssuer {
    pub fn new(secret: String, ttl_days: i64) -> Self {
        Self { secret, ttl_days }
    }

    pub fn sign(&self, survey_id: &str, person_id: &str) -> Result<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            survey_id: survey_id.to_string(),
            person_id: person_id.to_string(),
            typ: TOKEN_TYPE.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::days(self.ttl_days)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to sign access token")
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let data = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid access token")?;
        Ok(data.claims)
    }
}
