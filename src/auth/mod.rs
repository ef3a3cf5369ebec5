mod extract;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

pub use extract::AuthUser;

use crate::{
    db::{Participant, Role},
    error::{ChatError, ChatResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub role: Role,
    pub iat: u64,
    pub exp: u64,
}

/// Who is on the other end of a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant::new(&self.user_id, self.role)
    }

    pub fn greeting(&self) -> String {
        format!("Hello {} ({}), you are connected", self.display_name, self.user_id)
    }
}

/// HS256 signing and verification with the server secret.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenKeys {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> ChatResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            ChatError::InvalidToken
        })?;

        let Claims { sub, name, role, .. } = data.claims;
        Ok(Identity::new(sub, name, role))
    }

    pub fn issue(&self, identity: &Identity, ttl: time::Duration) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: identity.user_id.clone(),
            name: identity.display_name.clone(),
            role: identity.role,
            iat: now.unix_timestamp().max(0) as u64,
            exp: (now + ttl).unix_timestamp().max(0) as u64,
        };

        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}
