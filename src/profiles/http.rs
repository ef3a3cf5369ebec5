use serde_json::Value;

use crate::{
    GetField,
    db::Role,
    error::{ChatError, ChatResult},
};

use super::Profile;

/// Client for `GET {base_url}/users/{id}` on the profile service.
#[derive(Clone)]
pub struct HttpProfiles {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfiles {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    pub(crate) async fn fetch(&self, user_id: &str) -> ChatResult<Profile> {
        let failed = |reason: String| ChatError::RecipientLookupFailed {
            user_id: user_id.to_owned(),
            reason,
        };

        let body: Value = self
            .client
            .get(format!("{}/users/{user_id}", self.base_url))
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|e| failed(e.to_string()))?
            .json()
            .await
            .map_err(|e| failed(e.to_string()))?;

        parse_profile(&body).map_err(failed)
    }
}

fn parse_profile(body: &Value) -> Result<Profile, String> {
    let display_name = body.get_str_field("displayName").map_err(|e| e.0.to_string())?;
    let role = match body.get_str_field("role").map_err(|e| e.0.to_string())?.to_uppercase().as_str() {
        "DOCTOR" => Role::Doctor,
        "PATIENT" => Role::Patient,
        other => return Err(format!("unknown role {other}")),
    };

    Ok(Profile { display_name, role })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_profile_body() {
        let profile = parse_profile(&json!({"displayName": "Pat", "role": "patient"})).unwrap();
        assert_eq!(profile.display_name, "Pat");
        assert_eq!(profile.role, Role::Patient);
    }

    #[test]
    fn rejects_missing_fields_and_unknown_roles() {
        assert!(parse_profile(&json!({"role": "DOCTOR"})).is_err());
        assert!(parse_profile(&json!({"displayName": "X", "role": "ADMIN"})).is_err());
    }
}
