//! DTOs for interacting with OAuth2 token endpoints

use std::collections::BTreeMap;

use credence_clock::DurationSecs;
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};

use crate::{
    ClientId, ClientSecret, RefreshTokenValue, RefreshTokenValueRef, TokenType, TokenValue,
};

/// Client credentials
#[derive(Clone, Debug, Deserialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// Parameters the grant itself defines; extra parameters cannot override them
const RESERVED: &[&str] = &[
    "grant_type",
    "client_id",
    "client_secret",
    "refresh_token",
    "token",
    "token_type_hint",
];

fn serialize_extra<M: SerializeMap>(
    map: &mut M,
    extra: &BTreeMap<String, String>,
) -> Result<(), M::Error> {
    for (key, value) in extra {
        if RESERVED.contains(&key.as_str()) {
            tracing::debug!(
                parameter = %key,
                "ignoring extra parameter that shadows a grant parameter"
            );
            continue;
        }
        map.serialize_entry(key, value)?;
    }
    Ok(())
}

pub(crate) struct ClientCredentialsGrant<'a> {
    pub credentials: &'a ClientCredentials,
    pub extra: &'a BTreeMap<String, String>,
}

impl Serialize for ClientCredentialsGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("grant_type", "client_credentials")?;
        map.serialize_entry("client_id", &self.credentials.client_id)?;
        map.serialize_entry("client_secret", &self.credentials.client_secret)?;
        serialize_extra(&mut map, self.extra)?;
        map.end()
    }
}

pub(crate) struct RefreshTokenGrant<'a> {
    pub credentials: &'a ClientCredentials,
    pub refresh_token: &'a RefreshTokenValueRef,
    pub extra: &'a BTreeMap<String, String>,
}

impl Serialize for RefreshTokenGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("grant_type", "refresh_token")?;
        map.serialize_entry("refresh_token", self.refresh_token)?;
        map.serialize_entry("client_id", &self.credentials.client_id)?;
        map.serialize_entry("client_secret", &self.credentials.client_secret)?;
        serialize_extra(&mut map, self.extra)?;
        map.end()
    }
}

pub(crate) struct RevokeRequest<'a> {
    pub credentials: &'a ClientCredentials,
    pub token: &'a RefreshTokenValueRef,
}

impl Serialize for RevokeRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("token", self.token)?;
        map.serialize_entry("token_type_hint", "refresh_token")?;
        map.serialize_entry("client_id", &self.credentials.client_id)?;
        map.serialize_entry("client_secret", &self.credentials.client_secret)?;
        map.end()
    }
}

fn bearer() -> TokenType {
    TokenType::from_static("Bearer")
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: TokenValue,
    #[serde(default = "bearer")]
    pub token_type: TokenType,
    pub expires_in: DurationSecs,
    #[serde(default)]
    pub refresh_token: Option<RefreshTokenValue>,
    #[serde(default)]
    pub refresh_expires_in: Option<DurationSecs>,
}
