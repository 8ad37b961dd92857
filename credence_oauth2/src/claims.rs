//! Verified token claims

use aliri::jwt::{self, Audiences, IssuerRef, SubjectRef};
use credence_clock::UnixTime;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Default, Deserialize)]
struct RegisteredClaims {
    #[serde(default)]
    iss: Option<jwt::Issuer>,
    #[serde(default)]
    sub: Option<jwt::Subject>,
    #[serde(default)]
    aud: Audiences,
    #[serde(default)]
    exp: Option<aliri_clock::UnixTime>,
    #[serde(default)]
    nbf: Option<aliri_clock::UnixTime>,
    #[serde(default)]
    iat: Option<aliri_clock::UnixTime>,
}

/// The claims of a JWT
///
/// The registered claims are parsed up front. Every claim, registered or not, is
/// also available by name through [`get`](Self::get).
#[derive(Clone, Debug, PartialEq)]
pub struct Claims {
    iss: Option<jwt::Issuer>,
    sub: Option<jwt::Subject>,
    aud: Audiences,
    exp: Option<aliri_clock::UnixTime>,
    nbf: Option<aliri_clock::UnixTime>,
    iat: Option<aliri_clock::UnixTime>,
    raw: Map<String, Value>,
}

impl Claims {
    /// The issuer (`iss`)
    #[inline]
    pub fn issuer(&self) -> Option<&IssuerRef> {
        self.iss.as_deref()
    }

    /// The subject (`sub`)
    #[inline]
    pub fn subject(&self) -> Option<&SubjectRef> {
        self.sub.as_deref()
    }

    /// The audiences (`aud`)
    #[inline]
    pub fn audiences(&self) -> &Audiences {
        &self.aud
    }

    /// When the token expires (`exp`)
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.exp.map(|t| UnixTime(t.0))
    }

    /// When the token becomes valid (`nbf`)
    #[inline]
    pub fn not_before(&self) -> Option<UnixTime> {
        self.nbf.map(|t| UnixTime(t.0))
    }

    /// When the token was issued (`iat`)
    #[inline]
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.iat.map(|t| UnixTime(t.0))
    }

    /// Any claim, by name
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }

    /// All claims, as presented in the token
    #[inline]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.raw
    }
}

impl<'de> Deserialize<'de> for Claims {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let registered = RegisteredClaims::deserialize(Value::Object(raw.clone()))
            .map_err(de::Error::custom)?;

        Ok(Self {
            iss: registered.iss,
            sub: registered.sub,
            aud: registered.aud,
            exp: registered.exp,
            nbf: registered.nbf,
            iat: registered.iat,
            raw,
        })
    }
}

impl Serialize for Claims {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.raw.serialize(serializer)
    }
}

impl jwt::CoreClaims for Claims {
    fn nbf(&self) -> Option<aliri_clock::UnixTime> {
        self.nbf
    }

    fn exp(&self) -> Option<aliri_clock::UnixTime> {
        self.exp
    }

    fn aud(&self) -> &Audiences {
        &self.aud
    }

    fn iss(&self) -> Option<&IssuerRef> {
        self.iss.as_deref()
    }

    fn sub(&self) -> Option<&SubjectRef> {
        self.sub.as_deref()
    }
}
