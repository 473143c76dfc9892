use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{response_code, response_data, Transport, LOGIN_ENDPOINT, SUCCESS_CODE};
use crate::error::{PillowError, Result};

/// Tokens handed out by `fastlogin` are kept for this many days.
pub const TOKEN_LIFETIME_DAYS: i64 = 15;

/// Fields every signed request is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    cname: String,
    cname_type: String,
    uid: String,
    did: String,
    sort: String,
}

impl DeviceIdentity {
    /// Build an identity from raw configuration values. The MAC address may
    /// contain colons; they are stripped to form the device id.
    pub fn new(
        cname: &str,
        cname_type: &str,
        uid: &str,
        mac: &str,
        sort: &str,
    ) -> Result<Self> {
        let did = mac.trim().replace(':', "");
        for (field, value) in [
            ("cname", cname),
            ("cname_type", cname_type),
            ("uid", uid),
            ("mac", did.as_str()),
            ("sort", sort),
        ] {
            if value.trim().is_empty() {
                return Err(PillowError::Configuration(format!("`{}` is required", field)));
            }
        }

        Ok(Self {
            cname: cname.trim().to_string(),
            cname_type: cname_type.trim().to_string(),
            uid: uid.trim().to_string(),
            did,
            sort: sort.trim().to_string(),
        })
    }

    pub fn cname(&self) -> &str {
        &self.cname
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn did(&self) -> &str {
        &self.did
    }
}

/// Hex MD5 of `cname + did + uid + sort + timestamp + cname_type`.
///
/// MD5 is what the backend verifies; it is not a security boundary here.
pub fn sign_request(identity: &DeviceIdentity, timestamp: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(identity.cname.as_bytes());
    hasher.update(identity.did.as_bytes());
    hasher.update(identity.uid.as_bytes());
    hasher.update(identity.sort.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(identity.cname_type.as_bytes());
    hex::encode(hasher.finalize())
}

/// Unix seconds as the decimal string the backend expects in `tmsp`.
pub fn request_timestamp(now: DateTime<Utc>) -> String {
    now.timestamp().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl AuthToken {
    pub fn issue(value: String, now: DateTime<Utc>) -> Self {
        Self {
            value,
            issued_at: now,
            valid_until: now + Duration::days(TOKEN_LIFETIME_DAYS),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }
}

/// The current token, if any. Tokens are replaced, never edited.
#[derive(Debug, Default)]
pub struct TokenCache {
    token: Option<AuthToken>,
}

impl TokenCache {
    pub fn new(token: Option<AuthToken>) -> Self {
        Self { token }
    }

    /// Token usable for an authenticated call at `now`.
    pub fn usable(&self, now: DateTime<Utc>) -> Option<&AuthToken> {
        self.token.as_ref().filter(|t| t.is_valid_at(now))
    }

    pub fn replace(&mut self, token: AuthToken) {
        self.token = Some(token);
    }

    pub fn invalidate(&mut self) {
        self.token = None;
    }
}

pub struct TokenManager {
    transport: Arc<dyn Transport>,
    identity: DeviceIdentity,
}

impl TokenManager {
    pub fn new(transport: Arc<dyn Transport>, identity: DeviceIdentity) -> Self {
        Self {
            transport,
            identity,
        }
    }

    /// Exchange a freshly signed request for a raw token string.
    pub async fn login(&self) -> Result<String> {
        debug!("Requesting token for device {}", self.identity.did);
        let timestamp = request_timestamp(Utc::now());
        let body = json!({
            "cname": self.identity.cname,
            "tmsp": timestamp,
            "sign": sign_request(&self.identity, &timestamp),
            "did": self.identity.did,
            "uid": self.identity.uid,
        });

        let response = self.transport.post_json(LOGIN_ENDPOINT, &[], &body).await?;
        let code = response_code(LOGIN_ENDPOINT, &response)?;
        if code != SUCCESS_CODE {
            return Err(PillowError::unauthorized(LOGIN_ENDPOINT, code));
        }

        let token = response_data(LOGIN_ENDPOINT, &response)?
            .as_str()
            .ok_or_else(|| PillowError::malformed(LOGIN_ENDPOINT, "`data` is not a string"))?;

        info!("Logged in as device {}", self.identity.did);
        Ok(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockTransport, Reply};
    use serde_json::json;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("mlily", "android", "user-1", "AA:BB:CC:DD:EE:FF", "3").unwrap()
    }

    #[test]
    fn test_mac_is_normalized() {
        assert_eq!(identity().did(), "AABBCCDDEEFF");
    }

    #[test]
    fn test_missing_field_is_configuration_error() {
        let err = DeviceIdentity::new("mlily", "", "user-1", "AA:BB", "3").unwrap_err();
        assert!(matches!(err, PillowError::Configuration(ref m) if m.contains("cname_type")));

        let err = DeviceIdentity::new("mlily", "android", "user-1", ":::", "3").unwrap_err();
        assert!(matches!(err, PillowError::Configuration(ref m) if m.contains("mac")));
    }

    #[test]
    fn test_sign_request_known_digest() {
        let id = DeviceIdentity::new("a", "f", "c", "b", "d").unwrap();
        // "a" + "b" + "c" + "d" + "e" + "f"
        assert_eq!(sign_request(&id, "e"), "e80b5017098950fc58aad83c8c14978e");
    }

    #[test]
    fn test_sign_request_is_deterministic() {
        let id = identity();
        assert_eq!(sign_request(&id, "1700000000"), sign_request(&id, "1700000000"));
        assert_eq!(sign_request(&id, "1700000000").len(), 32);
    }

    #[test]
    fn test_sign_request_changes_with_every_field() {
        let base = sign_request(&identity(), "1700000000");
        let variants = [
            DeviceIdentity::new("mlily2", "android", "user-1", "AA:BB:CC:DD:EE:FF", "3"),
            DeviceIdentity::new("mlily", "ios", "user-1", "AA:BB:CC:DD:EE:FF", "3"),
            DeviceIdentity::new("mlily", "android", "user-2", "AA:BB:CC:DD:EE:FF", "3"),
            DeviceIdentity::new("mlily", "android", "user-1", "AA:BB:CC:DD:EE:00", "3"),
            DeviceIdentity::new("mlily", "android", "user-1", "AA:BB:CC:DD:EE:FF", "4"),
        ];
        for variant in variants {
            assert_ne!(sign_request(&variant.unwrap(), "1700000000"), base);
        }
        assert_ne!(sign_request(&identity(), "1700000001"), base);
    }

    #[test]
    fn test_token_validity_window() {
        let now = Utc::now();
        let token = AuthToken::issue("abc".to_string(), now);
        assert_eq!(token.valid_until - token.issued_at, Duration::days(15));
        assert!(token.is_valid_at(now + Duration::days(14)));
        assert!(!token.is_valid_at(now + Duration::days(15)));
    }

    #[test]
    fn test_token_cache() {
        let now = Utc::now();
        let mut cache = TokenCache::default();
        assert!(cache.usable(now).is_none());

        cache.replace(AuthToken::issue("abc".to_string(), now - Duration::days(16)));
        assert!(cache.usable(now).is_none());

        cache.replace(AuthToken::issue("def".to_string(), now));
        assert_eq!(cache.usable(now).unwrap().value, "def");

        cache.invalidate();
        assert!(cache.usable(now).is_none());
    }

    #[tokio::test]
    async fn test_login_returns_token() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(
            json!({"code": "1000", "data": "abc"}),
        )]));
        let manager = TokenManager::new(transport.clone(), identity());

        assert_eq!(manager.login().await.unwrap(), "abc");

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].endpoint, LOGIN_ENDPOINT);
        let body = &requests[0].body;
        assert_eq!(body["cname"], "mlily");
        assert_eq!(body["did"], "AABBCCDDEEFF");
        assert_eq!(body["uid"], "user-1");
        let tmsp = body["tmsp"].as_str().unwrap();
        assert!(tmsp.parse::<i64>().is_ok());
        assert_eq!(body["sign"], sign_request(&identity(), tmsp));
    }

    #[tokio::test]
    async fn test_login_rejected_code_is_unauthorized() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(json!({"code": "1001"}))]));
        let manager = TokenManager::new(transport, identity());

        match manager.login().await {
            Err(PillowError::Unauthorized { code, .. }) => assert_eq!(code, "1001"),
            other => panic!("expected Unauthorized, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_non_string_token_is_malformed() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(
            json!({"code": "1000", "data": {"token": "abc"}}),
        )]));
        let manager = TokenManager::new(transport, identity());

        let err = manager.login().await.unwrap_err();
        assert!(matches!(err, PillowError::Communication { .. }));
    }
}
