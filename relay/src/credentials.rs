use crate::errors::RelayError;
use hyper::HeaderMap;
use hyper::header::AUTHORIZATION;
use std::collections::HashMap;

/// One of the three keys that can identify an environment. The variant plus
/// the string value form the unique key of credential-to-environment maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Credential {
    SdkKey(String),
    MobileKey(String),
    EnvironmentId(String),
}

impl Credential {
    pub fn value(&self) -> &str {
        match self {
            Credential::SdkKey(v) | Credential::MobileKey(v) | Credential::EnvironmentId(v) => v,
        }
    }

    /// Redacted form for status output and logs. Environment IDs are public
    /// and returned verbatim.
    pub fn masked(&self) -> String {
        match self {
            Credential::EnvironmentId(v) => v.clone(),
            Credential::SdkKey(v) | Credential::MobileKey(v) => obscure_key(v),
        }
    }
}

/// The set of credentials owned by one environment. Immutable after
/// construction; rotation replaces the whole environment context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub sdk_key: String,
    pub mobile_key: Option<String>,
    pub env_id: Option<String>,
}

impl Credentials {
    pub fn iter(&self) -> impl Iterator<Item = Credential> + '_ {
        std::iter::once(Credential::SdkKey(self.sdk_key.clone()))
            .chain(self.mobile_key.clone().map(Credential::MobileKey))
            .chain(self.env_id.clone().map(Credential::EnvironmentId))
    }
}

/// The kind of SDK a request comes from, which determines credential
/// extraction and the metrics bucket it is counted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SdkKind {
    Server,
    Mobile,
    Js,
}

impl SdkKind {
    pub const fn metric_label(&self) -> &'static str {
        match self {
            SdkKind::Server => "server",
            SdkKind::Mobile => "mobile",
            SdkKind::Js => "browser",
        }
    }

    /// Extracts the credential this kind of SDK presents. Server and mobile
    /// SDKs send a UUID-shaped token in the Authorization header; browser
    /// SDKs put their environment ID in the URL.
    pub fn credential(
        &self,
        headers: &HeaderMap,
        params: &HashMap<String, String>,
    ) -> Result<Credential, RelayError> {
        match self {
            SdkKind::Server => fetch_auth_token(headers).map(Credential::SdkKey),
            SdkKind::Mobile => fetch_auth_token(headers).map(Credential::MobileKey),
            SdkKind::Js => params
                .get("envId")
                .cloned()
                .map(Credential::EnvironmentId)
                .ok_or(RelayError::UnknownEnvironment),
        }
    }
}

fn fetch_auth_token(headers: &HeaderMap) -> Result<String, RelayError> {
    let auth_hdr = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    // Tolerate the legacy "api_key " prefix some SDKs send
    let token = auth_hdr.trim().trim_start_matches("api_key ").trim();

    if is_uuid_shaped(token) {
        Ok(token.to_string())
    } else {
        Err(RelayError::NoCredential)
    }
}

/// Accepts `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` hex tokens, optionally
/// prefixed with a three-letter tag and a dash (`sdk-`, `mob-`).
fn is_uuid_shaped(token: &str) -> bool {
    let uuid = match token.split_once('-') {
        Some((prefix, rest))
            if prefix.len() == 3 && prefix.chars().all(|c| c.is_ascii_lowercase()) =>
        {
            rest
        }
        _ => token,
    };

    let groups: Vec<&str> = uuid.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Redacts a key except for its leading tag and the last seven characters,
/// keeping dashes so the masked key retains the credential's shape.
pub fn obscure_key(key: &str) -> String {
    if key.len() <= 11 {
        return "*".repeat(key.len());
    }
    let visible_tail = key.len() - 7;
    key.char_indices()
        .map(|(i, c)| {
            if i < 4 || i >= visible_tail || c == '-' {
                c
            } else {
                '*'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    const SDK_KEY: &str = "sdk-99999999-9999-9999-9999-999999e42d0f";

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn server_kind_extracts_sdk_key() {
        let cred = SdkKind::Server
            .credential(&headers_with_auth(SDK_KEY), &HashMap::new())
            .unwrap();
        assert_eq!(cred, Credential::SdkKey(SDK_KEY.to_string()));
    }

    #[test]
    fn mobile_kind_accepts_api_key_prefix() {
        let cred = SdkKind::Mobile
            .credential(
                &headers_with_auth(&format!("api_key {SDK_KEY}")),
                &HashMap::new(),
            )
            .unwrap();
        assert_eq!(cred, Credential::MobileKey(SDK_KEY.to_string()));
    }

    #[test]
    fn malformed_token_is_rejected() {
        for bad in ["", "not-a-key", "sdk-1234", "Bearer something"] {
            let result = SdkKind::Server.credential(&headers_with_auth(bad), &HashMap::new());
            assert!(
                matches!(result, Err(RelayError::NoCredential)),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn missing_header_is_rejected() {
        let result = SdkKind::Server.credential(&HeaderMap::new(), &HashMap::new());
        assert!(matches!(result, Err(RelayError::NoCredential)));
    }

    #[test]
    fn js_kind_reads_env_id_param() {
        let params = HashMap::from([("envId".to_string(), "507f1f77bcf86cd7".to_string())]);
        let cred = SdkKind::Js.credential(&HeaderMap::new(), &params).unwrap();
        assert_eq!(cred, Credential::EnvironmentId("507f1f77bcf86cd7".into()));

        let result = SdkKind::Js.credential(&HeaderMap::new(), &HashMap::new());
        assert!(matches!(result, Err(RelayError::UnknownEnvironment)));
    }

    #[test]
    fn uuid_shape_check() {
        assert!(is_uuid_shaped("99999999-9999-9999-9999-999999e42d0f"));
        assert!(is_uuid_shaped(SDK_KEY));
        assert!(is_uuid_shaped("mob-99999999-9999-9999-9999-999999e42d0f"));
        assert!(!is_uuid_shaped("zzzz9999-9999-9999-9999-999999e42d0f"));
        assert!(!is_uuid_shaped("99999999-9999-9999-9999"));
        assert!(!is_uuid_shaped("sdkk-99999999-9999-9999-9999-999999e42d0f"));
    }

    #[test]
    fn obscured_key_keeps_prefix_and_last_seven() {
        let masked = obscure_key(SDK_KEY);
        assert_eq!(masked, "sdk-********-****-****-****-*****9e42d0f");
        assert_eq!(masked.len(), SDK_KEY.len());

        // short keys are fully masked
        assert_eq!(obscure_key("short"), "*****");
    }

    #[test]
    fn env_id_is_not_masked() {
        let cred = Credential::EnvironmentId("507f1f77bcf86cd799439011".into());
        assert_eq!(cred.masked(), "507f1f77bcf86cd799439011");
    }

    #[test]
    fn credentials_iteration() {
        let creds = Credentials {
            sdk_key: "s".into(),
            mobile_key: Some("m".into()),
            env_id: None,
        };
        let all: Vec<Credential> = creds.iter().collect();
        assert_eq!(
            all,
            vec![
                Credential::SdkKey("s".into()),
                Credential::MobileKey("m".into())
            ]
        );
    }
}
