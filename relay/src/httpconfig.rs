//! Outbound HTTP client construction.
//!
//! Validates the proxy/CA options once at environment construction time and
//! acts as the factory for every `reqwest::Client` the relay points at the
//! upstream service (event forwarding, goals passthrough, big segments).

use crate::config::ProxyParams;
use crate::errors::RelayError;
use std::time::Duration;

const RELAY_USER_AGENT: &str = concat!("FlagRelay/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct HttpConfig {
    proxy: Option<reqwest::Proxy>,
    ca_certs: Vec<reqwest::Certificate>,
    connect_timeout: Duration,
}

impl HttpConfig {
    pub fn new(params: &ProxyParams) -> Result<Self, RelayError> {
        if params.url.is_none() && params.ntlm_auth {
            return Err(RelayError::Config(
                "cannot specify proxy authentication without a proxy URL".into(),
            ));
        }

        let proxy = match &params.url {
            None => None,
            Some(raw) => {
                url::Url::parse(raw)
                    .map_err(|_| RelayError::Config(format!("invalid proxy URL: {raw}")))?;
                tracing::info!(url = %raw, "Using proxy server");

                let mut proxy = reqwest::Proxy::all(raw.as_str())
                    .map_err(|e| RelayError::Config(format!("invalid proxy URL: {e}")))?;
                if params.ntlm_auth {
                    let (user, password) = match (&params.user, &params.password) {
                        (Some(u), Some(p)) => (u, p),
                        _ => {
                            return Err(RelayError::Config(
                                "NTLM proxy authentication requires username and password".into(),
                            ));
                        }
                    };
                    // Negotiation beyond attaching the credentials is the
                    // proxy layer's concern
                    proxy = proxy.basic_auth(user, password);
                    tracing::info!("NTLM proxy authentication enabled");
                } else if let (Some(user), Some(password)) = (&params.user, &params.password) {
                    proxy = proxy.basic_auth(user, password);
                }
                Some(proxy)
            }
        };

        let mut ca_certs = Vec::new();
        for path in params.ca_cert_files.iter().filter(|p| !p.is_empty()) {
            let pem = std::fs::read(path)
                .map_err(|e| RelayError::Config(format!("cannot read CA file {path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| RelayError::Config(format!("invalid CA certificate {path}: {e}")))?;
            ca_certs.push(cert);
        }

        Ok(Self {
            proxy,
            ca_certs,
            connect_timeout: params.connect_timeout(),
        })
    }

    /// Builds a client for request/response upstream calls, with an overall
    /// request timeout.
    pub fn client(&self, request_timeout: Duration) -> Result<reqwest::Client, RelayError> {
        self.builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build HTTP client: {e}")))
    }

    /// Builds a client for long-lived streaming connections: connect timeout
    /// only, reads bounded by heartbeat expectations instead.
    pub fn streaming_client(&self) -> Result<reqwest::Client, RelayError> {
        self.builder()
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build HTTP client: {e}")))
    }

    fn builder(&self) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .user_agent(RELAY_USER_AGENT)
            .connect_timeout(self.connect_timeout);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(proxy.clone());
        }
        for cert in &self.ca_certs {
            builder = builder.add_root_certificate(cert.clone());
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_params_build() {
        let config = HttpConfig::new(&ProxyParams::default()).unwrap();
        assert!(config.client(Duration::from_secs(5)).is_ok());
        assert!(config.streaming_client().is_ok());
    }

    #[test]
    fn ntlm_without_url_is_rejected() {
        let params = ProxyParams {
            ntlm_auth: true,
            ..ProxyParams::default()
        };
        assert!(matches!(
            HttpConfig::new(&params),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn ntlm_without_credentials_is_rejected() {
        let params = ProxyParams {
            url: Some("http://proxy.internal:8080".into()),
            ntlm_auth: true,
            user: Some("user".into()),
            ..ProxyParams::default()
        };
        assert!(matches!(
            HttpConfig::new(&params),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn invalid_proxy_url_is_rejected() {
        let params = ProxyParams {
            url: Some("::not-a-url::".into()),
            ..ProxyParams::default()
        };
        assert!(matches!(
            HttpConfig::new(&params),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn unreadable_ca_file_is_rejected() {
        let params = ProxyParams {
            ca_cert_files: vec!["/definitely/not/here.pem".into()],
            ..ProxyParams::default()
        };
        assert!(matches!(
            HttpConfig::new(&params),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn garbage_ca_file_is_rejected() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "not a pem").unwrap();

        let params = ProxyParams {
            ca_cert_files: vec![tmp.path().to_str().unwrap().to_string()],
            ..ProxyParams::default()
        };
        assert!(matches!(
            HttpConfig::new(&params),
            Err(RelayError::Config(_))
        ));
    }
}
