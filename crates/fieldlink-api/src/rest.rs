// REST polling HTTP client
//
// Thin wrapper over `reqwest::Client` for JSON endpoints polled by the
// API controller: base URL joining, optional basic auth, status checks.

use std::time::Duration;

use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace};
use url::Url;

use crate::error::Error;

/// Default request timeout for polled endpoints.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Basic-auth credentials for a polled endpoint.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: SecretString,
}

/// Connection settings for [`RestClient`].
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: Url,
    pub auth: Option<BasicAuth>,
    pub timeout: Duration,
}

impl RestClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            auth: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// JSON-over-HTTP client for a single remote service.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    auth: Option<BasicAuth>,
}

impl RestClient {
    /// Build a client with its own connection pool.
    pub fn new(config: RestClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("fieldlink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, config.base_url, config.auth))
    }

    /// Build a client around a pre-configured `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url, auth: Option<BasicAuth>) -> Self {
        Self {
            http,
            base_url,
            auth,
        }
    }

    /// The service base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path (or absolute URL) against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url, Error> {
        if path.is_empty() {
            return Ok(self.base_url.clone());
        }
        Ok(self.base_url.join(path)?)
    }

    /// GET a JSON document.
    ///
    /// Any 4xx/5xx status is an [`Error::HttpStatus`]; a body that is
    /// not JSON is an [`Error::Deserialization`] carrying the raw text.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, Error> {
        let url = self.url_for(path)?;
        debug!(%url, "GET");

        let mut request = self.http.get(url.clone());
        if let Some(ref auth) = self.auth {
            request = request.basic_auth(&auth.username, Some(auth.password.expose_secret()));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await?;
        trace!(bytes = body.len(), "response body received");
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    /// GET a file body from any URL, typically one found inside a polled
    /// document.
    ///
    /// Credentials are never attached. Anything but a 2xx status with a
    /// non-empty body is an error.
    pub async fn download(&self, url: &str, timeout: Duration) -> Result<Bytes, Error> {
        let url = self.url_for(url)?;
        debug!(%url, "GET file");

        let response = self.http.get(url.clone()).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(Error::EmptyBody {
                url: url.to_string(),
            });
        }
        trace!(bytes = body.len(), "file received");
        Ok(body)
    }
}
