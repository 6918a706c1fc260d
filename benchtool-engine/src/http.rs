//! Options shared by the remote-write and query HTTP clients.

use std::fmt;
use std::time::Duration;

use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};

/// The header selecting the tenant in multi-tenant backends.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

/// The user agent sent with every request.
pub const USER_AGENT: &str = concat!("benchtool/", env!("CARGO_PKG_VERSION"));

/// HTTP basic authentication credentials.
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: SecretString,
}

impl BasicAuth {
    /// Creates new credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &format_args!("[redacted]"))
            .finish()
    }
}

/// Per-request options applied by both clients.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Timeout of a single request.
    pub timeout: Duration,
    /// Optional basic authentication.
    pub basic_auth: Option<BasicAuth>,
    /// Optional tenant sent in the [`TENANT_HEADER`].
    pub tenant_id: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            basic_auth: None,
            tenant_id: None,
        }
    }
}

impl ClientOptions {
    /// Applies timeout, authentication and tenant to a request.
    pub(crate) fn apply(&self, mut request: RequestBuilder) -> RequestBuilder {
        request = request.timeout(self.timeout);

        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.username, Some(auth.password.expose_secret()));
        }
        if let Some(tenant_id) = self.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            request = request.header(TENANT_HEADER, tenant_id);
        }

        request
    }
}

/// Creates a reqwest client with required defaults.
pub(crate) fn reqwest_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .hickory_dns(true)
        .build()
}
