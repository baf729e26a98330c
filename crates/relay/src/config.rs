// Relay configuration
//
// Loaded from a YAML document with camelCase keys. Every key is optional;
// defaults match the ntfy-notify announcement topics on ntfy.sh.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// Name of the per-user cache subdirectory holding the checkpoint
pub const CACHE_DIR_NAME: &str = "ntfy-notify";

/// Default keep-alive interval in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 300;

/// Largest accepted keep-alive, the range of a signed 32-bit seconds count
pub const MAX_KEEP_ALIVE_SECS: u64 = i32::MAX as u64;

/// Relay configuration as read from disk
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// `host:port` of the ntfy server
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub token: String,
    /// Comma-joined topic filter
    pub topics: String,
    /// Directory for `lastOnline` / `lastId`; resolved by [`Config::resolve`]
    pub cache_dir: Option<PathBuf>,
    pub user_agent: String,
    /// Seconds without a pong before the connection is considered dead
    pub keep_alive: u64,
    /// Run the gap-fill fetch on startup
    pub fetch_missed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "ntfy.sh:443".to_string(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            topics: "ntfy_notify_announcement,ntfy_notify_release".to_string(),
            cache_dir: None,
            user_agent: format!("ntfy-relay/{}", env!("CARGO_PKG_VERSION")),
            keep_alive: DEFAULT_KEEP_ALIVE_SECS,
            fetch_missed: true,
        }
    }
}

// Credentials stay out of logs
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("token", &redact(&self.token))
            .field("topics", &self.topics)
            .field("cache_dir", &self.cache_dir)
            .field("user_agent", &self.user_agent)
            .field("keep_alive", &self.keep_alive)
            .field("fetch_missed", &self.fetch_missed)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl Config {
    /// Read, parse and resolve a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.resolve()
    }

    /// Parse without touching the filesystem
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document is a valid "all defaults" config
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Validate, fill the cache directory default and create it
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        self.keep_alive()?;

        let cache_dir = match self.cache_dir.take() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => dirs::cache_dir()
                .map(|dir| dir.join(CACHE_DIR_NAME))
                .ok_or(ConfigError::NoCacheDir)?,
        };
        ensure_private_dir(&cache_dir)?;
        self.cache_dir = Some(cache_dir);

        Ok(self)
    }

    /// Cache directory; `None` until [`Config::resolve`] has run
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Validated keep-alive interval
    pub fn keep_alive(&self) -> Result<Duration, ConfigError> {
        if self.keep_alive == 0 || self.keep_alive > MAX_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidKeepAlive {
                value: self.keep_alive,
            });
        }
        Ok(Duration::from_secs(self.keep_alive))
    }

    /// Headers sent on both the WebSocket handshake and the poll request
    pub fn auth_headers(&self) -> AuthHeaders {
        let authorization = if !self.token.is_empty() {
            Some(format!("Bearer {}", self.token))
        } else if !self.username.is_empty() && !self.password.is_empty() {
            let credentials = format!("{}:{}", self.username, self.password);
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            Some(format!("Basic {}", encoded))
        } else {
            None
        };

        AuthHeaders {
            authorization,
            user_agent: self.user_agent.clone(),
        }
    }

    /// Subscription and poll URLs for the configured endpoint and topics
    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        Endpoints::for_server(&self.endpoint, &self.topics)
    }
}

#[cfg(unix)]
fn ensure_private_dir(dir: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|source| ConfigError::CacheDir {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn ensure_private_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|source| ConfigError::CacheDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Authorization material resolved from the config
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    /// `Bearer …` or `Basic …`; `None` for anonymous access
    pub authorization: Option<String>,
    pub user_agent: String,
}

impl AuthHeaders {
    pub fn anonymous(user_agent: impl Into<String>) -> Self {
        Self {
            authorization: None,
            user_agent: user_agent.into(),
        }
    }
}

impl std::fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = self
            .authorization
            .as_deref()
            .and_then(|value| value.split_whitespace().next());
        f.debug_struct("AuthHeaders")
            .field("authorization", &scheme)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Resolved URLs for the live stream and the gap-fill poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// `wss://{endpoint}/{topics}/ws`
    pub stream: Url,
    /// `https://{endpoint}/{topics}/json`, without query
    pub poll: Url,
}

impl Endpoints {
    /// Build the TLS URLs used against a real server
    pub fn for_server(endpoint: &str, topics: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            stream: parse_url(format!("wss://{}/{}/ws", endpoint, topics))?,
            poll: parse_url(format!("https://{}/{}/json", endpoint, topics))?,
        })
    }

    /// Use explicit URLs, e.g. plain `ws://` / `http://` against a local server
    pub fn new(stream: Url, poll: Url) -> Self {
        Self { stream, poll }
    }

    /// Poll URL for everything after `since`
    pub fn poll_since(&self, since: &str) -> Url {
        let mut url = self.poll.clone();
        url.query_pairs_mut()
            .append_pair("since", since)
            .append_pair("poll", "1");
        url
    }
}

fn parse_url(url: String) -> Result<Url, ConfigError> {
    Url::parse(&url).map_err(|source| ConfigError::InvalidUrl { url, source })
}
