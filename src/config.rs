//! Connection configuration - how to reach and authenticate to the store
//!
//! A `ConnectionConfig` arrives either as a JSON body from the HTTP shell or
//! from the environment (`.env` supported). It is immutable once built.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Resolve a delimiter token to the character it stands for.
///
/// Accepts a single literal character or one of the two-character escape
/// tokens `\t \n \r \\ \' \" \b \f`.
pub fn resolve_delimiter_token(raw: &str) -> Result<char> {
    let resolved = match raw {
        "\\t" => '\t',
        "\\n" => '\n',
        "\\r" => '\r',
        "\\\\" => '\\',
        "\\'" => '\'',
        "\\\"" => '"',
        "\\b" => '\u{8}',
        "\\f" => '\u{c}',
        _ => {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(BridgeError::Config(format!(
                        "delimiter must be a single character or escape token, got {:?}",
                        raw
                    )))
                }
            }
        }
    };
    Ok(resolved)
}

/// Single-byte field delimiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Delimiter(u8);

impl Delimiter {
    pub const COMMA: Delimiter = Delimiter(b',');
    pub const TAB: Delimiter = Delimiter(b'\t');

    pub fn parse(raw: &str) -> Result<Self> {
        let c = resolve_delimiter_token(raw)?;
        if !c.is_ascii() {
            return Err(BridgeError::Config(format!(
                "delimiter must be a single-byte character, got {:?}",
                c
            )));
        }
        // These collide with quoting and record terminators.
        if matches!(c, '"' | '\n' | '\r') {
            return Err(BridgeError::Config(format!(
                "{:?} cannot be used as a field delimiter",
                c
            )));
        }
        Ok(Delimiter(c as u8))
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn as_char(self) -> char {
        self.0 as char
    }

    pub fn is_whitespace(self) -> bool {
        self.0.is_ascii_whitespace()
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter::COMMA
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl TryFrom<String> for Delimiter {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self> {
        Delimiter::parse(&value)
    }
}

impl From<Delimiter> for String {
    fn from(d: Delimiter) -> Self {
        d.as_char().to_string()
    }
}

/// The one credential used to authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Bearer token / JWT
    Token(String),
    Password { username: String, password: String },
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Token(_) => "token",
            Credential::Password { .. } => "password",
        }
    }

    /// Secret text to scrub from anything shown to a user.
    pub fn secret(&self) -> &str {
        match self {
            Credential::Token(token) => token,
            Credential::Password { password, .. } => password,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Token(_) => f.write_str("Token(***)"),
            Credential::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    8123
}

fn default_username() -> String {
    "default".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_query_timeout_secs() -> u64 {
    60
}

/// How to reach and authenticate to the store.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Takes priority over `password` when non-empty.
    #[serde(default, alias = "token")]
    pub jwt_token: Option<String>,

    #[serde(default)]
    pub delimiter: Delimiter,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Applies to catalog queries only; streams are bounded by the connect
    /// timeout alone.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            protocol: default_protocol(),
            host: host.into(),
            port: default_port(),
            database: database.into(),
            username: default_username(),
            password: None,
            jwt_token: None,
            delimiter: Delimiter::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_password(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.jwt_token = Some(token.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Load from `CLICKHOUSE_*` environment variables after reading `.env`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let parse_u64 = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(v) => v.trim().parse().map_err(|_| {
                    BridgeError::Config(format!("{} must be an integer, got {:?}", key, v))
                }),
                None => Ok(default),
            }
        };

        let mut config = ConnectionConfig::new(
            get("CLICKHOUSE_HOST").unwrap_or_else(|| "localhost".to_string()),
            get("CLICKHOUSE_DATABASE").unwrap_or_else(|| "default".to_string()),
        );
        if let Some(protocol) = get("CLICKHOUSE_PROTOCOL") {
            config.protocol = protocol;
        }
        if let Some(port) = get("CLICKHOUSE_PORT") {
            config.port = port.trim().parse().map_err(|_| {
                BridgeError::Config(format!(
                    "CLICKHOUSE_PORT must be a port number, got {:?}",
                    port
                ))
            })?;
        }
        if let Some(user) = get("CLICKHOUSE_USER") {
            config.username = user;
        }
        config.password = lookup("CLICKHOUSE_PASSWORD");
        config.jwt_token = get("CLICKHOUSE_JWT");
        if let Some(delimiter) = get("CLICKHOUSE_DELIMITER") {
            config.delimiter = Delimiter::parse(&delimiter)?;
        }
        config.connect_timeout_secs =
            parse_u64("CLICKHOUSE_CONNECT_TIMEOUT_SECS", default_connect_timeout_secs())?;
        config.query_timeout_secs =
            parse_u64("CLICKHOUSE_QUERY_TIMEOUT_SECS", default_query_timeout_secs())?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.protocol.as_str(), "http" | "https") {
            return Err(BridgeError::Config(format!(
                "unsupported protocol {:?} (expected http or https)",
                self.protocol
            )));
        }
        if self.host.trim().is_empty() {
            return Err(BridgeError::Config("host must not be empty".to_string()));
        }
        if self.database().is_empty() {
            return Err(BridgeError::Config("database must not be empty".to_string()));
        }
        Ok(())
    }

    /// Trimmed database name.
    pub fn database(&self) -> &str {
        self.database.trim()
    }

    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}/", self.protocol, self.host.trim(), self.port)
    }

    /// Resolve the single credential to authenticate with. A non-empty token
    /// wins over a password.
    pub fn credential(&self) -> Credential {
        match self.jwt_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Credential::Token(token.to_string()),
            _ => Credential::Password {
                username: self.username.clone(),
                password: self.password.clone().unwrap_or_default(),
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint())
            .field("database", &self.database())
            .field("credential", &self.credential())
            .field("delimiter", &self.delimiter)
            .finish()
    }
}
