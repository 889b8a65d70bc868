use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bad credentials or token. Never carries the credential itself.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing headers, empty type list, unknown join kind, unknown column.
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Malformed record at line {line}: {message}")]
    MalformedRecord { line: u64, message: String },

    /// I/O failure while a stream is in flight.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The store could not coerce a value into the column type.
    #[error("Type error: {0}")]
    Type(String),

    /// The store rejected a statement for any other reason.
    #[error("Query error: {0}")]
    Query(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn malformed(line: u64, message: impl Into<String>) -> Self {
        BridgeError::MalformedRecord {
            line,
            message: message.into(),
        }
    }

    /// Status code the HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Authentication(_) => 401,
            BridgeError::Config(_)
            | BridgeError::Schema(_)
            | BridgeError::MalformedRecord { .. } => 400,
            BridgeError::Type(_) => 422,
            BridgeError::Connection(_) => 502,
            BridgeError::Transfer(_) | BridgeError::Query(_) | BridgeError::Json(_) => 500,
        }
    }

    /// Only a failure to reach the store is worth retrying, and only for
    /// read-only operations. The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Connection(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        // Producer failures travel through the body stream as io::Error.
        let message = e.to_string();
        match e.into_inner() {
            Some(inner) => match inner.downcast::<BridgeError>() {
                Ok(bridge) => *bridge,
                Err(_) => BridgeError::Transfer(message),
            },
            None => BridgeError::Transfer(message),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest includes the URL in its message; the URL carries the SQL but
        // never credentials (those go in headers).
        if e.is_connect() || e.is_timeout() || e.is_builder() {
            BridgeError::Connection(e.without_url().to_string())
        } else {
            BridgeError::Transfer(e.without_url().to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
