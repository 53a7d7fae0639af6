use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::auth::CredentialError;
use crate::client::transport::TransportError;

/// Error code as reported by Reddit: an HTTP status / numeric code, or a name like `RATELIMIT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Number(i64),
    Name(String),
}

impl ErrorCode {
    /// Interpret a JSON error code. Strings stay names, numbers stay numbers.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ErrorCode::Number),
            Value::String(s) if !s.is_empty() => Some(ErrorCode::Name(s.clone())),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            ErrorCode::Name(name) => Some(name),
            ErrorCode::Number(_) => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Number(n) => write!(f, "{}", n),
            ErrorCode::Name(name) => f.write_str(name),
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(status: u16) -> Self {
        ErrorCode::Number(i64::from(status))
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        ErrorCode::Number(code)
    }
}

impl From<&str> for ErrorCode {
    fn from(name: &str) -> Self {
        ErrorCode::Name(name.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(name: String) -> Self {
        ErrorCode::Name(name)
    }
}

impl PartialEq<&str> for ErrorCode {
    fn eq(&self, other: &&str) -> bool {
        self.as_name() == Some(*other)
    }
}

impl PartialEq<u16> for ErrorCode {
    fn eq(&self, other: &u16) -> bool {
        matches!(self, ErrorCode::Number(n) if *n == i64::from(*other))
    }
}

/// One entry of a [`RedditApiError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedditError {
    pub code: ErrorCode,
    pub message: String,
    pub field: Option<String>,
}

impl RedditError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for RedditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.code, self.message)?;
        if let Some(field) = &self.field {
            write!(f, " on field {:?}", field)?;
        }
        Ok(())
    }
}

/// One or more errors reported by Reddit for a single request. The first is the primary error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedditApiError {
    errors: Vec<RedditError>,
}

impl RedditApiError {
    pub fn new(primary: RedditError) -> Self {
        Self {
            errors: vec![primary],
        }
    }

    /// `None` when `errors` is empty.
    pub fn from_errors(errors: Vec<RedditError>) -> Option<Self> {
        (!errors.is_empty()).then_some(Self { errors })
    }

    pub fn push(&mut self, error: RedditError) {
        self.errors.push(error);
    }

    pub fn primary(&self) -> &RedditError {
        &self.errors[0]
    }

    pub fn errors(&self) -> &[RedditError] {
        &self.errors
    }

    /// Whether any entry carries `code`, in any position.
    pub fn has_code<C>(&self, code: C) -> bool
    where
        ErrorCode: PartialEq<C>,
    {
        self.errors.iter().any(|error| error.code == code)
    }
}

impl fmt::Display for RedditApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RedditApiError {}

/// Everything a request through [`RedditClient`](crate::client::RedditClient) can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Api(#[from] RedditApiError),

    /// The server answered with something that is not the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("CSRF token rejected: {0}")]
    Csrf(String),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("request aborted by kill switch")]
    Aborted,

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Aborted => ClientError::Aborted,
            other => ClientError::Transport(other),
        }
    }
}

impl ClientError {
    pub fn api(&self) -> Option<&RedditApiError> {
        match self {
            ClientError::Api(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this is an API error carrying `code`.
    pub fn has_code<C>(&self, code: C) -> bool
    where
        ErrorCode: PartialEq<C>,
    {
        self.api().is_some_and(|err| err.has_code(code))
    }
}
