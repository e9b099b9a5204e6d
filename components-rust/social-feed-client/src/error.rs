use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the hosted backend (rest, storage or auth endpoint).
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{message}{}", origin(.code, .status))]
pub struct BackendError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

fn origin(code: &Option<String>, status: &Option<u16>) -> String {
    match (code, status) {
        (Some(code), _) => format!(" ({code})"),
        (None, Some(status)) => format!(" (status {status})"),
        (None, None) => String::new(),
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        let mut result = BackendError::new(err.to_string());
        result.status = err.status().map(|s| s.as_u16());
        result
    }
}

#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("authentication required")]
    NotAuthenticated,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot follow yourself")]
    SelfFollow,

    #[error("target user is required")]
    MissingTarget,

    #[error("invalid email: {0}")]
    InvalidEmail(String),

    #[error("content must not be empty")]
    EmptyContent,

    #[error("comment {parent_id} is not a top-level comment of post {post_id}")]
    InvalidParent { post_id: String, parent_id: String },

    #[error("post {0} is not owned by the current user")]
    NotOwner(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Raised locally, before any request reaches the backend.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::NotAuthenticated
                | Error::NotFound { .. }
                | Error::SelfFollow
                | Error::MissingTarget
                | Error::InvalidEmail(_)
                | Error::EmptyContent
                | Error::InvalidParent { .. }
                | Error::NotOwner(_)
        )
    }

    pub fn backend_code(&self) -> Option<&str> {
        match self {
            Error::Backend(err) => err.code.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Backend(err.into())
    }
}
