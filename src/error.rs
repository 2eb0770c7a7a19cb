use std::fmt;

#[derive(Debug)]
pub enum CircleRerunError {
    MissingCredential(String),
    NotARepository(String),
    BuildNotFound(String),
    ApiError { status: u16, message: String },
    NetworkError(String),
    ParseError(String),
}

impl fmt::Display for CircleRerunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredential(msg) => write!(f, "Missing credential: {}", msg),
            Self::NotARepository(msg) => write!(f, "Not a git repository: {}", msg),
            Self::BuildNotFound(msg) => write!(f, "Build not found: {}", msg),
            Self::ApiError { status, message } => {
                write!(f, "CircleCI API error (HTTP {}): {}", status, message)
            }
            Self::NetworkError(msg) => write!(f, "Network error: {}", msg),
            Self::ParseError(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for CircleRerunError {}

impl From<reqwest::Error> for CircleRerunError {
    fn from(err: reqwest::Error) -> Self {
        CircleRerunError::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for CircleRerunError {
    fn from(err: serde_json::Error) -> Self {
        CircleRerunError::ParseError(err.to_string())
    }
}
