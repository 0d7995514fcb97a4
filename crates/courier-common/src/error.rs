//! Error types for Courier

use thiserror::Error;

/// Main error type for Courier
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("No email provider available")]
    NoProviderAvailable,

    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Courier
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Cache(_) => 500,
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Auth(_) => 401,
            Error::PermissionDenied(_) => 403,
            Error::Template(_) => 422,
            Error::NoProviderAvailable => 503,
            Error::AllProvidersFailed(_) => 502,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Cache(_) => "CACHE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::PermissionDenied(_) => "FORBIDDEN",
            Error::Template(_) => "TEMPLATE_ERROR",
            Error::NoProviderAvailable => "NO_PROVIDER_AVAILABLE",
            Error::AllProvidersFailed(_) => "ALL_PROVIDERS_FAILED",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Validation("x".into()).status_code(), 400);
        assert_eq!(Error::NoProviderAvailable.status_code(), 503);
        assert_eq!(Error::Template("missing".into()).code(), "TEMPLATE_ERROR");
    }

    #[test]
    fn test_delivery_error_codes() {
        let err = Error::AllProvidersFailed("resend: timeout; mailjet: bad key".to_string());
        assert_eq!(
            err.to_string(),
            "All providers failed: resend: timeout; mailjet: bad key"
        );
        assert_eq!(err.code(), "ALL_PROVIDERS_FAILED");
        assert_eq!(Error::PermissionDenied("no".into()).status_code(), 403);
        assert_eq!(Error::PermissionDenied("no".into()).code(), "FORBIDDEN");
    }
}
