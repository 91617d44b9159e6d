use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following ARBOR-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Connection and dispatch errors
/// - **2000-2999**: Execution errors
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Authentication/Authorization errors
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Connection Errors (1000-1999) ===
    /// ARBOR-1001: Physical connection could not be opened
    ConnectionFailed = 1001,
    /// ARBOR-1004: Connection pool exhausted (acquire timed out)
    PoolExhausted = 1004,
    /// ARBOR-1005: No store executor registered for a backend kind
    UnsupportedBackend = 1005,

    // === Execution Errors (2000-2999) ===
    /// ARBOR-2001: A store executor failed
    BackendExecutionFailed = 2001,
    /// ARBOR-2002: A `${var}` reference did not resolve
    ParameterUnresolved = 2002,
    /// ARBOR-2003: The plan is malformed
    InvalidPlan = 2003,
    /// ARBOR-2004: Unknown serialization format
    UnsupportedFormat = 2004,
    /// ARBOR-2006: Result exceeds the in-memory budget
    BudgetExceeded = 2006,
    /// ARBOR-2008: Execution cancelled or timed out
    ExecutionCancelled = 2008,

    // === Configuration Errors (3000-3999) ===
    /// ARBOR-3001: Invalid configuration
    InvalidConfig = 3001,

    // === Auth Errors (4000-4999) ===
    /// ARBOR-4001: Credential could not be resolved
    CredentialResolutionFailed = 4001,
    /// ARBOR-4002: The plan needs an identity and none usable was supplied
    AuthorizationRequired = 4002,

    // === Internal Errors (5000-5999) ===
    /// ARBOR-5002: Serialization/deserialization failed
    SerializationFailed = 5002,
    /// ARBOR-5003: Programming error (e.g. double release)
    InvariantViolation = 5003,

    /// ARBOR-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "ARBOR-1004")
    pub fn as_str(&self) -> String {
        format!("ARBOR-{:04}", self.as_u16())
    }

    /// Stable kind tag (e.g., "PoolExhausted")
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "ConnectionFailed",
            Self::PoolExhausted => "PoolExhausted",
            Self::UnsupportedBackend => "UnsupportedBackend",
            Self::BackendExecutionFailed => "BackendExecutionFailed",
            Self::ParameterUnresolved => "ParameterUnresolved",
            Self::InvalidPlan => "InvalidPlan",
            Self::UnsupportedFormat => "UnsupportedFormat",
            Self::BudgetExceeded => "BudgetExceeded",
            Self::ExecutionCancelled => "ExecutionCancelled",
            Self::InvalidConfig => "InvalidConfig",
            Self::CredentialResolutionFailed => "CredentialResolutionFailed",
            Self::AuthorizationRequired => "AuthorizationRequired",
            Self::SerializationFailed => "SerializationFailed",
            Self::InvariantViolation => "InvariantViolation",
            Self::Unknown => "Unknown",
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Execution,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Auth,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("ARBOR-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::ConnectionFailed),
            1004 => Ok(Self::PoolExhausted),
            1005 => Ok(Self::UnsupportedBackend),
            2001 => Ok(Self::BackendExecutionFailed),
            2002 => Ok(Self::ParameterUnresolved),
            2003 => Ok(Self::InvalidPlan),
            2004 => Ok(Self::UnsupportedFormat),
            2006 => Ok(Self::BudgetExceeded),
            2008 => Ok(Self::ExecutionCancelled),
            3001 => Ok(Self::InvalidConfig),
            4001 => Ok(Self::CredentialResolutionFailed),
            4002 => Ok(Self::AuthorizationRequired),
            5002 => Ok(Self::SerializationFailed),
            5003 => Ok(Self::InvariantViolation),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Connection,
    Execution,
    Config,
    Auth,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::PoolExhausted.as_str(), "ARBOR-1004");
        assert_eq!(ErrorCode::BackendExecutionFailed.as_str(), "ARBOR-2001");
        assert_eq!(ErrorCode::Unknown.as_str(), "ARBOR-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("ARBOR-1005".to_string()).unwrap(),
            ErrorCode::UnsupportedBackend
        );
        assert_eq!(
            ErrorCode::try_from("ARBOR-9999".to_string()).unwrap(),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn test_error_code_parsing_errors() {
        assert!(ErrorCode::try_from("INVALID".to_string()).is_err());
        assert!(ErrorCode::try_from("ARBOR-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("ARBOR-ABC".to_string()).is_err());
    }

    #[test]
    fn test_every_code_round_trips_through_u16() {
        let codes = [
            ErrorCode::ConnectionFailed,
            ErrorCode::PoolExhausted,
            ErrorCode::UnsupportedBackend,
            ErrorCode::BackendExecutionFailed,
            ErrorCode::ParameterUnresolved,
            ErrorCode::InvalidPlan,
            ErrorCode::UnsupportedFormat,
            ErrorCode::BudgetExceeded,
            ErrorCode::ExecutionCancelled,
            ErrorCode::InvalidConfig,
            ErrorCode::CredentialResolutionFailed,
            ErrorCode::AuthorizationRequired,
            ErrorCode::SerializationFailed,
            ErrorCode::InvariantViolation,
            ErrorCode::Unknown,
        ];
        for code in codes {
            assert_eq!(ErrorCode::try_from(code.as_u16()).unwrap(), code);
        }
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ErrorCode::PoolExhausted.category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            ErrorCode::BackendExecutionFailed.category(),
            ErrorCategory::Execution
        );
        assert_eq!(ErrorCode::InvalidConfig.category(), ErrorCategory::Config);
        assert_eq!(
            ErrorCode::CredentialResolutionFailed.category(),
            ErrorCategory::Auth
        );
        assert_eq!(
            ErrorCode::InvariantViolation.category(),
            ErrorCategory::Internal
        );
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(ErrorCode::AuthorizationRequired.kind(), "AuthorizationRequired");
        assert_eq!(ErrorCode::UnsupportedFormat.kind(), "UnsupportedFormat");
    }
}
