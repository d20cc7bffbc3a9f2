//! Typed errors for the remote API edge and the credential failover loop.
//!
//! Remote error messages are translated exactly once, in
//! [`ApiError::from_remote`], into an [`ErrorKind`]. Everything above the
//! HTTP edge branches on the kind, never on message text.

use thiserror::Error;

/// Error code the remote service embeds when a key has run out of balance.
pub const BALANCE_EXHAUSTED_CODE: &str = "[820031]";

/// Error code the remote service embeds when a key hit its daily request quota.
pub const DAILY_QUOTA_CODE: &str = "[45022]";

/// Classification of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Daily request quota used up for this credential.
    SoftQuota,
    /// Account balance used up for this credential.
    SoftBalance,
    /// Anything the caller has to see (bad query, revoked key, ...).
    Hard,
    /// Timeouts, rate limits and gateway errors that survived every retry.
    Transient,
}

/// A failed call against the remote search API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    /// Translate an error message returned by the remote service.
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if message.contains(BALANCE_EXHAUSTED_CODE) {
            ErrorKind::SoftBalance
        } else if message.contains(DAILY_QUOTA_CODE) {
            ErrorKind::SoftQuota
        } else {
            ErrorKind::Hard
        };
        Self { kind, message }
    }

    pub fn hard(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Hard,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Soft errors move the executor on to the next credential.
    pub fn is_soft(&self) -> bool {
        matches!(self.kind, ErrorKind::SoftQuota | ErrorKind::SoftBalance)
    }
}

/// Why [`QueryExecutor::execute`](crate::executor::QueryExecutor::execute)
/// could not produce a result.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("no API keys are configured")]
    NoCredentials,

    /// No configured key reaches the requested privilege level.
    #[error("no credential meets privilege floor {floor}")]
    BelowPrivilegeFloor { floor: i8 },

    /// Every eligible key failed with a quota or balance error.
    #[error("all credentials exhausted ({attempted} tried, all out of quota or balance)")]
    Exhausted { attempted: usize },

    /// A key failed with an error that should not be retried on another key.
    #[error("key #{index} ({key}) failed: {source}")]
    Hard {
        /// 1-based position of the key in the configuration.
        index: usize,
        /// Masked key.
        key: String,
        source: ApiError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_code_is_soft() {
        let err = ApiError::from_remote("[820031] F点余额不足");
        assert_eq!(err.kind, ErrorKind::SoftBalance);
        assert!(err.is_soft());
    }

    #[test]
    fn quota_code_is_soft() {
        let err = ApiError::from_remote("[45022] request limit reached for today");
        assert_eq!(err.kind, ErrorKind::SoftQuota);
        assert!(err.is_soft());
    }

    #[test]
    fn other_messages_are_hard() {
        let err = ApiError::from_remote("[-700] Account Invalid");
        assert_eq!(err.kind, ErrorKind::Hard);
        assert!(!err.is_soft());
        assert!(!ApiError::transient("timed out").is_soft());
    }

    #[test]
    fn hard_exec_error_names_the_key() {
        let err = ExecError::Hard {
            index: 2,
            key: "...beef".to_string(),
            source: ApiError::hard("query syntax error"),
        };
        let msg = err.to_string();
        assert!(msg.contains("#2"));
        assert!(msg.contains("...beef"));
        assert!(msg.contains("query syntax error"));
    }
}
