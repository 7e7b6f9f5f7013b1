//! # Error Types
//!
//! Error types for state store mutations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  dunebugger-core errors (this file)                                    │
//! │  └── StoreError       - Rejected store mutations                       │
//! │                                                                         │
//! │  dunebugger-sync errors (separate crate)                               │
//! │  └── MonitorError     - Config, transport and protocol failures        │
//! │                                                                         │
//! │  Flow: StoreError → MonitorError::InvalidPayload → logged and dropped  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::store::ListenerId;

// =============================================================================
// Store Error
// =============================================================================

/// Errors returned by [`crate::StateStore`].
///
/// A rejected mutation leaves the store untouched and notifies no listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A GPIO update carried an empty identifier.
    #[error("GPIO identifier must not be empty")]
    EmptyGpioId,

    /// `unsubscribe` was called with an id that is not registered.
    #[error("Listener {0} is not registered")]
    UnknownListener(ListenerId),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StoreError::EmptyGpioId.to_string(),
            "GPIO identifier must not be empty"
        );
    }
}
