//! Error types carried by pending operations and readiness registration.

use thiserror::Error;

use crate::constants::{
    ERROR_CANCELLED, ERROR_INVALID_ARGUMENT, ERROR_NOT_AVAILABLE, ERROR_NOT_IMPLEMENTED,
};
use crate::feature::Feature;

/// D-Bus style error: a dotted error name plus a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct OperationError {
    pub name: String,
    pub message: String,
}

impl OperationError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ERROR_CANCELLED, message)
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(ERROR_NOT_AVAILABLE, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_ARGUMENT, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ERROR_NOT_IMPLEMENTED, message)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Registration errors reported by [`crate::ReadinessHelper::add_introspectables`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("feature {0} is already registered")]
    DuplicateFeature(Feature),
    #[error("feature {feature} depends on unregistered feature {dependency}")]
    UnknownDependency { feature: Feature, dependency: Feature },
    #[error("feature {0} is part of a dependency cycle")]
    DependencyCycle(Feature),
    #[error("cannot register an unset feature")]
    UnsetFeature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_name_and_message() {
        let err = OperationError::not_available("Channel not ready");
        assert_eq!(
            err.to_string(),
            "org.freedesktop.Telepathy.Error.NotAvailable: Channel not ready"
        );
        assert_eq!(err.name(), ERROR_NOT_AVAILABLE);
    }
}
