//! Error types for expression graphs and density estimators.
//!
//! A single error enum covers the whole workspace. Contract violations
//! (duplicate parameter names, unknown methods, unimplemented hooks) and
//! numerical corruption are reported through it; rejecting a redundant
//! inducing point is *not* an error and is reported as `Ok(false)` by the
//! SPD maintainer instead.

use thiserror::Error;

/// Errors that can occur while building or evaluating an expression graph.
#[derive(Debug, Error)]
pub enum EmetaError {
    /// Method or hook not implemented.
    ///
    /// Raised when an abstract hook is called on a kind that does not
    /// provide it.
    #[error("Feature not implemented: {feature}")]
    NotImplemented {
        /// Name of the unimplemented feature
        feature: String,
    },

    /// A parameter with the same name already exists in the graph.
    #[error("Duplicate parameter name: {name}")]
    DuplicateParameter {
        /// The offending name
        name: String,
    },

    /// Attribute access named a method missing from the registry.
    #[error("Unknown method: {name}")]
    UnknownMethod {
        /// The requested method name
        name: String,
    },

    /// A node id that does not belong to the graph.
    #[error("Unknown node: {node}")]
    UnknownNode {
        /// Description of the node
        node: String,
    },

    /// The node exists but is not a parameter.
    #[error("Node is not a parameter: {node}")]
    NotAParameter {
        /// Description of the node
        node: String,
    },

    /// The node exists but is not an estimator.
    #[error("Node is not an estimator of the requested kind: {node}")]
    NotAnEstimator {
        /// Description of the node
        node: String,
    },

    /// An input leaf was neither fed nor supplied in the context.
    #[error("Missing value for input: {name}")]
    MissingInput {
        /// Name of the input
        name: String,
    },

    /// Dimension mismatch between tensors.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimensions
        expected: String,
        /// Actual dimensions
        actual: String,
    },

    /// Invalid argument or configuration value.
    #[error("Invalid parameter: {reason}")]
    InvalidParameter {
        /// Description of the problem
        reason: String,
    },

    /// A matrix that must be positive definite failed to factorize.
    #[error("Matrix is not positive definite: {reason}")]
    NotPositiveDefinite {
        /// Description of the failure
        reason: String,
    },

    /// A matrix that must be inverted is singular.
    #[error("Singular matrix: {reason}")]
    SingularMatrix {
        /// Description of the failure
        reason: String,
    },

    /// Factorization state lost positive definiteness or produced
    /// non-finite entries.
    #[error("Numerical corruption: {reason}")]
    NumericalCorruption {
        /// Description of the corruption
        reason: String,
    },

    /// Malformed line in a persisted file.
    #[error("Parse error at line {line}: {reason}")]
    Parse {
        /// One-based line number
        line: usize,
        /// Description of the problem
        reason: String,
    },

    /// I/O failure on a log, trajectory or histogram file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmetaError {
    /// Create a NotImplemented error for a specific feature.
    pub fn not_implemented<S: Into<String>>(feature: S) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create a DuplicateParameter error.
    pub fn duplicate_parameter<S: Into<String>>(name: S) -> Self {
        Self::DuplicateParameter { name: name.into() }
    }

    /// Create an UnknownMethod error.
    pub fn unknown_method<S: Into<String>>(name: S) -> Self {
        Self::UnknownMethod { name: name.into() }
    }

    /// Create an UnknownNode error.
    pub fn unknown_node<S: std::fmt::Display>(node: S) -> Self {
        Self::UnknownNode {
            node: node.to_string(),
        }
    }

    /// Create a NotAParameter error.
    pub fn not_a_parameter<S: std::fmt::Display>(node: S) -> Self {
        Self::NotAParameter {
            node: node.to_string(),
        }
    }

    /// Create a NotAnEstimator error.
    pub fn not_an_estimator<S: std::fmt::Display>(node: S) -> Self {
        Self::NotAnEstimator {
            node: node.to_string(),
        }
    }

    /// Create a MissingInput error.
    pub fn missing_input<S: Into<String>>(name: S) -> Self {
        Self::MissingInput { name: name.into() }
    }

    /// Create a DimensionMismatch error.
    pub fn dimension_mismatch<S1, S2>(expected: S1, actual: S2) -> Self
    where
        S1: std::fmt::Display,
        S2: std::fmt::Display,
    {
        Self::DimensionMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter<S: Into<String>>(reason: S) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Create a NotPositiveDefinite error.
    pub fn not_positive_definite<S: Into<String>>(reason: S) -> Self {
        Self::NotPositiveDefinite {
            reason: reason.into(),
        }
    }

    /// Create a SingularMatrix error.
    pub fn singular_matrix<S: Into<String>>(reason: S) -> Self {
        Self::SingularMatrix {
            reason: reason.into(),
        }
    }

    /// Create a NumericalCorruption error.
    pub fn numerical_corruption<S: Into<String>>(reason: S) -> Self {
        Self::NumericalCorruption {
            reason: reason.into(),
        }
    }

    /// Create a Parse error.
    pub fn parse<S: Into<String>>(line: usize, reason: S) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    /// Whether this error indicates misuse of the expression DSL rather
    /// than a data or numerical problem.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::NotImplemented { .. }
                | Self::DuplicateParameter { .. }
                | Self::UnknownMethod { .. }
                | Self::UnknownNode { .. }
                | Self::NotAParameter { .. }
                | Self::NotAnEstimator { .. }
        )
    }
}

/// Result type alias for operations that can produce EmetaError.
pub type Result<T> = std::result::Result<T, EmetaError>;
