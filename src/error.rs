use mdao_comm::CommError;
use std::fmt;
use std::fmt::Display;

/// Errors raised while assembling a model or while evaluating it.
///
/// Every setup-stage failure is fatal: once `Problem::setup` has returned an error, the problem
/// must be discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid model description: bad metadata, duplicate sibling names, unresolvable
    /// connections, an invalid process allocation and similar.
    Configuration(String),
    /// A variable's declared shape disagrees with the data or indices supplied for it.
    Dimension {
        variable: String,
        expected: usize,
        actual: usize,
    },
    /// A factorization or solve failed on a singular or ill-conditioned system.
    NumericFailure(String),
    /// A variable was accessed that is not visible through the current vector.
    VariableNotFound(String),
    /// A collective operation failed to exchange data.
    Communication(String),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn dimension(variable: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::Dimension {
            variable: variable.into(),
            expected,
            actual,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Error::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Error::Dimension {
                variable,
                expected,
                actual,
            } => write!(
                f,
                "dimension mismatch for variable '{}': expected {} entries, got {}",
                variable, expected, actual
            ),
            Error::NumericFailure(msg) => write!(f, "numeric failure: {}", msg),
            Error::VariableNotFound(name) => write!(f, "variable '{}' not found", name),
            Error::Communication(msg) => write!(f, "communication failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<CommError> for Error {
    fn from(err: CommError) -> Self {
        Error::Communication(err.to_string())
    }
}
