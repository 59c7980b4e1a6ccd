//! Errors raised by declaration, initialization and evaluation.
//!
//! Every variant except [`Error::Calculation`] carries a fully formatted,
//! human-readable message that names the offending System by pathname. An
//! unconnected input port is not an error for plain evaluation; it is
//! reported as `Ok(None)`. [`Error::Unconnected`] is raised only by the
//! "required" evaluation variants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Programmer misuse: double initialization, empty prerequisite sets,
    /// unknown tickets, malformed wiring.
    #[error("{0}")]
    PreconditionViolation(String),

    /// An index beyond the declared count.
    #[error("{0}")]
    OutOfRange(String),

    /// A value whose actual type disagrees with the declared one.
    #[error("{0}")]
    TypeMismatch(String),

    /// A Context that was not created for the System it was passed to.
    #[error("{0}")]
    ContextMismatch(String),

    /// An input port that is neither fixed nor connected, where a value was required.
    #[error("{0}")]
    Unconnected(String),

    /// A cache-entry calculator failed for a reason of its own.
    #[error("calculation of '{description}' failed: {source}")]
    Calculation {
        description: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionViolation,
    OutOfRange,
    TypeMismatch,
    ContextMismatch,
    Unconnected,
    Calculation,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PreconditionViolation(_) => ErrorKind::PreconditionViolation,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Error::ContextMismatch(_) => ErrorKind::ContextMismatch,
            Error::Unconnected(_) => ErrorKind::Unconnected,
            Error::Calculation { .. } => ErrorKind::Calculation,
        }
    }

    /// Converts a calculator failure back into an [`Error`].
    ///
    /// Errors that originated in this crate keep their kind so that, e.g., a
    /// Context mismatch raised three levels down a calculation chain still
    /// surfaces as [`ErrorKind::ContextMismatch`].
    pub(crate) fn from_calculation(description: &str, error: anyhow::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(own) => own,
            Err(source) => Error::Calculation {
                description: description.to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn from_calculation_keeps_own_kinds() {
        let inner: anyhow::Error = Error::OutOfRange("index 4".into()).into();
        let error = Error::from_calculation("output", inner);
        assert_eq!(error.kind(), ErrorKind::OutOfRange);
        assert_eq!(error.to_string(), "index 4");
    }

    #[test]
    fn from_calculation_wraps_foreign_errors() {
        let error = Error::from_calculation("torque output", anyhow!("singular matrix"));
        assert_eq!(error.kind(), ErrorKind::Calculation);
        assert_eq!(
            error.to_string(),
            "calculation of 'torque output' failed: singular matrix"
        );
    }
}
