use std::fmt;

/// Error which can occur during [`Operator::process`](super::Operator::process).
#[derive(Debug)]
pub enum ProcessError {
    /// The operator failed and cannot recover from this failure, it should not be used anymore.
    Fatal(anyhow::Error),
    /// The entry is invalid, but the operator itself is fine and can be used on other entries.
    ///
    /// The entry is dropped.
    InvalidEntry(anyhow::Error),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Fatal(e) => write!(f, "fatal error in Operator::process: {e}"),
            ProcessError::InvalidEntry(e) => write!(f, "invalid entry, it has been dropped: {e}"),
        }
    }
}

// Allow to convert from anyhow::Error to process errors

impl<T: Into<anyhow::Error>> From<T> for ProcessError {
    fn from(value: T) -> Self {
        Self::Fatal(value.into())
    }
}

/// Adds the convenient method `error.invalid_entry()`.
pub trait InvalidEntry<T> {
    fn invalid_entry(self) -> Result<T, ProcessError>;
}

impl<T, E: Into<anyhow::Error>> InvalidEntry<T> for Result<T, E> {
    /// Turns this error into [`ProcessError::InvalidEntry`].
    fn invalid_entry(self) -> Result<T, ProcessError> {
        self.map_err(|e| ProcessError::InvalidEntry(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::{InvalidEntry, ProcessError};

    #[test]
    fn conversions() {
        fn fails() -> Result<(), ProcessError> {
            Err(anyhow!("broken"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(ProcessError::Fatal(_))));

        let res: Result<(), std::fmt::Error> = Err(std::fmt::Error);
        let err = res.invalid_entry().unwrap_err();
        assert!(matches!(err, ProcessError::InvalidEntry(_)));
        assert!(err.to_string().starts_with("invalid entry"));
    }
}
