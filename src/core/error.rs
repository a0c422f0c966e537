use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SpillError {
    #[error("Cannot parse config: {0}")]
    ConfigParsingError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Corrupt spill data: {0}")]
    CorruptData(String),
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Cannot add once iteration has begun")]
    AddAfterIteration,
    #[error("Iterator is exhausted")]
    Exhausted,
}

impl From<std::io::Error> for SpillError {
    fn from(err: std::io::Error) -> Self {
        SpillError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: SpillError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read").into();
        assert_eq!(err, SpillError::IoError("short read".to_string()));
        assert_eq!(err.to_string(), "IO error: short read");
    }
}
