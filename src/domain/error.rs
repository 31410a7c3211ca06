use thiserror::Error;

/// Error type for peripheral address parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("expected 6 octets, got {0}")]
    InvalidLength(usize),

    #[error("invalid octet: {0:?}")]
    InvalidOctet(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_error_display() {
        assert_eq!(AddressError::Empty.to_string(), "empty address");
        assert_eq!(
            AddressError::InvalidLength(4).to_string(),
            "expected 6 octets, got 4"
        );
        assert_eq!(
            AddressError::InvalidOctet("ZZ".to_string()).to_string(),
            "invalid octet: \"ZZ\""
        );
    }
}
