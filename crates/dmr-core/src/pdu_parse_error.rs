#[derive(Debug, PartialEq, Eq)]
pub enum PduParseErr {
    /// Ran out of bits/bytes while reading a field
    BufferEnded { field: Option<&'static str> },
    /// A field held a value outside its legal range
    InvalidValue { field: &'static str, value: u64 },
    /// Datagram length does not match the fixed length of its command
    InconsistentLength { expected: usize, found: usize },
    /// Leading command token not in the dispatch table
    UnknownCommand,
    /// An ASCII-decimal field failed to parse
    BadDecimalField { field: &'static str },
    /// Forward error correction could not repair the block
    FecFailure { stage: &'static str },
}

impl std::fmt::Display for PduParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferEnded { field: Some(name) } => write!(f, "buffer ended while reading `{}`", name),
            Self::BufferEnded { field: None } => write!(f, "buffer ended"),
            Self::InvalidValue { field, value } => write!(f, "invalid value {} for `{}`", value, field),
            Self::InconsistentLength { expected, found } => {
                write!(f, "inconsistent length: expected {} bytes, found {}", expected, found)
            }
            Self::UnknownCommand => write!(f, "unknown command token"),
            Self::BadDecimalField { field } => write!(f, "bad ASCII-decimal field `{}`", field),
            Self::FecFailure { stage } => write!(f, "FEC failure in {}", stage),
        }
    }
}

/// Checks whether a value matches an expected value. If not, returns PduParseErr::InvalidValue
#[macro_export]
macro_rules! expect_value {
    ($value:ident, $expected:expr) => {
        $crate::expect_value!(@inner $value, $expected, stringify!($value))
    };
    ($value:expr, $expected:expr, $field:expr) => {
        $crate::expect_value!(@inner $value, $expected, $field)
    };

    (@inner $value:expr, $expected:expr, $field:expr) => {{
        let val = $value;
        if val == $expected {
            Ok(())
        } else {
            Err(PduParseErr::InvalidValue {
                field: $field,
                value: val.into(),
            })
        }
    }};
}
