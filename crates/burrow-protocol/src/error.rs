use thiserror::Error;

/// Reasons a datagram fails to decode. The transport drops the datagram and
/// keeps its receive loop running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram has no header terminator")]
    MissingTerminator,

    #[error("header is not valid UTF-8")]
    HeaderNotUtf8,

    #[error("unknown message kind `{0}`")]
    UnknownKind(String),

    #[error("header is missing the {0} field")]
    MissingField(&'static str),

    #[error("invalid {field} field `{value}`")]
    InvalidField {
        field: &'static str,
        value: String,
    },
}
