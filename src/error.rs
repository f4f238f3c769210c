/*!
 * Error Types
 *
 * Two failure families reach the connection boundary: framing errors,
 * after which the byte stream cannot be resynchronised, and command errors,
 * which are answered on the wire while the connection stays open.
 */

use thiserror::Error;

/// A malformed or unframeable request
///
/// The connection that produced it is answered with `-ERR protocol error`
/// and closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid type byte {0:#04x}")]
    InvalidType(u8),

    #[error("invalid length or integer field")]
    InvalidInteger,

    #[error("invalid bulk length {0}")]
    InvalidBulkLength(i64),

    #[error("invalid multibulk length {0}")]
    InvalidArrayLength(i64),

    #[error("expected CRLF terminator")]
    MissingTerminator,

    #[error("line longer than {0} bytes")]
    LineTooLong(usize),

    #[error("invalid UTF-8 in line")]
    InvalidUtf8,

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("expected array of bulk strings")]
    NotACommand,
}

/// A well-framed request that cannot be executed
///
/// `Display` yields the exact text sent back as a RESP error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    Unknown(String),

    #[error("ERR wrong number of arguments")]
    WrongArity,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR syntax error")]
    Syntax,
}
