//! Wire status codes and the internal [`Error`] type that maps onto them.

/// Status byte carried in the response header, per `spec.md` §6.
///
/// Represented as a tagged enum internally; only serialized to a raw byte at
/// the wire boundary (see [`crate::wire::header`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Internal,
    BadRequest,
    NotSupported,
    AccessDenied,
    NotFound,
    NotADir,
    IsADir,
    AlreadyExists,
    DirNotEmpty,
    RangeInvalid,
    InvalidPath,
    TooLarge,
    Busy,
}

impl Status {
    /// Raw byte value, fixed by `spec.md` §6 for client compatibility.
    pub fn to_byte(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Internal => 1,
            Status::BadRequest => 2,
            Status::NotSupported => 3,
            Status::AccessDenied => 4,
            Status::NotFound => 5,
            Status::NotADir => 6,
            Status::IsADir => 7,
            Status::AlreadyExists => 8,
            Status::DirNotEmpty => 9,
            Status::RangeInvalid => 10,
            Status::InvalidPath => 11,
            Status::TooLarge => 12,
            Status::Busy => 13,
        }
    }
}

/// Internal error carrying enough context to log, mapped to exactly one
/// [`Status`] at the handler boundary. No `anyhow`/`thiserror`: plain enum
/// with manual conversions, in keeping with how this crate's predecessor
/// modeled `vfs::Error` and `mount::Error`.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Codec(&'static str),
    Status(Status),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Error::Status(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps an internal error to the wire status to send back to the client.
    pub fn status(&self) -> Status {
        match self {
            Error::Status(s) => *s,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Status::NotFound,
                std::io::ErrorKind::AlreadyExists => Status::AlreadyExists,
                std::io::ErrorKind::PermissionDenied => Status::AccessDenied,
                _ => Status::Internal,
            },
            Error::Codec(_) => Status::Internal,
        }
    }

    /// Short human-readable message, truncated to 200 bytes at the framing
    /// boundary when the `ERRMSG` feature is enabled (`spec.md` §4.11).
    pub fn message(&self) -> String {
        match self {
            Error::Status(s) => format!("{s:?}"),
            Error::Io(e) => e.to_string(),
            Error::Codec(msg) => msg.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Error {}
