use crate::codec::CodecError;

#[derive(Debug)]
pub enum Error {
    /// Bad arguments or an unsupported option combination.
    Usage(String),
    /// Read or write failure on the input, output or a scratch file.
    Io(std::io::Error),
    /// Magic, version or record framing mismatch on input.
    Format(String),
    /// MAC/checksum mismatch or a dedup reference out of range.
    /// Carries the chunk id when the failure is chunk-local.
    Integrity { chunk_id: Option<u64> },
    /// A decompression back-end refused its data.
    Codec(CodecError),
    /// Allocation or task spawn failure.
    Resource(String),
    /// Cooperative cancellation observed.
    Canceled,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Resource(format!("worker task failed: {}", e))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Usage(s) => write!(f, "usage error: {}", s),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Format(s) => write!(f, "format error: {}", s),
            Error::Integrity { chunk_id: Some(id) } => {
                write!(f, "integrity check failed (chunk {})", id)
            }
            Error::Integrity { chunk_id: None } => write!(f, "integrity check failed"),
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::Resource(s) => write!(f, "resource error: {}", s),
            Error::Canceled => write!(f, "canceled"),
        }
    }
}

impl Error {
    /// Attach a chunk id to a chunk-local integrity failure.
    pub fn integrity(chunk_id: u64) -> Self {
        Self::Integrity {
            chunk_id: Some(chunk_id),
        }
    }
}
