use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("bad RTP version")]
    ErrBadVersion,
    #[error("payload is not a whole number of pixel groups")]
    ErrPartialPixelGroup,
    #[error("unsupported pixel format for this operation")]
    ErrUnsupportedPixelFormat,
    #[error("MTU too small for headers and one pixel group")]
    ErrMtuTooSmall,
    #[error("frame geometry mismatch: {0}")]
    ErrGeometryMismatch(String),
    #[error("{0}")]
    Util(#[from] util::Error),
}

impl From<Error> for util::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Util(u) => u,
            other => util::Error::invalid_argument(other.to_string()),
        }
    }
}
