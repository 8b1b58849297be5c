#![allow(dead_code)]

use std::io;
use std::io::Error as IoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // engine results
    #[error("invalid parameter")]
    ErrInvalidParam,
    #[error("not ready")]
    ErrNotReady,
    #[error("out of memory")]
    ErrNoMemory,
    #[error("no resources")]
    ErrNoResources,
    #[error("port unavailable")]
    ErrPortUnavailable,
    #[error("not supported")]
    ErrNotSupported,

    // codec errors
    #[error("buffer: short")]
    ErrBufferShort,
    #[error("buffer: full")]
    ErrBufferFull,
    #[error("packet too short")]
    ErrPacketTooShort,
    #[error("packet too big")]
    ErrPacketTooBig,
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("RTP padding size invalid")]
    ErrInvalidPadding,
    #[error("invalid RTP version")]
    ErrInvalidVersion,
    #[error("invalid RTCP header length")]
    ErrInvalidHeaderLength,
    #[error("invalid RTCP packet type")]
    ErrInvalidPacketType,
    #[error("invalid total lost count")]
    ErrInvalidTotalLost,
    #[error("compound packet must start with a sender or receiver report")]
    ErrBadFirstPacket,
    #[error("compound packet must contain a CNAME item")]
    ErrMissingCname,
    #[error("SDES item text too long")]
    ErrSdesTextTooLong,
    #[error("BYE reason too long")]
    ErrReasonTooLong,
    #[error("too many sources or reports")]
    ErrTooManyReports,
    #[error("too many chunks")]
    ErrTooManyChunks,
    #[error("XR block length mismatch")]
    ErrXrBlockLength,
    #[error("NACK pair would overflow bitmask")]
    ErrNackPairOverflow,

    // payload framing
    #[error("invalid AMR mode")]
    ErrInvalidAmrMode,
    #[error("invalid EVS mode")]
    ErrInvalidEvsMode,
    #[error("payload framing underrun")]
    ErrPayloadUnderrun,

    #[error("i/o timeout")]
    ErrTimeout,

    #[error("{0}")]
    Io(#[source] IoWrapError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoWrapError(#[from] pub IoError);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoWrapError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoWrapError(e))
    }
}

impl Error {
    pub fn from_std<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(error.to_string())
    }
}
