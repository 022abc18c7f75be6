use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("stream uninitialized")]
    ErrUninitialized,
    #[error("rtt: no last sender report")]
    ErrRttNoLastSenderReport,
    #[error("rtt: not for last sender report")]
    ErrRttNotLastSenderReport,
    #[error("rtt: negative")]
    ErrRttNegative,
    #[error("first packet time adjustment too big")]
    ErrFirstPacketTimeAdjustTooBig,
}
