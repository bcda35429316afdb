use std::io;
use std::net;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    //generic errors
    #[error("packet too big")]
    ErrPacketTooBig,
    #[error("too short buffer")]
    ErrShortBuffer,
    #[error("i/o timeout")]
    ErrTimeout,
    #[error("use of closed handle")]
    ErrClosed,
    #[error("delegate released while operation outstanding")]
    ErrDelegateGone,
    #[error("invalid destination address")]
    ErrInvalidDestination,
    #[error("failed to parse IP address")]
    ErrFailedToParseIpaddr,
    #[error("host name must not be empty")]
    ErrHostnameEmpty,

    //STUN transaction errors
    #[error("transaction exists with same id")]
    ErrTransactionExists,
    #[error("transaction not exists")]
    ErrTransactionNotExists,
    #[error("transaction is timed out")]
    ErrTransactionTimeOut,

    //DNS errors
    #[error("dns lookup failed")]
    ErrDnsLookupFailure,
    #[error("query not exists")]
    ErrQueryNotExists,
    #[error("unexpected record type in answer")]
    ErrUnexpectedRecordType,

    //TURN errors
    #[error("failed to connect to any server")]
    ErrFailedToConnectToAnyServer,
    #[error("allocation refresh timed out")]
    ErrRefreshTimeout,
    #[error("unexpected socket failure")]
    ErrUnexpectedSocketFailure,
    #[error("bogus data received on socket")]
    ErrBogusDataOnSocketReceived,
    #[error("user requested shutdown")]
    ErrUserRequestedShutdown,
    #[error("channel number not in configured range")]
    ErrInvalidChannelNumber,
    #[error("channelData length != len(Data)")]
    ErrBadChannelDataLength,
    #[error("no binding found for channel")]
    ErrChannelBindNotFound,
    #[error("no free channel number available")]
    ErrNoFreeChannelNumber,
    #[error("already allocated")]
    ErrAlreadyAllocated,
    #[error("unexpected response type")]
    ErrUnexpectedResponse,
    #[error("stale nonce retry budget exhausted")]
    ErrStaleNonceRetryExhausted,
    #[error("try again")]
    ErrTryAgain,

    //ICE errors
    #[error("no activity within configured window")]
    ErrBackgroundingTimeout,
    #[error("candidate search failed")]
    ErrCandidateSearchFailed,
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,
    #[error("local username fragment is less than 24 bits long")]
    ErrLocalUfragInsufficientBits,
    #[error("local password is less than 128 bits long")]
    ErrLocalPwdInsufficientBits,
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,
    #[error("session not exists")]
    ErrSessionNotExists,
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<net::AddrParseError> for Error {
    fn from(_: net::AddrParseError) -> Self {
        Error::ErrAddressParseFailed
    }
}
