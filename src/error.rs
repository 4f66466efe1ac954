use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("packet pool has already been created")]
    ErrPoolAlreadyCreated,
    #[error("packet pool has not been created")]
    ErrPoolNotCreated,
    #[error("packet pool still has {0} packets checked out")]
    ErrPoolPacketsOutstanding(usize),
    #[error("duplicate sequence number")]
    ErrDuplicateSequenceNumber,
    #[error("extended sequence number of zero is reserved")]
    ErrZeroExtendedSequenceNumber,
    #[error("unknown payload type {0}")]
    ErrUnknownPayloadType(u8),
    #[error("payload header is malformed")]
    ErrPayloadHeader,
    #[error("packet is shorter than its RTP header")]
    ErrShortPacket,
    #[error("packet does not fit in the pool buffer")]
    ErrPacketTooLarge,
    #[error("invalid audio packet size {0}")]
    ErrInvalidAudioPacketSize(usize),
    #[error("device rejected codec")]
    ErrDeviceCodecSet,
    #[error("device rejected packet")]
    ErrDevicePacketPut,
    #[error("device failed to start")]
    ErrDeviceStart,
    #[error("task is closed")]
    ErrTaskClosed,
    #[error("Invalid EventRx Channel")]
    ErrInvalidEventRx,

    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),
    #[error("{0}")]
    Rtp(#[from] rtp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}

/// flatten_errs flattens multiple errors into one
pub fn flatten_errs(errs: Vec<Error>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}
