use std::io::Error as IoError;
use thiserror::Error;

/// A depacketizer `Result`, conveniently wrapping [DepacketizerError]
pub type Result<T> = std::result::Result<T, DepacketizerError>;

#[derive(Error, Debug)]
/// Error types which can occur while depacketizing a CCSDS space packet stream.
///
/// Most of the taxonomy this pipeline recognizes (invalid packets, sequence
/// mismatches, invalid frame headers) are *recoveries*, not fatal errors, and
/// are handled internally by [crate::assembler::FrameAssembler] rather than
/// surfaced through this type. Only conditions the iterator cannot recover
/// from reach the caller.
pub enum DepacketizerError {
    #[error("I/O error during packet decoding")]
    Io(#[from] IoError),

    /// Fewer than a primary header's worth of bytes remained in the
    /// stream. Not a fatal error: it's how [crate::packet::SpacePacket::read]
    /// signals end of stream to its callers.
    #[error("end of packet stream")]
    EndOfStream,
}
