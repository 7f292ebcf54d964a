use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned on misuse of the picker API.
///
/// Every variant is a caller-side precondition violation: the picker rejects
/// the call before mutating any state, so an error never leaves internal
/// counters inconsistent. Expected steady states (nothing left to pick, a
/// block that arrived twice in endgame) are not errors, they are empty
/// results or `false` returns on the relevant operations.
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A peer bitfield did not have exactly one bit per piece.
    InvalidBitfield,
    /// The piece index is out of range for this torrent.
    InvalidPieceIndex,
    /// The block index is out of range for its piece.
    InvalidBlockIndex,
    /// The piece priority is outside the supported 0-7 range.
    InvalidPriority,
    /// The requested block state transition is not part of the block
    /// lifecycle (e.g. marking a never-requested block as writing).
    InvalidTransition,
    /// An availability decrement would have taken a piece's peer count below
    /// zero, meaning the caller double-counted a disconnect.
    AvailabilityUnderflow,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            InvalidBitfield => write!(fmt, "invalid bitfield length"),
            InvalidPieceIndex => write!(fmt, "invalid piece index"),
            InvalidBlockIndex => write!(fmt, "invalid block index"),
            InvalidPriority => write!(fmt, "invalid piece priority"),
            InvalidTransition => write!(fmt, "invalid block state transition"),
            AvailabilityUnderflow => {
                write!(fmt, "piece availability underflow")
            }
        }
    }
}

impl std::error::Error for Error {}
