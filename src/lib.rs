//! A piece and block picker for BitTorrent engines.
//!
//! The picker decides, for a given peer and a given moment, which block of
//! the torrent to request next. It tracks swarm-wide piece availability,
//! per-piece download progress at block granularity, and per-piece
//! priorities, and selects blocks rarest-first (or sequentially), preferring
//! to finish partially downloaded pieces before starting new ones.
//!
//! The picker performs no I/O and holds no locks: it is a purely in-memory
//! component meant to be driven by the peer protocol layer from a single
//! logical context. Wire traffic, disk writes and hash verification are the
//! caller's business; the picker only hands out [`BlockAddr`] values and
//! tracks each block's lifecycle as the caller reports progress.

mod availability;
mod download;
pub mod error;
mod piece_picker;

pub use availability::AvailabilityTable;
pub use download::{PeerSpeed, PieceDownload};
pub use piece_picker::{
    PickOptions, PieceOrder, PiecePicker, DEFAULT_PRIORITY, MAX_PRIORITY,
};

use std::fmt;

use bitvec::prelude::{BitVec, Msb0};

/// The bitfield represents the piece availability of a peer. It is a compact
/// bool vector of most significant bits to least significant bits, that is,
/// where the first highest bit represents the first piece, the second highest
/// element the second piece, and so on (e.g. `0b1100_0001` would mean that we
/// have pieces 0, 1, and 7). A truthy boolean value of a piece's position in
/// this vector means that the peer has the piece, while a falsy value means it
/// doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// The type of a torrent's piece index.
pub type PieceIndex = usize;

/// An opaque handle identifying a peer connection.
///
/// The picker never dereferences or owns anything about a peer, it only
/// compares handles for equality: the caller is free to use an index into its
/// own peer table. This is what ties an outstanding block request to the
/// connection responsible for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerKey(pub u32);

/// Identifies a block within a torrent: the index of the piece it belongs to
/// and the index of the block within that piece.
///
/// Blocks are ordered piece-major, so a sorted sequence of addresses walks the
/// torrent front to back. This is the unit the picker hands out and the unit
/// the caller turns into wire requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr {
    /// The index of the piece of which this is a block.
    pub piece: PieceIndex,
    /// The zero-based index of the block within its piece.
    pub block: usize,
}

impl BlockAddr {
    /// Creates a block address from its piece index and in-piece block index.
    pub fn new(piece: PieceIndex, block: usize) -> Self {
        Self { piece, block }
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(piece {}, block {})", self.piece, self.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that block addresses order piece-major, which the endgame
    // tie-break and the callers' sorted request queues rely on.
    #[test]
    fn test_block_addr_ordering() {
        assert!(BlockAddr::new(0, 5) < BlockAddr::new(1, 0));
        assert!(BlockAddr::new(2, 1) < BlockAddr::new(2, 2));
        assert_eq!(BlockAddr::new(3, 4), BlockAddr::new(3, 4));

        let mut blocks = vec![
            BlockAddr::new(1, 1),
            BlockAddr::new(0, 2),
            BlockAddr::new(1, 0),
            BlockAddr::new(0, 0),
        ];
        blocks.sort();
        assert_eq!(
            blocks,
            vec![
                BlockAddr::new(0, 0),
                BlockAddr::new(0, 2),
                BlockAddr::new(1, 0),
                BlockAddr::new(1, 1),
            ]
        );
    }
}
