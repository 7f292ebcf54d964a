use crate::{error::*, Bitfield, PieceIndex};

/// Tracks, for every piece, how many connected peers are known to have it.
///
/// The counts are maintained incrementally as peers announce pieces and
/// disconnect, never recomputed from scratch: the caller increments a piece
/// once per peer that advertises it (via `have` or a full bitfield) and
/// decrements the same pieces when that peer goes away. Availability is
/// tracked independently of whether *we* have a piece, so counts stay
/// meaningful for diagnostics even for completed pieces.
pub struct AvailabilityTable {
    /// Per-piece peer counts, preallocated to the number of pieces in the
    /// torrent.
    counts: Vec<u32>,
}

impl AvailabilityTable {
    /// Creates a table for the given number of pieces, with every piece at
    /// availability zero.
    pub fn new(piece_count: usize) -> Self {
        Self {
            counts: vec![0; piece_count],
        }
    }

    /// Returns the number of pieces tracked.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if the table tracks no pieces.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Returns the availability of a single piece.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn get(&self, index: PieceIndex) -> u32 {
        assert!(index < self.counts.len());
        self.counts[index]
    }

    /// Registers one more peer as having the piece and returns the new
    /// count. Called once per (piece, peer) pair; the matching decrement is
    /// the caller's responsibility.
    pub fn inc_refcount(&mut self, index: PieceIndex) -> Result<u32> {
        let count = self
            .counts
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        *count += 1;
        log::trace!("Piece {} availability incremented to {}", index, count);
        Ok(*count)
    }

    /// Unregisters a peer from the piece and returns the new count.
    ///
    /// Decrementing a piece at zero availability means the caller
    /// double-counted a disconnect; the call is rejected without modifying
    /// the count.
    pub fn dec_refcount(&mut self, index: PieceIndex) -> Result<u32> {
        let count = self
            .counts
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        if *count == 0 {
            log::warn!("Piece {} availability would underflow", index);
            return Err(Error::AvailabilityUnderflow);
        }
        *count -= 1;
        log::trace!("Piece {} availability decremented to {}", index, count);
        Ok(*count)
    }

    /// Registers a whole peer bitfield, used when a peer announces all its
    /// pieces on connect. The bitfield must be exactly as wide as the number
    /// of pieces.
    pub fn inc_refcounts(&mut self, pieces: &Bitfield) -> Result<()> {
        if pieces.len() != self.counts.len() {
            log::warn!("Peer sent bitfield with disparate number of pieces");
            return Err(Error::InvalidBitfield);
        }
        for (index, peer_has_piece) in pieces.iter().enumerate() {
            if *peer_has_piece {
                self.counts[index] += 1;
            }
        }
        Ok(())
    }

    /// Unregisters a whole peer bitfield, used when a peer disconnects.
    ///
    /// The counts are validated up front so an underflow anywhere in the
    /// bitfield leaves the table untouched.
    pub fn dec_refcounts(&mut self, pieces: &Bitfield) -> Result<()> {
        if pieces.len() != self.counts.len() {
            log::warn!("Peer sent bitfield with disparate number of pieces");
            return Err(Error::InvalidBitfield);
        }
        for (index, peer_has_piece) in pieces.iter().enumerate() {
            if *peer_has_piece && self.counts[index] == 0 {
                log::warn!("Piece {} availability would underflow", index);
                return Err(Error::AvailabilityUnderflow);
            }
        }
        for (index, peer_has_piece) in pieces.iter().enumerate() {
            if *peer_has_piece {
                self.counts[index] -= 1;
            }
        }
        Ok(())
    }

    /// Copies the current per-piece counts into the given buffer, clearing
    /// it first.
    ///
    /// This is a snapshot for diagnostics and tests; selection reads the
    /// live counts directly.
    pub fn get_availability(&self, avail: &mut Vec<u32>) {
        avail.clear();
        avail.extend_from_slice(&self.counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that balanced sequences of increments and decrements return
    // every piece to its original availability.
    #[test]
    fn test_balanced_refcounts() {
        let piece_count = 8;
        let mut table = AvailabilityTable::new(piece_count);

        let mut original = Vec::new();
        table.get_availability(&mut original);

        // a peer with every piece, one with the even pieces and one with
        // only piece 3
        let seed = Bitfield::repeat(true, piece_count);
        let mut evens = Bitfield::repeat(false, piece_count);
        for index in (0..piece_count).step_by(2) {
            evens.set(index, true);
        }

        table.inc_refcounts(&seed).unwrap();
        table.inc_refcounts(&evens).unwrap();
        table.inc_refcount(3).unwrap();
        assert_eq!(table.get(0), 2);
        assert_eq!(table.get(3), 2);

        table.dec_refcount(3).unwrap();
        table.dec_refcounts(&evens).unwrap();
        table.dec_refcounts(&seed).unwrap();

        let mut avail = Vec::new();
        table.get_availability(&mut avail);
        assert_eq!(avail, original);
    }

    // Tests that decrementing a piece at zero availability is rejected
    // without modifying any count.
    #[test]
    fn test_underflow_is_rejected() {
        let mut table = AvailabilityTable::new(4);
        assert_eq!(table.dec_refcount(0), Err(Error::AvailabilityUnderflow));

        // a bulk decrement that would underflow any piece must leave the
        // table untouched
        table.inc_refcount(0).unwrap();
        let seed = Bitfield::repeat(true, 4);
        assert_eq!(
            table.dec_refcounts(&seed),
            Err(Error::AvailabilityUnderflow)
        );
        assert_eq!(table.get(0), 1);
    }

    // Tests that out of range indices and mis-sized bitfields are caller
    // errors.
    #[test]
    fn test_input_validation() {
        let mut table = AvailabilityTable::new(4);
        assert_eq!(table.inc_refcount(4), Err(Error::InvalidPieceIndex));
        assert_eq!(table.dec_refcount(9), Err(Error::InvalidPieceIndex));

        let short = Bitfield::repeat(true, 3);
        assert_eq!(table.inc_refcounts(&short), Err(Error::InvalidBitfield));
        assert_eq!(table.dec_refcounts(&short), Err(Error::InvalidBitfield));
    }

    // Tests the snapshot query against a known distribution.
    #[test]
    fn test_availability_snapshot() {
        let mut table = AvailabilityTable::new(5);
        for _ in 0..3 {
            table.inc_refcount(1).unwrap();
        }
        table.inc_refcount(4).unwrap();

        let mut avail = vec![99; 2];
        table.get_availability(&mut avail);
        assert_eq!(avail, vec![0, 3, 0, 0, 1]);
    }
}
