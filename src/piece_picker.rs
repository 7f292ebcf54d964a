use std::{cmp::Reverse, time::Instant};

use rand::{thread_rng, Rng};

use crate::{
    availability::AvailabilityTable,
    download::{BlockState, PeerSpeed, PieceDownload},
    error::*,
    Bitfield, BlockAddr, PeerKey, PieceIndex,
};

/// The highest selectable piece priority. Priorities range from 0 (never
/// pick) to this value; new pieces start at [`DEFAULT_PRIORITY`].
pub const MAX_PRIORITY: u8 = 7;

/// The priority every piece starts out with.
pub const DEFAULT_PRIORITY: u8 = 4;

/// The order in which candidate new pieces are walked during selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceOrder {
    /// Prefer pieces fewer peers have, so rare data is replicated before its
    /// holders leave the swarm. This is the default.
    RarestFirst,
    /// Walk pieces index-ascending, for callers that stream the download.
    /// Rarity is ignored; only the zero/nonzero priority distinction is
    /// honored.
    Sequential,
}

impl Default for PieceOrder {
    fn default() -> Self {
        Self::RarestFirst
    }
}

/// Options guiding a single [`PiecePicker::pick_pieces`] call.
///
/// The flags only ever narrow or reorder what is picked; none of them make a
/// block eligible that wouldn't otherwise be.
#[derive(Clone, Copy, Debug, Default)]
pub struct PickOptions {
    /// How new pieces are ordered.
    pub order: PieceOrder,
    /// Randomize the starting point among equally-ranked pieces, so a swarm
    /// of peers with identical views doesn't converge on the same piece.
    /// Never affects which pieces are eligible, only which equal candidate
    /// is tried first.
    pub rand_start: bool,
    /// Prefer finishing partially downloaded pieces over starting new ones,
    /// regardless of rarity. Also forced on internally when the set of
    /// partial pieces outgrows the connected-peer count.
    pub prioritize_partials: bool,
    /// The peer is suspected of sending corrupt data: restrict it to whole
    /// pieces nobody else has touched, so any future hash failure is
    /// unambiguously its fault. Endgame duplication is disabled for it.
    pub on_parole: bool,
    /// The peer is choking us but advertised an allowed-fast set (passed via
    /// `suggested_pieces`); only those pieces are eligible.
    pub allowed_fast_only: bool,
}

/// Metadata about a piece relevant for the piece picker.
#[derive(Clone, Copy)]
struct Piece {
    /// The piece's priority: 0 excludes the piece from selection, higher
    /// values are preferred over lower ones.
    priority: u8,
    /// Whether the whole piece has been downloaded and verified.
    have: bool,
    /// Whether a `PieceDownload` entry exists for this piece. Downloading
    /// pieces are picked via the partial-piece pass, never as new pieces.
    downloading: bool,
}

impl Default for Piece {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            have: false,
            downloading: false,
        }
    }
}

/// Decides which blocks to request next, for each peer the caller serves.
///
/// The picker owns three pieces of state: swarm-wide per-piece availability
/// (fed by peer bitfields and have messages), the sparse set of pieces with
/// downloads in progress, and per-piece priority/have flags. Selection walks
/// partially downloaded pieces first, then new pieces rarest-first (or
/// sequentially), and falls back to duplicating other peers' outstanding
/// requests in endgame.
///
/// All operations are bounded, synchronous, in-memory computations; the
/// caller is responsible for serializing access (one owning task, or one
/// coarse lock).
pub struct PiecePicker {
    /// How many peers have each piece.
    availability: AvailabilityTable,
    /// Our metadata on every piece in the torrent, preallocated to the
    /// number of pieces.
    pieces: Vec<Piece>,
    /// The pieces currently being downloaded, kept sorted by piece index and
    /// searched by binary search. Bounded by the caller's request appetite,
    /// not by torrent size.
    downloads: Vec<PieceDownload>,
    /// Candidate new pieces, sorted by (priority desc, availability asc,
    /// index). Rebuilt lazily on the next pick after any mutation flips
    /// `dirty`, since bitfield storms would make eager maintenance
    /// pointless.
    pick_order: Vec<PieceIndex>,
    /// Whether `pick_order` needs rebuilding.
    dirty: bool,
    /// The number of blocks every piece but the last is divided into.
    blocks_per_piece: usize,
    /// The number of blocks in the last, possibly shorter, piece.
    blocks_in_last_piece: usize,
    /// The number of pieces we have, cached for O(1) progress queries.
    num_have: usize,
}

impl PiecePicker {
    /// Creates a new empty piece picker for a torrent with the given block
    /// layout.
    ///
    /// Empty means that we don't have any of the pieces yet, so the picker
    /// will pick all of them, if available from our peers. The layout is
    /// fixed for the picker's lifetime.
    ///
    /// # Panics
    ///
    /// Panics if `piece_count` or `blocks_per_piece` is zero, or if
    /// `blocks_in_last_piece` is zero or larger than `blocks_per_piece`.
    pub fn new(
        blocks_per_piece: usize,
        blocks_in_last_piece: usize,
        piece_count: usize,
    ) -> Self {
        assert!(piece_count > 0);
        assert!(blocks_per_piece > 0);
        assert!(blocks_in_last_piece > 0);
        assert!(blocks_in_last_piece <= blocks_per_piece);

        let mut pieces = Vec::new();
        pieces.resize_with(piece_count, Piece::default);
        Self {
            availability: AvailabilityTable::new(piece_count),
            pieces,
            downloads: Vec::new(),
            pick_order: Vec::new(),
            dirty: true,
            blocks_per_piece,
            blocks_in_last_piece,
            num_have: 0,
        }
    }

    /// Returns the number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Returns the number of blocks the given piece is divided into.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn blocks_in_piece(&self, index: PieceIndex) -> usize {
        assert!(index < self.pieces.len());
        if index + 1 == self.pieces.len() {
            self.blocks_in_last_piece
        } else {
            self.blocks_per_piece
        }
    }

    /// Returns the number of pieces we have.
    pub fn num_have(&self) -> usize {
        self.num_have
    }

    /// Returns the number of missing pieces that are needed to complete the
    /// download.
    pub fn count_missing_pieces(&self) -> usize {
        self.pieces.len() - self.num_have
    }

    /// Returns whether the whole piece has been downloaded and verified.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn have_piece(&self, index: PieceIndex) -> bool {
        assert!(index < self.pieces.len());
        self.pieces[index].have
    }

    // ================== availability ==================

    /// Registers that one more peer has the given piece, e.g. on a `have`
    /// message. Returns the piece's new availability.
    pub fn inc_refcount(&mut self, index: PieceIndex) -> Result<u32> {
        let count = self.availability.inc_refcount(index)?;
        self.dirty = true;
        Ok(count)
    }

    /// Unregisters a peer from the given piece. Returns the piece's new
    /// availability, or an error if the caller double-counted a disconnect.
    pub fn dec_refcount(&mut self, index: PieceIndex) -> Result<u32> {
        let count = self.availability.dec_refcount(index)?;
        self.dirty = true;
        Ok(count)
    }

    /// Registers the availability of a peer's pieces from its full bitfield
    /// on connect, and returns whether we're interested in the peer's
    /// pieces.
    pub fn inc_refcounts(&mut self, pieces: &Bitfield) -> Result<bool> {
        log::trace!("Registering piece availability: {}", pieces);
        self.availability.inc_refcounts(pieces)?;
        self.dirty = true;
        Ok(self.is_interested(pieces))
    }

    /// Unregisters every piece in the peer's bitfield, used when the peer
    /// disconnects.
    pub fn dec_refcounts(&mut self, pieces: &Bitfield) -> Result<()> {
        self.availability.dec_refcounts(pieces)?;
        self.dirty = true;
        Ok(())
    }

    /// Returns the availability of a single piece.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn piece_availability(&self, index: PieceIndex) -> u32 {
        self.availability.get(index)
    }

    /// Copies the per-piece availability counts into the given buffer. A
    /// snapshot for diagnostics and tests; selection reads the live counts.
    pub fn get_availability(&self, avail: &mut Vec<u32>) {
        self.availability.get_availability(avail);
    }

    /// Returns true if the peer behind the given bitfield has at least one
    /// piece that we don't.
    pub fn is_interested(&self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        pieces
            .iter()
            .zip(self.pieces.iter())
            .any(|(peer_has_piece, piece)| *peer_has_piece && !piece.have)
    }

    /// Returns the number of distributed copies of the missing parts of the
    /// torrent among connected peers: the integer part is the availability
    /// of the rarest piece, the fraction the share of pieces above that
    /// tier. Diagnostics only.
    pub fn distributed_copies(&self) -> f64 {
        let mut min = u32::MAX;
        for index in 0..self.pieces.len() {
            min = min.min(self.availability.get(index));
        }
        let above = (0..self.pieces.len())
            .filter(|index| self.availability.get(*index) > min)
            .count();
        min as f64 + above as f64 / self.pieces.len() as f64
    }

    // ================== priority ==================

    /// Sets the priority of a piece. 0 excludes the piece from selection
    /// (though an already-started piece may still be completed); higher
    /// values are preferred over lower ones, up to [`MAX_PRIORITY`].
    ///
    /// Returns true if the priority crossed the zero/nonzero boundary, in
    /// which case the caller should re-evaluate which peers it is interested
    /// in.
    pub fn set_piece_priority(
        &mut self,
        index: PieceIndex,
        priority: u8,
    ) -> Result<bool> {
        if index >= self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        if priority > MAX_PRIORITY {
            return Err(Error::InvalidPriority);
        }
        let old = self.pieces[index].priority;
        self.pieces[index].priority = priority;
        self.dirty = true;
        log::trace!("Piece {} priority {} -> {}", index, old, priority);
        Ok((old == 0) != (priority == 0))
    }

    /// Returns the priority of the piece at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn piece_priority(&self, index: PieceIndex) -> u8 {
        assert!(index < self.pieces.len());
        self.pieces[index].priority
    }

    /// Copies the current priority of every piece into the given buffer.
    pub fn piece_priorities(&self, priorities: &mut Vec<u8>) {
        priorities.clear();
        priorities.extend(self.pieces.iter().map(|piece| piece.priority));
    }

    /// Returns the number of priority-0 pieces we don't have.
    pub fn num_filtered(&self) -> usize {
        self.pieces
            .iter()
            .filter(|piece| piece.priority == 0 && !piece.have)
            .count()
    }

    /// Returns the number of priority-0 pieces we already have.
    pub fn num_have_filtered(&self) -> usize {
        self.pieces
            .iter()
            .filter(|piece| piece.priority == 0 && piece.have)
            .count()
    }

    // ================== block lifecycle ==================

    /// Marks a block as requested from the given peer, transitioning it from
    /// wanted to requested (or recording an additional endgame requester).
    /// Called by the protocol layer when it actually sends the request;
    /// picking alone commits to nothing.
    ///
    /// Returns false if the block's data has already arrived or its piece is
    /// already complete: the data is no longer needed from this peer. This
    /// is the expected outcome of losing an endgame race, not an error.
    pub fn mark_as_downloading(
        &mut self,
        block: BlockAddr,
        peer: PeerKey,
        speed: PeerSpeed,
    ) -> Result<bool> {
        self.validate_block(block)?;
        log::trace!("Marking {} as downloading from peer {:?}", block, peer);

        if self.pieces[block.piece].have {
            return Ok(false);
        }
        match self.find_download(block.piece) {
            Some(pos) => {
                Ok(self.downloads[pos].request_block(block.block, peer, speed))
            }
            None => {
                let pos = self.add_download(block.piece);
                let requested =
                    self.downloads[pos].request_block(block.block, peer, speed);
                debug_assert!(requested);
                Ok(requested)
            }
        }
    }

    /// Marks a block's data as arrived from the given peer and queued for
    /// the disk layer.
    ///
    /// Returns false if another peer's copy arrived first (endgame race) or
    /// the piece is already complete. Data for a block that was never
    /// requested is a caller bug and is rejected.
    pub fn mark_as_writing(
        &mut self,
        block: BlockAddr,
        peer: PeerKey,
    ) -> Result<bool> {
        self.validate_block(block)?;
        log::trace!("Marking {} as writing from peer {:?}", block, peer);

        match self.find_download(block.piece) {
            Some(pos) => self.downloads[pos].write_block(block.block, peer),
            None => {
                if self.pieces[block.piece].have {
                    Ok(false)
                } else {
                    Err(Error::InvalidTransition)
                }
            }
        }
    }

    /// Marks a block as durably accepted by the disk layer.
    ///
    /// Once every block of the piece is finished the piece is fully
    /// downloaded but *not* verified; the caller is expected to hash-check
    /// it (see [`Self::is_piece_finished`]) and report the verdict via
    /// [`Self::we_have`] or [`Self::we_dont_have`].
    ///
    /// Returns false on a duplicate finish; the counters are unaffected.
    pub fn mark_as_finished(
        &mut self,
        block: BlockAddr,
        peer: PeerKey,
    ) -> Result<bool> {
        self.validate_block(block)?;
        log::trace!("Marking {} as finished from peer {:?}", block, peer);

        let pos = match self.find_download(block.piece) {
            Some(pos) => pos,
            None => {
                return if self.pieces[block.piece].have {
                    Ok(false)
                } else {
                    Err(Error::InvalidTransition)
                };
            }
        };
        let finished = self.downloads[pos].finish_block(block.block, peer)?;
        if finished && self.downloads[pos].is_complete() {
            log::debug!(
                "Piece {} fully downloaded, awaiting verification",
                block.piece
            );
        }
        Ok(finished)
    }

    /// Cancels the given peer's outstanding request for a block, reverting
    /// the block to wanted unless other peers still have it requested.
    /// Used on explicit cancels, timeouts and disconnects.
    ///
    /// Returns false if the peer had no claim on the block (e.g. the data
    /// already arrived), which is benign.
    pub fn abort_download(
        &mut self,
        block: BlockAddr,
        peer: PeerKey,
    ) -> Result<bool> {
        self.validate_block(block)?;
        log::trace!("Aborting download of {} by peer {:?}", block, peer);

        let pos = match self.find_download(block.piece) {
            Some(pos) => pos,
            None => return Ok(false),
        };
        let released = self.downloads[pos].abort_request(block.block, peer);
        if self.downloads[pos].is_abandoned() {
            self.erase_download(pos);
        }
        Ok(released)
    }

    /// Cancels every outstanding request held by a disconnecting peer, in
    /// one pass over the downloading pieces. Returns the number of requests
    /// released.
    pub fn clear_peer(&mut self, peer: PeerKey) -> usize {
        let mut released = 0;
        let mut pos = 0;
        while pos < self.downloads.len() {
            released += self.downloads[pos].clear_peer(peer);
            if self.downloads[pos].is_abandoned() {
                self.erase_download(pos);
            } else {
                pos += 1;
            }
        }
        if released > 0 {
            log::debug!(
                "Released {} request(s) of disconnected peer {:?}",
                released,
                peer
            );
        }
        released
    }

    /// Tells the piece picker that we have downloaded and verified the piece
    /// at the given index. Its download entry, if any, is dropped and the
    /// piece is excluded from all future selection. Idempotent.
    pub fn we_have(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        if self.pieces[index].have {
            return Ok(());
        }
        log::trace!("Registering owned piece {}", index);

        if let Some(pos) = self.find_download(index) {
            self.erase_download(pos);
        }
        self.pieces[index].have = true;
        self.num_have += 1;
        self.dirty = true;
        Ok(())
    }

    /// The inverse of [`Self::we_have`]: invalidates a piece, either because
    /// a previously verified piece turned out corrupt on a re-check, or
    /// because a fully downloaded piece failed its hash check. Every block
    /// of the piece reverts to wanted and must be re-requested. Idempotent.
    pub fn we_dont_have(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        log::trace!("Un-registering piece {}", index);

        if let Some(pos) = self.find_download(index) {
            // the piece's data is wrong, none of the finished blocks count
            self.erase_download(pos);
        }
        if self.pieces[index].have {
            self.pieces[index].have = false;
            debug_assert!(self.num_have > 0);
            self.num_have -= 1;
        }
        self.dirty = true;
        Ok(())
    }

    // ================== download queue queries ==================

    /// Returns the pieces currently being downloaded, in piece index order.
    pub fn downloads(&self) -> impl Iterator<Item = &PieceDownload> {
        self.downloads.iter()
    }

    /// Returns true if every block of the piece has been durably accepted,
    /// i.e. the piece awaits hash verification.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn is_piece_finished(&self, index: PieceIndex) -> bool {
        assert!(index < self.pieces.len());
        match self.find_download(index) {
            Some(pos) => self.downloads[pos].is_complete(),
            None => false,
        }
    }

    /// Returns the number of downloaded blocks that haven't passed a hash
    /// check yet.
    pub fn unverified_blocks(&self) -> usize {
        self.downloads.iter().map(|dp| dp.num_finished()).sum()
    }

    /// Returns true if any peer currently has an outstanding request for the
    /// block.
    ///
    /// # Panics
    ///
    /// Panics if the block address is out of range.
    pub fn is_requested(&self, block: BlockAddr) -> bool {
        self.assert_block(block);
        match self.find_download(block.piece) {
            Some(pos) => self.downloads[pos].num_requesters(block.block) > 0,
            None => false,
        }
    }

    /// Returns true if the block's data has arrived (it is writing or
    /// finished), or its whole piece is already complete.
    ///
    /// # Panics
    ///
    /// Panics if the block address is out of range.
    pub fn is_downloaded(&self, block: BlockAddr) -> bool {
        self.assert_block(block);
        if self.pieces[block.piece].have {
            return true;
        }
        match self.find_download(block.piece) {
            Some(pos) => matches!(
                self.downloads[pos].block_state(block.block),
                BlockState::Writing { .. } | BlockState::Finished { .. }
            ),
            None => false,
        }
    }

    /// Returns true if the block has been durably accepted, or its whole
    /// piece is already complete.
    ///
    /// # Panics
    ///
    /// Panics if the block address is out of range.
    pub fn is_finished(&self, block: BlockAddr) -> bool {
        self.assert_block(block);
        if self.pieces[block.piece].have {
            return true;
        }
        match self.find_download(block.piece) {
            Some(pos) => matches!(
                self.downloads[pos].block_state(block.block),
                BlockState::Finished { .. }
            ),
            None => false,
        }
    }

    /// Returns the number of peers with an outstanding request for the
    /// block. More than one means the block is endgame-duplicated.
    ///
    /// # Panics
    ///
    /// Panics if the block address is out of range.
    pub fn num_requesters(&self, block: BlockAddr) -> usize {
        self.assert_block(block);
        match self.find_download(block.piece) {
            Some(pos) => self.downloads[pos].num_requesters(block.block),
            None => 0,
        }
    }

    /// Returns when the block was last requested, if it currently is. The
    /// caller's timeout logic decides when a request is stuck and calls
    /// [`Self::abort_download`]; the picker never expires anything itself.
    ///
    /// # Panics
    ///
    /// Panics if the block address is out of range.
    pub fn last_requested(&self, block: BlockAddr) -> Option<Instant> {
        self.assert_block(block);
        self.find_download(block.piece)
            .and_then(|pos| self.downloads[pos].last_requested(block.block))
    }

    /// Returns the peer primarily responsible for the block in its current
    /// state, or None for a wanted block.
    ///
    /// # Panics
    ///
    /// Panics if the block address is out of range.
    pub fn get_downloader(&self, block: BlockAddr) -> Option<PeerKey> {
        self.assert_block(block);
        self.find_download(block.piece)
            .and_then(|pos| self.downloads[pos].downloader(block.block))
    }

    /// Fills the given buffer with the peer responsible for each block of
    /// the piece, used to assign blame after a failed hash check.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn get_downloaders(
        &self,
        index: PieceIndex,
        downloaders: &mut Vec<Option<PeerKey>>,
    ) {
        assert!(index < self.pieces.len());
        downloaders.clear();
        match self.find_download(index) {
            Some(pos) => {
                let dp = &self.downloads[pos];
                downloaders
                    .extend((0..dp.block_count()).map(|b| dp.downloader(b)));
            }
            None => {
                downloaders.resize(self.blocks_in_piece(index), None);
            }
        }
    }

    // ================== selection ==================

    /// Picks blocks for the given peer, clearing and filling `picked`.
    ///
    /// `peer_has` is the peer's advertised piece set and must be exactly as
    /// wide as the torrent's piece count. Up to `num_blocks` blocks are
    /// returned (more if `prefer_contiguous_blocks` makes a whole-piece run
    /// overshoot), without duplicates, and, outside of endgame, without
    /// blocks already requested from anyone.
    ///
    /// Selection proceeds in passes:
    ///
    /// 1. blocks of partially downloaded pieces the peer has, to get pieces
    ///    over the finish line before starting new ones;
    /// 2. the caller-supplied suggested pieces, in the order given;
    /// 3. new pieces in the order picked by `options` (rarest-first by
    ///    default), tie-broken by priority class first, then rarity, then
    ///    index;
    /// 4. if nothing at all could be picked and every remaining block is
    ///    requested from someone, duplicates of other peers' outstanding
    ///    requests (endgame), oldest and least-duplicated first.
    ///
    /// Nothing is marked as requested by picking alone: the caller commits
    /// to each block with [`Self::mark_as_downloading`] when it sends the
    /// actual request.
    ///
    /// `num_peers` is a hint of how many peers are connected; zero means no
    /// hint. It bounds the number of open partial pieces and the endgame
    /// duplication fan-out, and never affects which blocks are eligible.
    #[allow(clippy::too_many_arguments)]
    pub fn pick_pieces(
        &mut self,
        peer_has: &Bitfield,
        peer: PeerKey,
        num_blocks: usize,
        prefer_contiguous_blocks: usize,
        options: PickOptions,
        speed: PeerSpeed,
        suggested_pieces: &[PieceIndex],
        num_peers: usize,
        picked: &mut Vec<BlockAddr>,
    ) -> Result<()> {
        picked.clear();
        if peer_has.len() != self.pieces.len() {
            log::warn!("Peer bitfield with disparate number of pieces");
            return Err(Error::InvalidBitfield);
        }
        if num_blocks == 0 {
            return Ok(());
        }
        log::trace!(
            "Picking {} block(s) for peer {:?} ({} partial piece(s))",
            num_blocks,
            peer,
            self.downloads.len()
        );

        let mut options = options;
        // prevent the number of partial pieces from growing indefinitely,
        // scaled by how many peers could be filling them
        if num_peers > 0 && self.downloads.len() > num_peers * 3 / 2 {
            options.prioritize_partials = true;
        }
        // a peer on parole must take whole pieces so blame stays unambiguous
        let prefer_contiguous_blocks = if options.on_parole {
            prefer_contiguous_blocks.max(self.blocks_per_piece)
        } else {
            prefer_contiguous_blocks
        };

        // blocks we should not request unless we can't fill the quota
        // elsewhere: free blocks in partial pieces of a mismatching speed
        // class, or in pieces other peers are actively filling while this
        // peer chases whole pieces
        let mut backups: Vec<BlockAddr> = Vec::new();
        let mut remaining = num_blocks;

        remaining = self.pick_partials(
            peer_has,
            peer,
            remaining,
            prefer_contiguous_blocks,
            &options,
            speed,
            suggested_pieces,
            picked,
            &mut backups,
        );
        if options.prioritize_partials && remaining > 0 {
            remaining = append_backups(picked, &mut backups, remaining);
        }

        if remaining > 0 {
            for &piece in suggested_pieces {
                if remaining == 0 {
                    break;
                }
                if piece >= self.pieces.len() {
                    log::warn!("Suggested piece {} out of range", piece);
                    continue;
                }
                if !self.can_pick(piece, peer_has, &options, suggested_pieces)
                {
                    continue;
                }
                remaining = self.take_new_piece(
                    piece,
                    remaining,
                    prefer_contiguous_blocks,
                    picked,
                );
            }
        }

        if remaining > 0 {
            remaining = match options.order {
                PieceOrder::Sequential => self.pick_sequential(
                    peer_has,
                    remaining,
                    prefer_contiguous_blocks,
                    &options,
                    suggested_pieces,
                    picked,
                ),
                PieceOrder::RarestFirst => self.pick_rarest_first(
                    peer_has,
                    remaining,
                    prefer_contiguous_blocks,
                    &options,
                    suggested_pieces,
                    picked,
                ),
            };
        }

        if remaining > 0 {
            remaining = append_backups(picked, &mut backups, remaining);
        }

        // endgame: every block left is requested from someone, so double up
        // on other peers' requests. Not for peers on parole, and not in the
        // same call as a round of real requests.
        if remaining > 0
            && picked.is_empty()
            && !options.on_parole
            && !self.has_outstanding_requests(peer)
        {
            self.pick_endgame(
                peer_has,
                peer,
                remaining,
                &options,
                suggested_pieces,
                num_peers,
                picked,
            );
        }

        if picked.is_empty() {
            log::debug!("Could not pick any blocks for peer {:?}", peer);
        } else {
            log::debug!(
                "Picked {} block(s) for peer {:?}: {:?}",
                picked.len(),
                peer,
                picked
            );
        }
        Ok(())
    }

    /// First pass: take blocks from pieces already in progress that the peer
    /// has, deferring mismatched pieces to the backup list.
    #[allow(clippy::too_many_arguments)]
    fn pick_partials(
        &self,
        peer_has: &Bitfield,
        peer: PeerKey,
        mut remaining: usize,
        prefer_contiguous_blocks: usize,
        options: &PickOptions,
        speed: PeerSpeed,
        suggested_pieces: &[PieceIndex],
        picked: &mut Vec<BlockAddr>,
        backups: &mut Vec<BlockAddr>,
    ) -> usize {
        for dp in self.downloads.iter() {
            if remaining == 0 {
                break;
            }
            let index = dp.piece_index();
            if !peer_has[index] {
                continue;
            }
            if options.allowed_fast_only && !suggested_pieces.contains(&index)
            {
                continue;
            }
            // note: zero-priority pieces are deliberately still eligible
            // here; abandoning a partially downloaded piece wastes the work
            // already invested in it
            if dp.is_full() {
                continue;
            }

            let (exclusive, exclusive_active) = dp.requested_from(peer);
            // peers on parole may only pick from pieces that only they have
            // contributed to
            if options.on_parole && !exclusive {
                continue;
            }

            // a peer chasing whole pieces avoids fragmenting a piece others
            // are actively filling; keep its blocks as backups
            if prefer_contiguous_blocks > 0 && !exclusive_active {
                if backups.len() < remaining {
                    dp.pick_wanted(remaining - backups.len(), backups);
                }
                continue;
            }

            // a piece already going at a different speed class is a backup
            // unless this peer is the only one with active requests in it
            if let Some(piece_speed) = dp.speed() {
                if piece_speed != speed && !exclusive_active {
                    if backups.len() < remaining {
                        dp.pick_wanted(remaining - backups.len(), backups);
                    }
                    continue;
                }
            }

            let quota = if prefer_contiguous_blocks > 0 {
                remaining.max(prefer_contiguous_blocks)
            } else {
                remaining
            };
            let taken = dp.pick_wanted(quota, picked);
            remaining = remaining.saturating_sub(taken);
        }
        remaining
    }

    /// Walks new pieces index-ascending.
    fn pick_sequential(
        &self,
        peer_has: &Bitfield,
        mut remaining: usize,
        prefer_contiguous_blocks: usize,
        options: &PickOptions,
        suggested_pieces: &[PieceIndex],
        picked: &mut Vec<BlockAddr>,
    ) -> usize {
        for piece in 0..self.pieces.len() {
            if remaining == 0 {
                break;
            }
            if !self.can_pick(piece, peer_has, options, suggested_pieces)
                || suggested_pieces.contains(&piece)
            {
                continue;
            }
            remaining = self.take_new_piece(
                piece,
                remaining,
                prefer_contiguous_blocks,
                picked,
            );
        }
        remaining
    }

    /// Walks new pieces in pick order: highest priority class first, lowest
    /// availability within a class, index as the final tie-break. With
    /// `rand_start`, iteration of each run of equally-ranked pieces starts
    /// at a random offset.
    fn pick_rarest_first(
        &mut self,
        peer_has: &Bitfield,
        mut remaining: usize,
        prefer_contiguous_blocks: usize,
        options: &PickOptions,
        suggested_pieces: &[PieceIndex],
        picked: &mut Vec<BlockAddr>,
    ) -> usize {
        if self.dirty {
            self.update_pick_order();
        }

        let mut start = 0;
        while start < self.pick_order.len() && remaining > 0 {
            // find the run of pieces ranked equally to pick_order[start]
            let key = self.order_key(self.pick_order[start]);
            let mut end = start + 1;
            while end < self.pick_order.len()
                && self.order_key(self.pick_order[end]) == key
            {
                end += 1;
            }
            let run = &self.pick_order[start..end];
            let offset = if options.rand_start {
                thread_rng().gen_range(0..run.len())
            } else {
                0
            };
            for i in 0..run.len() {
                if remaining == 0 {
                    break;
                }
                let piece = run[(offset + i) % run.len()];
                // suggested pieces have already been considered
                if !self.can_pick(piece, peer_has, options, suggested_pieces)
                    || suggested_pieces.contains(&piece)
                {
                    continue;
                }
                remaining = self.take_new_piece(
                    piece,
                    remaining,
                    prefer_contiguous_blocks,
                    picked,
                );
            }
            start = end;
        }
        remaining
    }

    /// Endgame pass: duplicate other peers' outstanding requests, fewest
    /// requesters and oldest request first.
    #[allow(clippy::too_many_arguments)]
    fn pick_endgame(
        &self,
        peer_has: &Bitfield,
        peer: PeerKey,
        remaining: usize,
        options: &PickOptions,
        suggested_pieces: &[PieceIndex],
        num_peers: usize,
        picked: &mut Vec<BlockAddr>,
    ) {
        let mut candidates: Vec<(usize, Instant, BlockAddr)> = Vec::new();
        for dp in self.downloads.iter() {
            let index = dp.piece_index();
            if !peer_has[index] {
                continue;
            }
            if options.allowed_fast_only && !suggested_pieces.contains(&index)
            {
                continue;
            }
            // zero-priority pieces never receive duplicate requests
            if self.pieces[index].priority == 0 {
                continue;
            }
            for block in 0..dp.block_count() {
                if let BlockState::Requested {
                    peers,
                    last_requested,
                } = dp.block_state(block)
                {
                    if peers.contains(&peer) {
                        continue;
                    }
                    // no point asking more peers than are connected
                    if num_peers > 0 && peers.len() >= num_peers {
                        continue;
                    }
                    candidates.push((
                        peers.len(),
                        *last_requested,
                        BlockAddr::new(index, block),
                    ));
                }
            }
        }
        candidates.sort();
        picked.extend(
            candidates
                .into_iter()
                .take(remaining)
                .map(|(_, _, block)| block),
        );
    }

    /// Returns true if a piece is eligible as a *new* download for a peer
    /// with the given piece set.
    fn can_pick(
        &self,
        piece: PieceIndex,
        peer_has: &Bitfield,
        options: &PickOptions,
        suggested_pieces: &[PieceIndex],
    ) -> bool {
        let meta = &self.pieces[piece];
        !meta.have
            && !meta.downloading
            && meta.priority > 0
            && peer_has[piece]
            && (!options.allowed_fast_only
                || suggested_pieces.contains(&piece))
    }

    /// Appends the leading blocks of an untouched piece. With a contiguity
    /// preference the quota may be overshot to keep the run in one piece.
    fn take_new_piece(
        &self,
        piece: PieceIndex,
        remaining: usize,
        prefer_contiguous_blocks: usize,
        picked: &mut Vec<BlockAddr>,
    ) -> usize {
        debug_assert!(!self.pieces[piece].downloading);
        let num_blocks = self.blocks_in_piece(piece);
        let take = num_blocks.min(remaining.max(prefer_contiguous_blocks));
        picked.extend((0..take).map(|block| BlockAddr::new(piece, block)));
        remaining.saturating_sub(take)
    }

    /// Returns true if the peer has any outstanding request recorded.
    fn has_outstanding_requests(&self, peer: PeerKey) -> bool {
        self.downloads.iter().any(|dp| {
            (0..dp.block_count()).any(|block| dp.is_requested_by(block, peer))
        })
    }

    /// Rebuilds the pick order after availability, priority, have or
    /// downloading changes.
    fn update_pick_order(&mut self) {
        let pieces = &self.pieces;
        let availability = &self.availability;
        self.pick_order.clear();
        self.pick_order.extend(
            (0..pieces.len()).filter(|&piece| {
                let meta = &pieces[piece];
                !meta.have && !meta.downloading && meta.priority > 0
            }),
        );
        self.pick_order.sort_by_key(|&piece| {
            (
                Reverse(pieces[piece].priority),
                availability.get(piece),
                piece,
            )
        });
        self.dirty = false;
        log::trace!(
            "Rebuilt pick order with {} candidate piece(s)",
            self.pick_order.len()
        );
    }

    fn order_key(&self, piece: PieceIndex) -> (Reverse<u8>, u32) {
        (
            Reverse(self.pieces[piece].priority),
            self.availability.get(piece),
        )
    }

    // ================== downloading piece bookkeeping ==================

    fn find_download(&self, piece: PieceIndex) -> Option<usize> {
        self.downloads
            .binary_search_by_key(&piece, |dp| dp.piece_index())
            .ok()
    }

    /// Lazily creates the download entry for a piece on its first request.
    fn add_download(&mut self, piece: PieceIndex) -> usize {
        let pos = self
            .downloads
            .binary_search_by_key(&piece, |dp| dp.piece_index())
            .unwrap_err();
        let block_count = self.blocks_in_piece(piece);
        self.downloads
            .insert(pos, PieceDownload::new(piece, block_count));
        self.pieces[piece].downloading = true;
        self.dirty = true;
        pos
    }

    fn erase_download(&mut self, pos: usize) {
        let piece = self.downloads[pos].piece_index();
        self.downloads.remove(pos);
        self.pieces[piece].downloading = false;
        self.dirty = true;
    }

    fn validate_block(&self, block: BlockAddr) -> Result<()> {
        if block.piece >= self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        if block.block >= self.blocks_in_piece(block.piece) {
            return Err(Error::InvalidBlockIndex);
        }
        Ok(())
    }

    fn assert_block(&self, block: BlockAddr) {
        assert!(block.piece < self.pieces.len());
        assert!(block.block < self.blocks_in_piece(block.piece));
    }
}

/// Moves up to `remaining` deferred blocks into the picked list and returns
/// the new remaining count.
fn append_backups(
    picked: &mut Vec<BlockAddr>,
    backups: &mut Vec<BlockAddr>,
    remaining: usize,
) -> usize {
    let take = backups.len().min(remaining);
    picked.extend(backups.drain(..take));
    remaining - take
}
