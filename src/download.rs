use std::time::Instant;

use crate::{error::*, BlockAddr, PeerKey, PieceIndex};

/// The speed class of a peer, as judged by the caller's rate measurements.
///
/// Downloading pieces inherit the class of the peers requesting them, and
/// selection prefers to group peers of similar speed on the same piece so a
/// slow peer doesn't hold up a piece that fast peers would otherwise finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerSpeed {
    Slow,
    Medium,
    Fast,
}

/// The lifecycle state of a single block within a downloading piece.
///
/// The happy path is `Wanted` → `Requested` → `Writing` → `Finished`. A
/// cancelled or abandoned request reverts to `Wanted`; a failed piece hash
/// reverts every block of the piece to `Wanted` at once.
#[derive(Clone, Debug)]
pub(crate) enum BlockState {
    /// The block has not been requested from anyone.
    Wanted,
    /// At least one peer has an outstanding request for the block. The first
    /// peer in the set is the one primarily responsible; more than one entry
    /// only occurs for endgame duplicate requests.
    Requested {
        peers: Vec<PeerKey>,
        last_requested: Instant,
    },
    /// The block's data has arrived from `owner` and is queued for the disk
    /// layer, but the write has not been acknowledged yet.
    Writing { owner: PeerKey },
    /// The block's data has been durably accepted. `by` records whose data
    /// completed the block, which is what lets parole restrictions attribute
    /// every byte of a partial piece to a peer.
    Finished { by: PeerKey },
}

impl Default for BlockState {
    fn default() -> Self {
        Self::Wanted
    }
}

/// Tracks the completion of an ongoing piece download, block by block.
///
/// An instance exists only while at least one block of the piece is in a
/// non-wanted state: the picker creates it on the first request into the
/// piece and drops it when the piece completes (or every claim on it is
/// abandoned). The per-state counters are kept consistent with the block
/// vector so completion checks are O(1).
pub struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// Per-block states, preallocated to the number of blocks in the piece.
    blocks: Vec<BlockState>,
    /// The number of blocks in the `Requested` state.
    num_requested: usize,
    /// The number of blocks in the `Writing` state.
    num_writing: usize,
    /// The number of blocks in the `Finished` state.
    num_finished: usize,
    /// The speed class of the piece, set when requests are made and cleared
    /// once no block of the piece remains requested.
    speed: Option<PeerSpeed>,
}

impl PieceDownload {
    /// Creates a new download instance for the given piece with all blocks
    /// wanted.
    pub(crate) fn new(index: PieceIndex, block_count: usize) -> Self {
        let mut blocks = Vec::new();
        blocks.resize_with(block_count, BlockState::default);
        Self {
            index,
            blocks,
            num_requested: 0,
            num_writing: 0,
            num_finished: 0,
            speed: None,
        }
    }

    /// Returns the index of the piece that is downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Returns the number of blocks the piece is divided into.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the number of blocks with an outstanding request.
    pub fn num_requested(&self) -> usize {
        self.num_requested
    }

    /// Returns the number of blocks queued for the disk layer.
    pub fn num_writing(&self) -> usize {
        self.num_writing
    }

    /// Returns the number of durably accepted blocks.
    pub fn num_finished(&self) -> usize {
        self.num_finished
    }

    /// Returns true if every block of the piece is finished, at which point
    /// the caller is expected to hash-check the piece and report the verdict
    /// via `we_have` or `we_dont_have`.
    pub fn is_complete(&self) -> bool {
        self.num_finished == self.blocks.len()
    }

    /// Returns true if no block is left in the wanted state, i.e. there is
    /// nothing to pick in this piece outside of endgame duplication.
    pub fn is_full(&self) -> bool {
        self.num_requested + self.num_writing + self.num_finished
            == self.blocks.len()
    }

    /// Returns true if no block of the piece is in a non-wanted state, which
    /// is when the entry is dropped.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.num_requested + self.num_writing + self.num_finished == 0
    }

    pub(crate) fn speed(&self) -> Option<PeerSpeed> {
        self.speed
    }

    pub(crate) fn block_state(&self, block: usize) -> &BlockState {
        &self.blocks[block]
    }

    /// Returns the peer primarily responsible for the block in its current
    /// state, or None for a wanted block.
    pub fn downloader(&self, block: usize) -> Option<PeerKey> {
        match &self.blocks[block] {
            BlockState::Wanted => None,
            BlockState::Requested { peers, .. } => peers.first().copied(),
            BlockState::Writing { owner } => Some(*owner),
            BlockState::Finished { by } => Some(*by),
        }
    }

    /// Returns the number of peers with an outstanding request for the
    /// block. More than one means the block is endgame-duplicated.
    pub fn num_requesters(&self, block: usize) -> usize {
        match &self.blocks[block] {
            BlockState::Requested { peers, .. } => peers.len(),
            _ => 0,
        }
    }

    /// Returns when the block was last requested, if it currently is. The
    /// caller's timeout logic observes request age through this; the picker
    /// itself never expires anything.
    pub fn last_requested(&self, block: usize) -> Option<Instant> {
        match &self.blocks[block] {
            BlockState::Requested { last_requested, .. } => {
                Some(*last_requested)
            }
            _ => None,
        }
    }

    /// Returns true if the given peer has an outstanding request for the
    /// block.
    pub fn is_requested_by(&self, block: usize, peer: PeerKey) -> bool {
        match &self.blocks[block] {
            BlockState::Requested { peers, .. } => peers.contains(&peer),
            _ => false,
        }
    }

    /// Transitions a block to `Requested` on behalf of `peer`, or records an
    /// additional requester if another peer already has it outstanding.
    ///
    /// Returns false without changing anything if the block's data has
    /// already arrived (`Writing` or `Finished`): the caller should not
    /// request it from anyone anymore. Re-requesting a block the same peer
    /// already has outstanding only refreshes the request timestamp.
    pub(crate) fn request_block(
        &mut self,
        block: usize,
        peer: PeerKey,
        speed: PeerSpeed,
    ) -> bool {
        match &mut self.blocks[block] {
            state @ BlockState::Wanted => {
                *state = BlockState::Requested {
                    peers: vec![peer],
                    last_requested: Instant::now(),
                };
                self.num_requested += 1;
                if self.speed.is_none() {
                    self.speed = Some(speed);
                }
                true
            }
            BlockState::Requested {
                peers,
                last_requested,
            } => {
                if !peers.contains(&peer) {
                    peers.push(peer);
                }
                *last_requested = Instant::now();
                true
            }
            BlockState::Writing { .. } | BlockState::Finished { .. } => false,
        }
    }

    /// Transitions a block from `Requested` to `Writing`: its data arrived
    /// from `peer` and was handed to the disk layer.
    ///
    /// Any other outstanding requests for the block are forgotten, since the
    /// caller cancels them once data is in hand. Returns false if the data
    /// had already arrived from someone else (the endgame race), an error if
    /// the block was never requested.
    pub(crate) fn write_block(
        &mut self,
        block: usize,
        peer: PeerKey,
    ) -> Result<bool> {
        match &mut self.blocks[block] {
            BlockState::Wanted => Err(Error::InvalidTransition),
            state @ BlockState::Requested { .. } => {
                *state = BlockState::Writing { owner: peer };
                debug_assert!(self.num_requested > 0);
                self.num_requested -= 1;
                self.num_writing += 1;
                if self.num_requested == 0 {
                    // no requests left in this piece, so it no longer has a
                    // speed class
                    self.speed = None;
                }
                Ok(true)
            }
            BlockState::Writing { .. } | BlockState::Finished { .. } => {
                Ok(false)
            }
        }
    }

    /// Transitions a block from `Writing` to `Finished`: the disk layer
    /// acknowledged the block.
    ///
    /// Returns false if the block is already finished (a duplicate arrival
    /// settled earlier), an error if its data was never handed to disk.
    pub(crate) fn finish_block(
        &mut self,
        block: usize,
        peer: PeerKey,
    ) -> Result<bool> {
        match &mut self.blocks[block] {
            BlockState::Wanted | BlockState::Requested { .. } => {
                Err(Error::InvalidTransition)
            }
            state @ BlockState::Writing { .. } => {
                *state = BlockState::Finished { by: peer };
                debug_assert!(self.num_writing > 0);
                self.num_writing -= 1;
                self.num_finished += 1;
                Ok(true)
            }
            BlockState::Finished { .. } => Ok(false),
        }
    }

    /// Removes `peer`'s claim on a requested block. The block reverts to
    /// `Wanted` only when the last claim is removed; concurrent endgame
    /// requests from other peers are unaffected.
    ///
    /// Returns true if the peer actually had a claim on the block. Blocks
    /// whose data already arrived are left alone.
    pub(crate) fn abort_request(
        &mut self,
        block: usize,
        peer: PeerKey,
    ) -> bool {
        match &mut self.blocks[block] {
            BlockState::Requested { peers, .. } => {
                let pos = match peers.iter().position(|p| *p == peer) {
                    Some(pos) => pos,
                    None => return false,
                };
                peers.remove(pos);
                if peers.is_empty() {
                    self.blocks[block] = BlockState::Wanted;
                    debug_assert!(self.num_requested > 0);
                    self.num_requested -= 1;
                    if self.num_requested == 0 {
                        self.speed = None;
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Removes every claim `peer` holds on this piece, used when the peer
    /// disconnects. Returns the number of requests released.
    pub(crate) fn clear_peer(&mut self, peer: PeerKey) -> usize {
        let mut released = 0;
        for block in 0..self.blocks.len() {
            if self.abort_request(block, peer) {
                released += 1;
            }
        }
        released
    }

    /// Appends up to `count` wanted blocks of this piece to `blocks`, in
    /// block order. Nothing is marked: the caller commits to a pick with
    /// `mark_as_downloading` when it actually sends the request.
    pub(crate) fn pick_wanted(
        &self,
        count: usize,
        blocks: &mut Vec<BlockAddr>,
    ) -> usize {
        let mut picked = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if picked == count {
                break;
            }
            if let BlockState::Wanted = block {
                blocks.push(BlockAddr::new(self.index, i));
                picked += 1;
            }
        }
        picked
    }

    /// Reports whether every contribution to this piece is attributable to
    /// `peer` alone.
    ///
    /// The first flag covers all non-wanted blocks (requested, writing and
    /// finished); the second only the outstanding requests. A peer on parole
    /// may only touch pieces that are exclusively its own by the first
    /// measure, while the second lets selection treat the piece as this
    /// peer's ongoing work.
    pub(crate) fn requested_from(&self, peer: PeerKey) -> (bool, bool) {
        let mut exclusive = true;
        let mut exclusive_active = true;
        for block in self.blocks.iter() {
            match block {
                BlockState::Wanted => {}
                BlockState::Requested { peers, .. } => {
                    if peers.iter().any(|p| *p != peer) {
                        exclusive = false;
                        exclusive_active = false;
                    }
                }
                BlockState::Writing { owner } => {
                    if *owner != peer {
                        exclusive = false;
                    }
                }
                BlockState::Finished { by } => {
                    if *by != peer {
                        exclusive = false;
                    }
                }
            }
        }
        (exclusive, exclusive_active)
    }
}
