//! Paged KV cache: single-tier block pool with transactional allocation and
//! content-addressed prefix caching.

mod tiered;

pub use tiered::{TieredKvCache, TierKind};

use crate::request::RequestId;
use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use thiserror::Error;

new_key_type! {
    pub struct BlockId;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("out of free KV blocks: need at least {needed} more, have {available} free")]
    OutOfBlocks { needed: usize, available: usize },
    #[error("request {0:?} has no blocks allocated")]
    NoBlocksForRequest(RequestId),
}

#[derive(Debug, Clone)]
struct Block {
    token_hash: Option<u64>,
    parent_hash: Option<u64>,
    ref_count: u32,
    in_use: bool,
}

impl Block {
    fn empty() -> Self {
        Self {
            token_hash: None,
            parent_hash: None,
            ref_count: 0,
            in_use: false,
        }
    }
}

/// One journaled mutation, undoable in reverse order to restore the
/// pre-call state when an allocation cannot complete.
enum Mutation {
    HashInserted { hash: u64 },
    HashOverwritten { hash: u64, previous: BlockId },
    RefCountChanged { block: BlockId, delta: i64 },
    RemovedFromFreeList { block: BlockId },
    MarkedInUse { block: BlockId, was_in_use: bool },
    AppendedToRequestMap { request: RequestId },
}

/// Content-addressed hash of a block's token sequence, chained to its
/// parent block's hash so two requests sharing a prefix produce identical
/// hashes for the shared blocks (enabling prefix-cache hits).
pub fn chained_block_hash(parent_hash: Option<u64>, tokens: &[u32]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    parent_hash.hash(&mut hasher);
    tokens.hash(&mut hasher);
    hasher.finish()
}

/// Paged block pool. Allocation is transactional: a multi-block allocation
/// for one request either fully succeeds or rolls back every mutation.
pub struct KvCacheState {
    block_size_tokens: usize,
    total_blocks: usize,
    blocks: SlotMap<BlockId, Block>,
    hash_to_block: FxHashMap<u64, BlockId>,
    request_map: FxHashMap<RequestId, Vec<BlockId>>,
    /// LRU list of free (ref_count == 0) blocks; front is least-recently-used
    /// and is the first evicted when a cache miss needs a fresh block.
    free_list: VecDeque<BlockId>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub allocation_failures: u64,
}

impl KvCacheState {
    pub fn new(total_blocks: usize, block_size_tokens: usize) -> Self {
        assert!(total_blocks > 0, "total_blocks must be positive, got {total_blocks}");
        assert!(
            block_size_tokens > 0,
            "block_size_tokens must be positive, got {block_size_tokens}"
        );

        let mut blocks = SlotMap::with_key();
        let mut free_list = VecDeque::with_capacity(total_blocks);
        for _ in 0..total_blocks {
            let id = blocks.insert(Block::empty());
            free_list.push_back(id);
        }

        Self {
            block_size_tokens,
            total_blocks,
            blocks,
            hash_to_block: FxHashMap::default(),
            request_map: FxHashMap::default(),
            free_list,
            cache_hits: 0,
            cache_misses: 0,
            allocation_failures: 0,
        }
    }

    pub fn block_size_tokens(&self) -> usize {
        self.block_size_tokens
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// `INV-4`: free + allocated = total at every step boundary.
    pub fn allocated_blocks(&self) -> usize {
        self.total_blocks - self.free_blocks()
    }

    pub fn utilization(&self) -> f64 {
        self.allocated_blocks() as f64 / self.total_blocks as f64
    }

    /// Walks `tokens` in block-size chunks, hashing each chunk chained to its
    /// parent, and returns the longest prefix of block ids already present in
    /// `hash_to_block`. Block-level granularity: a partial final block never
    /// contributes a cache hit.
    pub fn cached_blocks(&self, tokens: &[u32]) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut parent_hash = None;
        for chunk in tokens.chunks(self.block_size_tokens) {
            if chunk.len() < self.block_size_tokens {
                break;
            }
            let hash = chained_block_hash(parent_hash, chunk);
            match self.hash_to_block.get(&hash) {
                Some(&block_id) => {
                    out.push(block_id);
                    parent_hash = Some(hash);
                }
                None => break,
            }
        }
        out
    }

    /// Allocates blocks covering token range `[start, end)` of `request`'s
    /// full token sequence (`tokens` is the full sequence so parent hashes
    /// chain correctly from position 0), reusing `cached_blocks` for any
    /// already-cached prefix. Either all blocks in the range allocate, or
    /// none do (every mutation rolled back).
    pub fn allocate(
        &mut self,
        request: RequestId,
        tokens: &[u32],
        start: usize,
        end: usize,
        cached_blocks: &[BlockId],
    ) -> Result<Vec<BlockId>, KvError> {
        let mut journal: Vec<Mutation> = Vec::new();
        let mut allocated = Vec::new();
        let mut cached_idx = 0usize;

        let start_block = start / self.block_size_tokens;
        let end_block = end.div_ceil(self.block_size_tokens);

        let result = (|| -> Result<(), KvError> {
            let mut parent_hash = self.parent_hash_before(tokens, start_block);

            for block_idx in start_block..end_block {
                let block_start = block_idx * self.block_size_tokens;
                let block_end = (block_start + self.block_size_tokens).min(tokens.len());
                let chunk = &tokens[block_start..block_end];
                let is_full_block = chunk.len() == self.block_size_tokens;

                if is_full_block {
                    let hash = chained_block_hash(parent_hash, chunk);
                    if let Some(&existing) = self.hash_to_block.get(&hash) {
                        self.hit(existing, &mut journal);
                        allocated.push(existing);
                        parent_hash = Some(hash);
                        cached_idx += 1;
                        continue;
                    }
                    let block_id = self.miss(hash, parent_hash, &mut journal)?;
                    allocated.push(block_id);
                    parent_hash = Some(hash);
                } else {
                    // Partial final block: never cacheable, just needs a
                    // physical block reserved.
                    let block_id = self.miss_uncacheable(&mut journal)?;
                    allocated.push(block_id);
                }
            }
            let _ = cached_blocks;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.request_map.entry(request).or_default().extend(&allocated);
                journal.push(Mutation::AppendedToRequestMap { request });
                Ok(allocated)
            }
            Err(err) => {
                self.rollback(journal);
                self.allocation_failures += 1;
                Err(err)
            }
        }
    }

    fn parent_hash_before(&self, tokens: &[u32], start_block: usize) -> Option<u64> {
        if start_block == 0 {
            return None;
        }
        let mut parent_hash = None;
        for block_idx in 0..start_block {
            let block_start = block_idx * self.block_size_tokens;
            let block_end = block_start + self.block_size_tokens;
            if block_end > tokens.len() {
                break;
            }
            let chunk = &tokens[block_start..block_end];
            parent_hash = Some(chained_block_hash(parent_hash, chunk));
        }
        parent_hash
    }

    fn hit(&mut self, block_id: BlockId, journal: &mut Vec<Mutation>) {
        self.cache_hits += 1;
        let block = &mut self.blocks[block_id];
        if block.ref_count == 0 {
            // Was sitting free but still hash-identified; reclaim it.
            if let Some(pos) = self.free_list.iter().position(|&b| b == block_id) {
                self.free_list.remove(pos);
                journal.push(Mutation::RemovedFromFreeList { block: block_id });
            }
        }
        block.ref_count += 1;
        journal.push(Mutation::RefCountChanged {
            block: block_id,
            delta: 1,
        });
        if !block.in_use {
            let was_in_use = block.in_use;
            block.in_use = true;
            journal.push(Mutation::MarkedInUse {
                block: block_id,
                was_in_use,
            });
        }
    }

    fn miss(
        &mut self,
        hash: u64,
        parent_hash: Option<u64>,
        journal: &mut Vec<Mutation>,
    ) -> Result<BlockId, KvError> {
        self.cache_misses += 1;
        let block_id = self.take_free_block(journal)?;

        if let Some(old_hash) = self.blocks[block_id].token_hash
            && self.hash_to_block.get(&old_hash) == Some(&block_id)
        {
            self.hash_to_block.remove(&old_hash);
            journal.push(Mutation::HashOverwritten {
                hash: old_hash,
                previous: block_id,
            });
        }

        self.hash_to_block.insert(hash, block_id);
        journal.push(Mutation::HashInserted { hash });

        let block = &mut self.blocks[block_id];
        block.token_hash = Some(hash);
        block.parent_hash = parent_hash;
        block.ref_count = 1;
        journal.push(Mutation::RefCountChanged {
            block: block_id,
            delta: 1,
        });
        let was_in_use = block.in_use;
        block.in_use = true;
        journal.push(Mutation::MarkedInUse {
            block: block_id,
            was_in_use,
        });

        Ok(block_id)
    }

    fn miss_uncacheable(&mut self, journal: &mut Vec<Mutation>) -> Result<BlockId, KvError> {
        self.cache_misses += 1;
        let block_id = self.take_free_block(journal)?;
        let block = &mut self.blocks[block_id];
        block.ref_count = 1;
        journal.push(Mutation::RefCountChanged {
            block: block_id,
            delta: 1,
        });
        let was_in_use = block.in_use;
        block.in_use = true;
        journal.push(Mutation::MarkedInUse {
            block: block_id,
            was_in_use,
        });
        Ok(block_id)
    }

    fn take_free_block(&mut self, journal: &mut Vec<Mutation>) -> Result<BlockId, KvError> {
        let block_id = self.free_list.pop_front().ok_or(KvError::OutOfBlocks {
            needed: 1,
            available: 0,
        })?;
        journal.push(Mutation::RemovedFromFreeList { block: block_id });
        Ok(block_id)
    }

    fn rollback(&mut self, journal: Vec<Mutation>) {
        for mutation in journal.into_iter().rev() {
            match mutation {
                Mutation::HashInserted { hash } => {
                    self.hash_to_block.remove(&hash);
                }
                Mutation::HashOverwritten { hash, previous } => {
                    self.hash_to_block.insert(hash, previous);
                }
                Mutation::RefCountChanged { block, delta } => {
                    let b = &mut self.blocks[block];
                    b.ref_count = (b.ref_count as i64 - delta).max(0) as u32;
                }
                Mutation::RemovedFromFreeList { block } => {
                    self.free_list.push_front(block);
                }
                Mutation::MarkedInUse { block, was_in_use } => {
                    self.blocks[block].in_use = was_in_use;
                }
                Mutation::AppendedToRequestMap { request } => {
                    if let Some(v) = self.request_map.get_mut(&request) {
                        v.pop();
                        if v.is_empty() {
                            self.request_map.remove(&request);
                        }
                    }
                }
            }
        }
    }

    /// Decrements ref counts for all of `request`'s blocks; blocks reaching
    /// ref-count zero become free (LRU tail). Safe to call even after a
    /// failed allocation, since the journal never commits partial state to
    /// `request_map` on failure.
    pub fn release(&mut self, request: RequestId) {
        let Some(block_ids) = self.request_map.remove(&request) else {
            return;
        };
        for block_id in block_ids {
            if let Some(block) = self.blocks.get_mut(block_id) {
                block.ref_count = block.ref_count.saturating_sub(1);
                if block.ref_count == 0 {
                    block.in_use = false;
                    self.free_list.push_back(block_id);
                }
            }
        }
    }

    pub fn blocks_for(&self, request: RequestId) -> &[BlockId] {
        self.request_map
            .get(&request)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Used by the tiered cache's offload policy: finds the first free
    /// (ref-count zero) block that still carries a content hash, clears its
    /// hash identity from this tier (the caller is moving that identity to
    /// the CPU tier), and returns the hash that was freed. The block itself
    /// stays in the free list, now fully empty.
    pub(crate) fn evict_one_free_hash_identified_block(&mut self) -> Option<u64> {
        let block_id = self
            .free_list
            .iter()
            .copied()
            .find(|&id| self.blocks[id].token_hash.is_some())?;
        let hash = self.blocks[block_id].token_hash.take().unwrap();
        self.blocks[block_id].parent_hash = None;
        self.hash_to_block.remove(&hash);
        Some(hash)
    }
}
