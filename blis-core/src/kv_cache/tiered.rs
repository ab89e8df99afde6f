//! GPU (primary) + CPU (secondary) tiered KV cache with offload/reload.

use super::{BlockId, KvCacheState, KvError};
use crate::request::RequestId;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Gpu,
    Cpu,
}

/// Wraps a GPU tier (the primary single-tier state) and a CPU tier. Offload
/// demotes a block's physical residence to CPU while preserving its hash
/// identity; reload promotes it back on a prefix-cache hit. Both transfer
/// latencies accumulate into a single pending pool, consumed exactly once
/// per instance step.
pub struct TieredKvCache {
    pub gpu: KvCacheState,
    cpu_capacity: usize,
    /// Hashes of blocks currently demoted to CPU (physically absent from
    /// the GPU tier, but still findable for prefix matching).
    cpu_resident: FxHashSet<u64>,
    offload_threshold: f64,
    offload_latency: i64,
    reload_latency: i64,
    pending_transfer_latency: i64,
}

impl TieredKvCache {
    pub fn new(
        gpu_blocks: usize,
        cpu_blocks: usize,
        block_size_tokens: usize,
        offload_threshold: f64,
        offload_latency: i64,
        reload_latency: i64,
    ) -> Self {
        assert!(
            (0.0..=1.0).contains(&offload_threshold),
            "offload_threshold must be in [0, 1], got {offload_threshold}"
        );
        Self {
            gpu: KvCacheState::new(gpu_blocks, block_size_tokens),
            cpu_capacity: cpu_blocks,
            cpu_resident: FxHashSet::default(),
            offload_threshold,
            offload_latency,
            reload_latency,
            pending_transfer_latency: 0,
        }
    }

    /// Block-size-chunk prefix lookup across both tiers. Returns the longest
    /// GPU-resident prefix; if the next block after that prefix is
    /// CPU-resident, triggers a reload (accrues latency, moves it back to
    /// GPU conceptually for the caller's next `gpu.allocate`) and is not
    /// included in the returned prefix (the caller will encounter it as a
    /// normal GPU hit on retry, or as a fresh block if reload didn't land
    /// before the allocation boundary).
    ///
    /// Reload detection only covers the case where the *entire* requested
    /// prefix is CPU-resident (no GPU-resident blocks precede it): checking
    /// deeper into the chain would require re-deriving the GPU tier's
    /// internal hash chain, which it does not expose.
    pub fn cached_blocks(&mut self, tokens: &[u32]) -> Vec<BlockId> {
        let gpu_prefix = self.gpu.cached_blocks(tokens);

        if gpu_prefix.is_empty()
            && let Some(first_chunk) = tokens.chunks(self.gpu.block_size_tokens()).next()
            && first_chunk.len() == self.gpu.block_size_tokens()
        {
            let hash = super::chained_block_hash(None, first_chunk);
            if self.cpu_resident.remove(&hash) {
                self.pending_transfer_latency += self.reload_latency;
            }
        }

        gpu_prefix
    }

    pub fn allocate(
        &mut self,
        request: RequestId,
        tokens: &[u32],
        start: usize,
        end: usize,
        cached_blocks: &[BlockId],
    ) -> Result<Vec<BlockId>, KvError> {
        self.maybe_offload();
        self.gpu.allocate(request, tokens, start, end, cached_blocks)
    }

    pub fn release(&mut self, request: RequestId) {
        self.gpu.release(request);
    }

    /// If GPU utilization exceeds the offload threshold, demotes free
    /// (ref-count zero, still hash-identified) GPU blocks to the CPU tier
    /// until utilization drops back at or below threshold or there is no
    /// victim left.
    fn maybe_offload(&mut self) {
        if self.gpu.utilization() <= self.offload_threshold {
            return;
        }
        if self.cpu_resident.len() >= self.cpu_capacity {
            return;
        }

        // Demote exactly one LRU-free block per call; the instance step
        // loop calls allocate per-request, so pressure is relieved
        // incrementally rather than all at once.
        if let Some(victim) = self.gpu.evict_one_free_hash_identified_block() {
            self.cpu_resident.insert(victim);
            self.pending_transfer_latency += self.offload_latency;
        }
    }

    /// Pure query: does not clear the pool. `INV`: idempotent, two
    /// consecutive reads return the same value.
    pub fn pending_transfer_latency(&self) -> i64 {
        self.pending_transfer_latency
    }

    /// Read-and-clear. A second immediate call returns 0.
    pub fn consume_pending_transfer_latency(&mut self) -> i64 {
        std::mem::take(&mut self.pending_transfer_latency)
    }

    pub fn cpu_resident_count(&self) -> usize {
        self.cpu_resident.len()
    }
}
