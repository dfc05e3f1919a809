//! Splitting source ids into cluster-assigned batches
//!
//! Cluster assignment hashes the decimal text of a batch's first id with
//! 32-bit FNV-1a, so an unchanged source always partitions the same way no
//! matter which process runs population.

use std::num::NonZeroU32;

use crate::queue::BatchRange;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Cluster owning the batch that starts at `start_id`
///
/// A cluster size of 0 means no partitioning; everything goes to member 0.
pub fn cluster_for(start_id: i64, cluster_size: u32) -> u32 {
    if cluster_size == 0 {
        return 0;
    }
    fnv1a_32(start_id.to_string().as_bytes()) % cluster_size
}

/// Fixed-size batching of ascending ids
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    batch_size: NonZeroU32,
    cluster_size: u32,
}

impl Partitioner {
    pub fn new(batch_size: NonZeroU32, cluster_size: u32) -> Self {
        Self {
            batch_size,
            cluster_size,
        }
    }

    /// Batches covering every id strictly greater than `watermark`
    ///
    /// `ids` must be ascending. Batches are consecutive runs of at most
    /// `batch_size` ids; the last one may be shorter.
    pub fn partition(&self, ids: &[i64], watermark: Option<i64>) -> Vec<BatchRange> {
        let fresh = match watermark {
            Some(mark) => &ids[ids.partition_point(|id| *id <= mark)..],
            None => ids,
        };

        fresh
            .chunks(self.batch_size.get() as usize)
            .filter_map(|chunk| {
                let (first, last) = (chunk.first()?, chunk.last()?);
                Some(BatchRange {
                    start_id: *first,
                    last_id: *last,
                    cluster_id: cluster_for(*first, self.cluster_size),
                })
            })
            .collect()
    }
}
