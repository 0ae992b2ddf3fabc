//! Hash-window search.
//!
//! Given the hashes of N distinct keys, find a window of contiguous hash bits
//! `(width, offset)` whose value spreads the keys over `2^width` buckets as
//! evenly as possible.
//!
//! Search order is fixed: widths ascending from `log2(next_power_of_two(N))`,
//! offsets ascending from 0. A window replaces the current best only if it is
//! strictly better, so for identical inputs the chosen window is identical.
//! Better means (a) lower maximum bucket occupancy, then (b) more non-empty
//! buckets, i.e. lower average occupancy among non-empty buckets. The first
//! window with maximum occupancy 1 ends the search.

use smallvec::SmallVec;

use crate::backend::config::DispatchConfig;

/// Key indices that landed in one bucket
pub type Bucket = SmallVec<[usize; 2]>;

/// Largest occupancy a plan may have and still drive a two-array branch table
pub const MAX_USABLE_OCCUPANCY: usize = 2;

/// Widest window ever searched. More keys than `2^MAX_TABLE_WIDTH` stay sequential.
pub const MAX_TABLE_WIDTH: u32 = 20;

/// A window of hash bits used as a table index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashWindow {
    pub width: u32,
    pub offset: u32,
}

impl HashWindow {
    /// Bucket index of a hash
    #[inline]
    pub fn slice(&self, hash: u64) -> usize {
        let shifted = if self.offset >= 64 { 0 } else { hash >> self.offset };
        (shifted & self.mask()) as usize
    }

    /// Number of buckets, `2^width`
    #[inline]
    pub fn table_size(&self) -> usize {
        1usize << self.width
    }

    #[inline]
    fn mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }
}

/// Result of the window search. Discarded once code has been emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPlan {
    pub window: HashWindow,
    pub max_occupancy: usize,
    pub nonempty: usize,
    /// `table_size()` buckets, each listing key indices in input order
    pub buckets: Vec<Bucket>,
}

impl HashPlan {
    /// Every key has a bucket to itself
    #[inline]
    pub fn is_perfect(&self) -> bool {
        self.max_occupancy <= 1
    }

    /// Occupancy is low enough for a branch table
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.max_occupancy <= MAX_USABLE_OCCUPANCY
    }

    /// Mean keys per non-empty bucket
    pub fn average_occupancy(&self) -> f64 {
        if self.nonempty == 0 {
            0.0
        } else {
            let keys: usize = self.buckets.iter().map(|b| b.len()).sum();
            keys as f64 / self.nonempty as f64
        }
    }
}

/// Widest window the search will try for `n` keys
fn width_range(n: usize, config: &DispatchConfig) -> Option<(u32, u32)> {
    let start = n.next_power_of_two().trailing_zeros();
    let limit = config.hash_bits.min(MAX_TABLE_WIDTH);
    if start > limit {
        return None;
    }
    let end = start.saturating_add(config.max_extra_width).min(limit);
    Some((start, end))
}

/// Search for the best window over `hashes`. `None` when there is nothing to hash.
pub fn pick_best_window(hashes: &[u64], config: &DispatchConfig) -> Option<HashPlan> {
    if hashes.is_empty() {
        return None;
    }
    let (min_width, max_width) = width_range(hashes.len(), config)?;

    let mut counts: Vec<u32> = vec![0; 1usize << max_width];
    // (window, max, nonempty)
    let mut best: Option<(HashWindow, usize, usize)> = None;

    'search: for width in min_width..=max_width {
        let size = 1usize << width;
        for offset in 0..=(config.hash_bits - width) {
            let window = HashWindow { width, offset };
            counts[..size].iter_mut().for_each(|c| *c = 0);

            let mut max = 0usize;
            let mut nonempty = 0usize;
            for &h in hashes {
                let c = &mut counts[window.slice(h)];
                if *c == 0 {
                    nonempty += 1;
                }
                *c += 1;
                max = max.max(*c as usize);
            }

            let better = match best {
                None => true,
                Some((_, best_max, best_nonempty)) => {
                    max < best_max || (max == best_max && nonempty > best_nonempty)
                }
            };
            if better {
                best = Some((window, max, nonempty));
                if max == 1 {
                    break 'search;
                }
            }
        }
    }

    let (window, max_occupancy, nonempty) = best?;
    let mut buckets: Vec<Bucket> = vec![Bucket::new(); window.table_size()];
    for (i, &h) in hashes.iter().enumerate() {
        buckets[window.slice(h)].push(i);
    }
    Some(HashPlan {
        window,
        max_occupancy,
        nonempty,
        buckets,
    })
}
