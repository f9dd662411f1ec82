//! Overlap search: decides where a new block can be placed inside an fblock.
//!
//! A full match means the block is already stored and nothing is written. A
//! partial match means a suffix of the fblock equals a prefix of the block, so
//! only the remainder has to be appended. Full matches use Boyer-Moore with
//! both the bad-character and the good-suffix rule; partial matches scan for
//! the needle's first byte and compare the tail.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Proposed placement of a needle in an fblock. Pure value, mutates nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendInfo {
    /// Fblock size before the operation.
    pub old_size: u64,
    /// Offset where the needle's bytes begin; may lie before `old_size`.
    pub append_base_offset: u64,
    /// Fblock size after the operation: `max(old_size, base + needle_len)`.
    pub appended_size: u64,
}

impl AppendInfo {
    /// Build the placement of a needle of `needle_len` bytes at `base`.
    pub fn new(old_size: u64, append_base_offset: u64, needle_len: u64) -> Self {
        let appended_size = old_size.max(append_base_offset + needle_len);
        Self {
            old_size,
            append_base_offset,
            appended_size,
        }
    }

    /// Bytes that actually have to be written.
    pub fn growth(&self) -> u64 {
        self.appended_size - self.old_size
    }

    /// True if a needle of `needle_len` bytes is already fully stored.
    pub fn is_covered(&self, needle_len: u64) -> bool {
        self.append_base_offset + needle_len <= self.old_size
    }

    /// Bytes of the needle reused from existing fblock content.
    pub fn reused(&self, needle_len: u64) -> u64 {
        needle_len - self.growth()
    }
}

/// Boyer-Moore tables for one needle. Borrows the needle, so the tables
/// cannot outlive it.
#[derive(Debug, Clone)]
pub struct SearchTables<'a> {
    needle: &'a [u8],
    /// Distance from the last occurrence of each byte (excluding the final
    /// needle byte) to the end of the needle; `len` if absent.
    bad_char: [usize; 256],
    /// Shift for a mismatch at each needle position after a matched suffix.
    good_suffix: Vec<usize>,
}

impl<'a> SearchTables<'a> {
    /// Preprocess a needle in O(len). An empty needle has no tables.
    pub fn preprocess(needle: &'a [u8]) -> StoreResult<Self> {
        if needle.is_empty() {
            return Err(StoreError::EmptyNeedle);
        }
        let m = needle.len();

        let mut bad_char = [m; 256];
        for (i, &b) in needle[..m - 1].iter().enumerate() {
            bad_char[b as usize] = m - 1 - i;
        }

        let suff = suffixes(needle);
        let mut good_suffix = vec![m; m];
        let mut j = 0;
        for i in (0..m).rev() {
            if suff[i] == i + 1 {
                while j < m - 1 - i {
                    if good_suffix[j] == m {
                        good_suffix[j] = m - 1 - i;
                    }
                    j += 1;
                }
            }
        }
        for i in 0..m - 1 {
            good_suffix[m - 1 - suff[i]] = m - 1 - i;
        }

        Ok(Self {
            needle,
            bad_char,
            good_suffix,
        })
    }

    /// The needle these tables were built for.
    pub fn needle(&self) -> &'a [u8] {
        self.needle
    }
}

/// `suff[i]` is the length of the longest substring ending at `i` that is
/// also a suffix of the needle.
fn suffixes(x: &[u8]) -> Vec<usize> {
    let m = x.len() as isize;
    let mut suff = vec![0usize; x.len()];
    suff[x.len() - 1] = x.len();
    let mut g = m - 1;
    let mut f = m - 1;
    for i in (0..m - 1).rev() {
        if i > g && (suff[(i + m - 1 - f) as usize] as isize) < i - g {
            suff[i as usize] = suff[(i + m - 1 - f) as usize];
        } else {
            if i < g {
                g = i;
            }
            f = i;
            while g >= 0 && x[g as usize] == x[(g + m - 1 - f) as usize] {
                g -= 1;
            }
            suff[i as usize] = (f - g) as usize;
        }
    }
    suff
}

/// Smallest offset where the needle occurs in `haystack`, or `haystack.len()`.
pub fn search(haystack: &[u8], tables: &SearchTables<'_>) -> usize {
    let x = tables.needle;
    let m = x.len();
    let n = haystack.len();
    if m > n {
        return n;
    }
    let mut j = 0;
    while j <= n - m {
        let mut i = m as isize - 1;
        while i >= 0 && x[i as usize] == haystack[i as usize + j] {
            i -= 1;
        }
        if i < 0 {
            return j;
        }
        let i = i as usize;
        let bc = tables.bad_char[haystack[i + j] as usize] as isize - m as isize + 1 + i as isize;
        let shift = (tables.good_suffix[i] as isize).max(bc);
        j += shift.max(1) as usize;
    }
    n
}

/// Find the longest trailing overlap: the first position `p >= minimum_pos`
/// where the bytes from `p` to the end of `haystack` agree with the needle.
///
/// Only overlaps of at least `minimum_overlap` bytes count, and only
/// positions that are multiples of `overlap_granularity`. A granularity of 0
/// disables the search. Returns `haystack.len()` when nothing qualifies.
pub fn search_with_append_only(
    haystack: &[u8],
    tables: &SearchTables<'_>,
    minimum_pos: usize,
    minimum_overlap: usize,
    overlap_granularity: usize,
) -> usize {
    let n = haystack.len();
    if overlap_granularity == 0 {
        return n;
    }
    let x = tables.needle;
    let m = x.len();
    let minimum_overlap = minimum_overlap.max(1);
    if minimum_overlap > n {
        return n;
    }
    let last = n - minimum_overlap;
    let mut p = minimum_pos.max(n.saturating_sub(m));
    let first = x[0];

    while p <= last {
        let q = match haystack[p..=last].iter().position(|&b| b == first) {
            Some(off) => p + off,
            None => return n,
        };
        if q % overlap_granularity == 0 {
            let overlap = (n - q).min(m);
            if haystack[q..q + overlap] == x[..overlap] {
                return q;
            }
        }
        p = q + 1;
    }
    n
}

/// Full Boyer-Moore search over the part of `haystack` past `minimum_pos`
/// where a complete match fits, falling back to a trailing-overlap search.
pub fn search_turbo_with_append(
    haystack: &[u8],
    tables: &SearchTables<'_>,
    minimum_pos: usize,
    minimum_overlap: usize,
    overlap_granularity: usize,
) -> usize {
    let n = haystack.len();
    let m = tables.needle.len();
    if minimum_pos >= n {
        return n;
    }
    let region = &haystack[minimum_pos..];
    let found = search(region, tables);
    if found < region.len() {
        return minimum_pos + found;
    }
    // a full match starting at or after n - m + 1 cannot fit
    let partial_start = minimum_pos.max((n + 1).saturating_sub(m));
    search_with_append_only(
        haystack,
        tables,
        partial_start,
        minimum_overlap,
        overlap_granularity,
    )
}

/// Decide where `needle` goes in `haystack`.
///
/// Positions before `minimum_pos` are never overlapped into. An empty needle
/// trivially sits at the end.
pub fn analyze_append(
    needle: &[u8],
    minimum_pos: usize,
    minimum_overlap: usize,
    overlap_granularity: usize,
    haystack: &[u8],
) -> AppendInfo {
    let n = haystack.len();
    let m = needle.len();
    let base = match SearchTables::preprocess(needle) {
        Ok(tables) if minimum_pos < n => {
            if n - minimum_pos < m {
                search_with_append_only(
                    haystack,
                    &tables,
                    minimum_pos,
                    minimum_overlap,
                    overlap_granularity,
                )
            } else {
                search_turbo_with_append(
                    haystack,
                    &tables,
                    minimum_pos,
                    minimum_overlap,
                    overlap_granularity,
                )
            }
        }
        _ => n,
    };
    AppendInfo::new(n as u64, base as u64, m as u64)
}
