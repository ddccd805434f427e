use rayon::prelude::*;

use super::strset::{StringAccess, StringSet};
use super::types::*;

/// Ranges at least this large use rayon for bulk copies and fills.
const PAR_BULK_THRESHOLD: usize = 64 * 1024;

/// Bundle of the two string slot arrays plus the optional LCP and
/// cached-character arrays of a sort range.
///
/// `orig` is the caller-visible side, `scratch` the shadow side. `flipped`
/// records which one currently holds the strings: sub-sorts alternate sides
/// every distribution level, and `copy_back` restores the strings into
/// `orig` when a range is finished. All four views cover the same index
/// range; a bundle grants its holder exclusive use of that range.
pub struct Bundle<'q, S> {
    orig: AtomicSlice<'q, S>,
    scratch: AtomicSlice<'q, S>,
    lcp: Option<AtomicSlice<'q, usize>>,
    cache: Option<AtomicSlice<'q, u8>>,
    flipped: bool,
}

impl<'q, S> Clone for Bundle<'q, S> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}

impl<'q, S> Copy for Bundle<'q, S> {}

impl<'q, S: StringAccess> Bundle<'q, S> {
    /// Bundle over strings residing in `orig`, `scratch` used as shadow.
    pub fn new(
        orig: AtomicSlice<'q, S>,
        scratch: AtomicSlice<'q, S>,
        lcp: Option<AtomicSlice<'q, usize>>,
        cache: Option<AtomicSlice<'q, u8>>,
    ) -> Self {
        assert_eq!(orig.len(), scratch.len());
        if let Some(lcp) = &lcp {
            assert_eq!(lcp.len(), orig.len());
        }
        if let Some(cache) = &cache {
            assert_eq!(cache.len(), orig.len());
        }
        Bundle {
            orig,
            scratch,
            lcp,
            cache,
            flipped: false,
        }
    }

    /// Bundle over strings residing in the shadow side: used by the
    /// `sort_out` entries, where the caller's output buffer plays the role
    /// of `orig` and the input array is consumed as scratch.
    pub fn new_flipped(
        orig: AtomicSlice<'q, S>,
        scratch: AtomicSlice<'q, S>,
        lcp: Option<AtomicSlice<'q, usize>>,
        cache: Option<AtomicSlice<'q, u8>>,
    ) -> Self {
        let mut bundle = Self::new(orig, scratch, lcp, cache);
        bundle.flipped = true;
        bundle
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.orig.len()
    }

    #[inline(always)]
    pub fn flipped(&self) -> bool {
        self.flipped
    }

    #[inline(always)]
    pub fn has_lcp(&self) -> bool {
        self.lcp.is_some()
    }

    /// The side currently holding the strings.
    #[inline(always)]
    pub fn active(&self) -> StringSet<'q, S> {
        StringSet::new(if self.flipped { self.scratch } else { self.orig })
    }

    /// The other side, target of the next distribution pass.
    #[inline(always)]
    pub fn shadow(&self) -> StringSet<'q, S> {
        StringSet::new(if self.flipped { self.orig } else { self.scratch })
    }

    /// The caller-visible side, valid once the range has been copied back.
    #[inline(always)]
    pub fn output(&self) -> StringSet<'q, S> {
        StringSet::new(self.orig)
    }

    /// Sub-range with active/shadow roles swapped: the children of a
    /// distribution level read what this level wrote.
    #[inline(always)]
    pub fn flip(&self, off: usize, len: usize) -> Self {
        let mut sub = self.sub(off, len);
        sub.flipped = !self.flipped;
        sub
    }

    /// Sub-range keeping the current roles.
    #[inline(always)]
    pub fn sub(&self, off: usize, len: usize) -> Self {
        Bundle {
            orig: self.orig.slice(off, len),
            scratch: self.scratch.slice(off, len),
            lcp: self.lcp.map(|l| l.slice(off, len)),
            cache: self.cache.map(|c| c.slice(off, len)),
            flipped: self.flipped,
        }
    }

    /// Same range, viewed unflipped. Valid once every sub-range has been
    /// copied back, e.g. in the LCP pass after all substeps completed.
    #[inline(always)]
    pub fn original(&self) -> Self {
        let mut b = *self;
        b.flipped = false;
        b
    }

    /// Ensure the strings of this range reside in the caller-visible side.
    pub fn copy_back(self) -> Self {
        if self.flipped {
            // exclusive range, and orig/scratch are distinct allocations.
            unsafe {
                let src = self.scratch.as_mut_slice();
                let dst = self.orig.as_mut_slice();
                if src.len() >= PAR_BULK_THRESHOLD {
                    dst.par_chunks_mut(PAR_BULK_THRESHOLD)
                        .zip(src.par_chunks(PAR_BULK_THRESHOLD))
                        .for_each(|(d, s)| d.copy_from_slice(s));
                } else {
                    dst.copy_from_slice(src);
                }
            }
        }
        self.original()
    }

    /// Set the LCP of position `i` relative to this range. No-op when the
    /// sort runs without an LCP array.
    #[inline(always)]
    pub unsafe fn set_lcp(&self, i: usize, v: usize) {
        if let Some(lcp) = &self.lcp {
            lcp.set(i, v);
        }
    }

    /// Set the cached distinguishing character of position `i`.
    #[inline(always)]
    pub unsafe fn set_cache(&self, i: usize, c: u8) {
        if let Some(cache) = &self.cache {
            cache.set(i, c);
        }
    }

    /// Broadcast `v` to every LCP position of the range except index 0, and
    /// zero the cached characters: the range holds equal, NUL-terminated
    /// strings.
    pub fn fill_lcp(&self, v: usize) {
        if self.size() <= 1 {
            return;
        }
        if let Some(lcp) = &self.lcp {
            // exclusive range.
            unsafe {
                let lcps = &mut lcp.as_mut_slice()[1..];
                if lcps.len() >= PAR_BULK_THRESHOLD {
                    lcps.par_iter_mut().for_each(|p| *p = v);
                } else {
                    lcps.iter_mut().for_each(|p| *p = v);
                }
            }
        }
        if let Some(cache) = &self.cache {
            unsafe {
                let chars = &mut cache.as_mut_slice()[1..];
                if chars.len() >= PAR_BULK_THRESHOLD {
                    chars.par_iter_mut().for_each(|p| *p = 0);
                } else {
                    chars.iter_mut().for_each(|p| *p = 0);
                }
            }
        }
    }
}
