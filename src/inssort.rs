use std::cmp::Ordering;

use super::bundle::Bundle;
use super::strset::StringAccess;
use super::types::*;

/// Compare two strings from `depth` on, eight bytes at a time.
#[inline]
fn cmp_from<S: StringAccess>(a: S, b: S, depth: usize) -> Ordering {
    let mut d = depth;
    loop {
        let ka = a.get_u64(d);
        let kb = b.get_u64(d);
        if ka != kb {
            return ka.cmp(&kb);
        }
        if ka & 0xFF == 0 {
            return Ordering::Equal;
        }
        d += KEY_SIZE;
    }
}

/// LCP in bytes of two strings known to share their first `depth` bytes.
#[inline]
fn lcp_from<S: StringAccess>(a: S, b: S, depth: usize) -> usize {
    let mut d = depth;
    loop {
        let ka = a.get_u64(d);
        let kb = b.get_u64(d);
        if ka != kb {
            return d + key_lcp(ka, kb);
        }
        if ka & 0xFF == 0 {
            return d + key_depth(ka);
        }
        d += KEY_SIZE;
    }
}

/// Insertion sort for tiny ranges, comparing strings from `depth`.
///
/// Emits the range's interior LCPs and cached characters afterwards; the
/// left boundary (index 0) belongs to the enclosing level. The range must
/// already reside in the output side.
pub(crate) fn insertion_sort<'q, S: StringAccess>(bundle: Bundle<'q, S>, depth: usize) {
    debug_assert!(!bundle.flipped());
    let n = bundle.size();
    if n < 2 {
        return;
    }
    let set = bundle.output();

    // the bundle grants exclusive use of this range.
    unsafe {
        for i in 1..n {
            let tmp = set.get(i);
            let mut j = i;
            while j > 0 {
                let prev = set.get(j - 1);
                if cmp_from(prev, tmp, depth) != Ordering::Greater {
                    break;
                }
                set.set(j, prev);
                j -= 1;
            }
            set.set(j, tmp);
        }

        if bundle.has_lcp() {
            for i in 1..n {
                let b = set.get(i);
                let h = lcp_from(set.get(i - 1), b, depth);
                bundle.set_lcp(i, h);
                bundle.set_cache(i, key_char(b.get_u64(h), 0));
            }
        }
    }
}

/// Insertion sort using the cached 64-bit keys of the range.
///
/// With a clean cache the strings are ordered by their cached keys alone;
/// a second pass walks the runs of equal keys, writes the boundary LCP from
/// the cached keys, and finishes runs that need more than the cached eight
/// bytes: NUL-terminated runs are filled, others recurse at `depth + 8`.
/// A dirty cache falls back to plain string insertion sort.
pub(crate) fn insertion_sort_cache<'q, S: StringAccess>(
    bundle: Bundle<'q, S>,
    cache: &mut [Key],
    depth: usize,
    cache_dirty: bool,
) {
    let bundle = bundle.copy_back();
    let n = bundle.size();
    debug_assert_eq!(cache.len(), n);
    if n < 2 {
        return;
    }
    if cache_dirty {
        return insertion_sort(bundle, depth);
    }

    let set = bundle.output();
    unsafe {
        for i in 1..n {
            let tmps = set.get(i);
            let tmpc = cache[i];
            let mut j = i;
            while j > 0 && cache[j - 1] > tmpc {
                set.set(j, set.get(j - 1));
                cache[j] = cache[j - 1];
                j -= 1;
            }
            set.set(j, tmps);
            cache[j] = tmpc;
        }
    }

    let mut start = 0;
    let mut bktsize = 1;
    for i in 0..n - 1 {
        // group areas with equal cache values
        if cache[i] == cache[i + 1] {
            bktsize += 1;
            continue;
        }
        finish_cache_group(&bundle, cache, start, bktsize, depth);
        bktsize = 1;
        start = i + 1;
    }
    finish_cache_group(&bundle, cache, start, bktsize, depth);
}

fn finish_cache_group<'q, S: StringAccess>(
    bundle: &Bundle<'q, S>,
    cache: &[Key],
    start: usize,
    bktsize: usize,
    depth: usize,
) {
    // boundary LCP between this group and the previous one
    if start != 0 {
        let rlcp = key_lcp(cache[start - 1], cache[start]);
        unsafe {
            bundle.set_lcp(start, depth + rlcp);
            bundle.set_cache(start, key_char(cache[start], rlcp));
        }
    }
    if bktsize > 1 {
        if cache[start] & 0xFF != 0 {
            // keys agree for eight bytes, sort deeper
            insertion_sort(bundle.sub(start, bktsize), depth + KEY_SIZE);
        } else {
            // NUL-terminated run, all strings equal
            bundle.sub(start, bktsize).fill_lcp(depth + key_depth(cache[start]));
        }
    }
}
