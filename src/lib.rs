//! Parallel super scalar string sample sort.
//!
//! Sorts a set of byte strings lexicographically, treating a NUL byte (or
//! the end of the slice) as the string terminator, and can emit the array of
//! longest-common-prefix lengths between adjacent sorted strings plus their
//! first distinguishing characters at near-zero extra cost.
//!
//! The core is a three-phase parallel sample sort (splitter selection,
//! parallel classification, parallel distribution) driven by a work-stealing
//! job queue, composed with a sequential in-cache sample sort and a
//! caching multikey quicksort for smaller ranges. Idle workers receive work
//! from running jobs through cooperative work sharing.

#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;

mod bundle;
mod classify;
mod inspect;
mod inssort;
mod jobqueue;
mod parallel;
mod smallsort;
mod strset;
mod types;

pub use crate::inspect::inspect;
pub use crate::strset::StringAccess;

use crate::bundle::Bundle;
use crate::parallel::{enqueue_sort, Context};
use crate::types::*;

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn run_sort<'q, S: StringAccess + 'q>(
    bundle: Bundle<'q, S>,
    threads: usize,
    locality: Option<usize>,
    pin: &(dyn Fn(usize) + Sync),
) {
    let ctx = Context::new(bundle.size(), threads);
    enqueue_sort(&ctx, None, bundle, 0);
    ctx.queue.drain(
        threads,
        |job| job(&ctx),
        || {
            if let Some(group) = locality {
                pin(group)
            }
        },
    );
}

/// Sort the strings in place.
pub fn sort<S: StringAccess>(strings: &mut [S]) {
    let n = strings.len();
    if n < 2 {
        return;
    }
    let mut shadow: Vec<S> = vec![S::default(); n];
    let bundle = Bundle::new(
        AtomicSlice::new(strings),
        AtomicSlice::new(&mut shadow[..]),
        None,
        None,
    );
    run_sort(bundle, default_threads(), None, &|_| {});
}

/// Sort the strings in place and fill `lcps[1..]` with the byte length of
/// the common prefix of each adjacent output pair. `lcps[0]` is untouched.
pub fn sort_lcp<S: StringAccess>(strings: &mut [S], lcps: &mut [usize]) {
    let n = strings.len();
    assert_eq!(lcps.len(), n);
    if n < 2 {
        return;
    }
    let mut shadow: Vec<S> = vec![S::default(); n];
    let bundle = Bundle::new(
        AtomicSlice::new(strings),
        AtomicSlice::new(&mut shadow[..]),
        Some(AtomicSlice::new(lcps)),
        None,
    );
    run_sort(bundle, default_threads(), None, &|_| {});
}

/// Sort into `out`, which doubles as the shadow array; `strings` holds
/// scratch data afterwards.
pub fn sort_out<S: StringAccess>(strings: &mut [S], out: &mut [S]) {
    let n = strings.len();
    assert_eq!(out.len(), n);
    if n < 2 {
        if n == 1 {
            out[0] = strings[0];
        }
        return;
    }
    let bundle = Bundle::new_flipped(
        AtomicSlice::new(out),
        AtomicSlice::new(strings),
        None,
        None,
    );
    run_sort(bundle, default_threads(), None, &|_| {});
}

/// Sort into `out` and populate the LCP and distinguishing-character
/// arrays. Entries 0 of both arrays are untouched.
pub fn sort_lcp_cache_out<S: StringAccess>(
    strings: &mut [S],
    out: &mut [S],
    lcps: &mut [usize],
    cache: &mut [u8],
) {
    let n = strings.len();
    assert_eq!(out.len(), n);
    assert_eq!(lcps.len(), n);
    assert_eq!(cache.len(), n);
    if n < 2 {
        if n == 1 {
            out[0] = strings[0];
        }
        return;
    }
    let bundle = Bundle::new_flipped(
        AtomicSlice::new(out),
        AtomicSlice::new(strings),
        Some(AtomicSlice::new(lcps)),
        Some(AtomicSlice::new(cache)),
    );
    run_sort(bundle, default_threads(), None, &|_| {});
}

/// Locality-pinned sort for NUMA-aware pipelines.
///
/// Sorts into `out` with `threads` workers, each calling `pin(locality)`
/// before it starts draining jobs; the pin hook is supplied by the embedder,
/// the sorter itself has no pinning policy. Unlike the plain entries this
/// also writes the first LCP slot (zero) and the first cached character.
pub fn sort_numa<S, P>(
    strings: &mut [S],
    out: &mut [S],
    lcps: &mut [usize],
    cache: &mut [u8],
    locality: usize,
    threads: usize,
    pin: P,
) where
    S: StringAccess,
    P: Fn(usize) + Sync,
{
    let n = strings.len();
    assert_eq!(out.len(), n);
    assert_eq!(lcps.len(), n);
    assert_eq!(cache.len(), n);
    let threads = threads.max(1);
    if n == 0 {
        return;
    }
    if n == 1 {
        out[0] = strings[0];
    } else {
        let bundle = Bundle::new_flipped(
            AtomicSlice::new(out),
            AtomicSlice::new(strings),
            Some(AtomicSlice::new(lcps)),
            Some(AtomicSlice::new(cache)),
        );
        run_sort(bundle, threads, Some(locality), &pin);
    }
    lcps[0] = 0;
    cache[0] = key_char(out[0].get_u64(0), 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::LcgRandom;
    use crate::parallel::SMALLSORT_THRESHOLD;

    /// Logical content of a string: everything before the first NUL.
    fn logical(s: &[u8]) -> &[u8] {
        match s.iter().position(|&b| b == 0) {
            Some(p) => &s[..p],
            None => s,
        }
    }

    fn naive_lcp(a: &[u8], b: &[u8]) -> usize {
        logical(a)
            .iter()
            .zip(logical(b).iter())
            .take_while(|(x, y)| x == y)
            .count()
    }

    /// Order, permutation, LCP and cache checks against the naive model.
    fn verify(
        input: &[&[u8]],
        output: &[&[u8]],
        lcps: Option<&[usize]>,
        cache: Option<&[u8]>,
    ) -> bool {
        let mut a: Vec<&[u8]> = input.to_vec();
        let mut b: Vec<&[u8]> = output.to_vec();
        a.sort();
        b.sort();
        if a != b {
            return false;
        }
        for i in 1..output.len() {
            if logical(output[i - 1]) > logical(output[i]) {
                return false;
            }
            if let Some(lcps) = lcps {
                if lcps[i] != naive_lcp(output[i - 1], output[i]) {
                    return false;
                }
            }
            if let Some(cache) = cache {
                let lcps = lcps.unwrap();
                let expect = logical(output[i]).get(lcps[i]).copied().unwrap_or(0);
                if cache[i] != expect {
                    return false;
                }
            }
        }
        true
    }

    fn sort_and_verify(input: Vec<&[u8]>) {
        let n = input.len();
        let mut strings = input.clone();
        let mut lcps = vec![0xAAAAusize; n];
        if n > 0 {
            lcps[0] = 42;
        }
        sort_lcp(&mut strings[..], &mut lcps[..]);
        assert!(verify(&input, &strings, Some(&lcps), None));
        if n > 0 {
            assert_eq!(lcps[0], 42);
        }
    }

    #[test]
    fn sorted_run_of_prefixes() {
        let input: Vec<&[u8]> = vec![b"a", b"aa", b"aaa"];
        let mut strings = input.clone();
        let mut lcps = vec![42usize, 0, 0];
        sort_lcp(&mut strings[..], &mut lcps[..]);
        assert_eq!(strings, input);
        assert_eq!(lcps, vec![42, 1, 2]);
    }

    #[test]
    fn banana_band() {
        let mut strings: Vec<&[u8]> = vec![b"banana", b"bandana", b"band", b"ban"];
        let mut out: Vec<&[u8]> = vec![b""; 4];
        let mut lcps = vec![0usize; 4];
        let mut cache = vec![0u8; 4];
        sort_lcp_cache_out(&mut strings[..], &mut out[..], &mut lcps[..], &mut cache[..]);
        assert_eq!(out, vec![b"ban" as &[u8], b"band", b"bandana", b"banana"]);
        assert_eq!(&lcps[1..], &[3, 4, 3]);
        assert_eq!(&cache[1..], &[b'd', b'a', b'a']);
    }

    #[test]
    fn all_equal_singletons() {
        let input: Vec<&[u8]> = vec![b"x"; 100];
        let mut strings = input.clone();
        let mut lcps = vec![0usize; 100];
        sort_lcp(&mut strings[..], &mut lcps[..]);
        assert_eq!(strings, input);
        assert!(lcps[1..].iter().all(|&l| l == 1));

        // with the cache array: all distinguishing characters are NUL
        let mut strings = input.clone();
        let mut out: Vec<&[u8]> = vec![b""; 100];
        let mut lcps = vec![0usize; 100];
        let mut cache = vec![0xffu8; 100];
        sort_lcp_cache_out(&mut strings[..], &mut out[..], &mut lcps[..], &mut cache[..]);
        assert!(cache[1..].iter().all(|&c| c == 0));
    }

    #[test]
    fn embedded_nul_is_terminator() {
        // bytes after a NUL must not influence the order
        let input: Vec<&[u8]> = vec![b"ab\0zzz", b"ab\0aaa", b"ac", b"aa", b"a\0x", b"a!"];
        sort_and_verify(input.clone());

        let mut strings = input.clone();
        sort(&mut strings[..]);
        assert_eq!(logical(strings[0]), b"a");
        assert_eq!(strings[1], b"a!" as &[u8]);
        assert_eq!(strings[2], b"aa" as &[u8]);
        assert_eq!(logical(strings[3]), b"ab");
        assert_eq!(logical(strings[4]), b"ab");
        assert_eq!(strings[5], b"ac" as &[u8]);
    }

    #[test]
    fn boundary_sizes() {
        for n in &[0usize, 1, 2, 31, 32, 33, 100] {
            let owned: Vec<Vec<u8>> = (0..*n).map(|i| format!("s{:04}", i * 37 % 100).into_bytes()).collect();
            let input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
            sort_and_verify(input);
        }
    }

    #[test]
    fn idempotent_on_sorted_input() {
        let owned: Vec<Vec<u8>> = (0..1000).map(|i| format!("{:05}", i).into_bytes()).collect();
        let input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
        let mut once = input.clone();
        let mut lcps1 = vec![0usize; 1000];
        sort_lcp(&mut once[..], &mut lcps1[..]);
        assert_eq!(once, input);
        let mut twice = once.clone();
        let mut lcps2 = vec![0usize; 1000];
        sort_lcp(&mut twice[..], &mut lcps2[..]);
        assert_eq!(twice, once);
        assert_eq!(&lcps1[1..], &lcps2[1..]);
    }

    #[test]
    fn shared_prefix_groups() {
        // a few distinct 8-byte prefixes with long equal runs drives the
        // quicksort's equal-bucket recursion
        let mut rng = LcgRandom::new(0xC0FFEE);
        let owned: Vec<Vec<u8>> = (0..10_000)
            .map(|_| {
                let prefix = rng.next() % 5;
                let mut v = format!("prefix{:02}", prefix).into_bytes();
                for _ in 0..12 {
                    v.push(b'a' + (rng.next() % 26) as u8);
                }
                v
            })
            .collect();
        let input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
        sort_and_verify(input);
    }

    #[test]
    fn decimal_index_order() {
        let n = 100_000;
        let owned: Vec<Vec<u8>> = (0..n).map(|i| format!("{:012}", i).into_bytes()).collect();
        let mut rng = LcgRandom::new(7);
        let mut input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
        for i in (1..n).rev() {
            input.swap(i, (rng.next() as usize) % (i + 1));
        }
        let mut strings = input.clone();
        sort(&mut strings[..]);
        for (i, s) in strings.iter().enumerate() {
            assert_eq!(s, &owned[i].as_slice());
        }
    }

    #[test]
    fn deterministic_across_thread_counts() {
        let n = 200_000;
        let owned: Vec<Vec<u8>> = (0..n).map(|i| format!("key{:07}", i).into_bytes()).collect();
        let mut rng = LcgRandom::new(99);
        let mut input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
        for i in (1..n).rev() {
            input.swap(i, (rng.next() as usize) % (i + 1));
        }

        let mut results: Vec<(Vec<&[u8]>, Vec<usize>, Vec<u8>)> = Vec::new();
        for &threads in &[1usize, 4] {
            let mut strings = input.clone();
            let mut out: Vec<&[u8]> = vec![b""; n];
            let mut lcps = vec![0usize; n];
            let mut cache = vec![0u8; n];
            sort_numa(
                &mut strings[..],
                &mut out[..],
                &mut lcps[..],
                &mut cache[..],
                0,
                threads,
                |_| {},
            );
            assert!(verify(&input, &out, Some(&lcps), Some(&cache)));
            assert_eq!(lcps[0], 0);
            results.push((out, lcps, cache));
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn smallsort_threshold_boundary() {
        for &n in &[SMALLSORT_THRESHOLD - 1, SMALLSORT_THRESHOLD] {
            let owned: Vec<Vec<u8>> = (0..n).map(|i| format!("{:08}", n - i).into_bytes()).collect();
            let input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
            let mut strings = input.clone();
            sort(&mut strings[..]);
            for i in 1..n {
                assert!(strings[i - 1] <= strings[i]);
            }
        }
    }

    #[test]
    fn large_parallel_run() {
        let n = 3 * SMALLSORT_THRESHOLD / 2;
        let owned: Vec<Vec<u8>> = (0..n).map(|i| format!("{:09}", i).into_bytes()).collect();
        let mut rng = LcgRandom::new(0xFEED);
        let mut input: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
        for i in (1..n).rev() {
            input.swap(i, (rng.next() as usize) % (i + 1));
        }
        let mut strings = input.clone();
        let mut out: Vec<&[u8]> = vec![b""; n];
        let mut lcps = vec![0usize; n];
        let mut cache = vec![0u8; n];
        sort_numa(
            &mut strings[..],
            &mut out[..],
            &mut lcps[..],
            &mut cache[..],
            0,
            4,
            |_| {},
        );
        for (i, s) in out.iter().enumerate() {
            assert_eq!(s, &owned[i].as_slice());
        }
        for i in 1..n {
            assert_eq!(lcps[i], naive_lcp(out[i - 1], out[i]));
            let expect = logical(out[i]).get(lcps[i]).copied().unwrap_or(0);
            assert_eq!(cache[i], expect);
        }
    }

    #[quickcheck]
    fn quickcheck_sort_lcp(xs: Vec<Vec<u8>>) -> bool {
        let input: Vec<&[u8]> = xs.iter().map(|v| v.as_slice()).collect();
        let n = input.len();
        let mut strings = input.clone();
        let mut lcps = vec![0usize; n];
        sort_lcp(&mut strings[..], &mut lcps[..]);
        verify(&input, &strings, Some(&lcps), None)
    }

    #[quickcheck]
    fn quickcheck_sort_out(xs: Vec<Vec<u8>>) -> bool {
        let input: Vec<&[u8]> = xs.iter().map(|v| v.as_slice()).collect();
        let n = input.len();
        let mut strings = input.clone();
        let mut out: Vec<&[u8]> = vec![b""; n];
        sort_out(&mut strings[..], &mut out[..]);
        verify(&input, &out, None, None)
    }

    #[quickcheck]
    fn quickcheck_sort_matches_inplace(xs: Vec<Vec<u8>>) -> bool {
        let input: Vec<&[u8]> = xs.iter().map(|v| v.as_slice()).collect();
        let n = input.len();
        let mut a = input.clone();
        sort(&mut a[..]);
        let mut b = input.clone();
        let mut out: Vec<&[u8]> = vec![b""; n];
        let mut lcps = vec![0usize; n];
        let mut cache = vec![0u8; n];
        sort_numa(&mut b[..], &mut out[..], &mut lcps[..], &mut cache[..], 0, 2, |_| {});
        // both orders are valid; logical contents must agree position-wise
        a.len() == out.len()
            && a.iter().zip(out.iter()).all(|(x, y)| logical(x) == logical(y))
    }
}
