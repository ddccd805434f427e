use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::bundle::Bundle;
use super::classify::*;
use super::inssort;
use super::parallel::*;
use super::strset::{StringAccess, StringSet};
use super::types::*;

/// Number of MKQS frames freed per idle observation.
const MKQS_FREE_WORK_MAX: usize = 8;

/// Sequential sort job for one range at or below the parallel threshold.
///
/// Runs a recursive in-cache sample sort on an explicit stack, falls through
/// to multikey quicksort over cached 64-bit keys, and to insertion sort for
/// tiny ranges. While other workers are idle it converts the bottom of its
/// stacks into independent jobs (work sharing); published frames keep their
/// LCP duties, which the completion hook settles once all children finished.
///
/// `B` sizes the bucket counters of the sequential sample sort frames.
pub struct SmallsortJob<'q, S: StringAccess, B: BktSize> {
    pstep: ParentRef<'q, S>,
    bundle: Bundle<'q, S>,
    depth: usize,
    /// outstanding published children plus one anonymous guard while `run`
    /// is active
    substep_working: AtomicUsize,
    /// job-local sorting state: touched by `run` and, strictly afterwards,
    /// by the completion hook
    state: Mutex<SmallState<'q, S, B>>,
}

struct SmallState<'q, S: StringAccess, B: BktSize> {
    /// bucket ids of the current sequential sample sort level
    bktcache: Vec<u16>,
    /// cached string keys for MKQS
    keycache: Vec<Key>,
    ss_stack: Vec<SeqFrame<'q, S, B>>,
    ss_pop_front: usize,
    ms_stack: Vec<MkqsFrame<'q, S>>,
    ms_pop_front: usize,
}

enum Action<'q, S> {
    Skip,
    /// sort sub-range with MKQS at depth
    Mkqs(Bundle<'q, S>, usize),
    /// push a new sequential sample sort frame
    PushSeq(Bundle<'q, S>, usize),
    /// push a new MKQS frame (cache offset, depth, cache dirty)
    PushMkqs(Bundle<'q, S>, usize, usize, bool),
    /// cached insertion sort (cache offset, depth, cache dirty)
    Ins(Bundle<'q, S>, usize, usize, bool),
    /// equal run of NUL-terminated strings: copy back and fill LCPs
    Fill(Bundle<'q, S>, usize),
    /// bucket range exhausted: finalize LCPs and pop the frame
    Pop,
}

impl<'q, S: StringAccess + 'q, B: BktSize + 'q> SmallsortJob<'q, S, B> {
    pub fn enqueue(
        ctx: &Context<'q, S>,
        pstep: ParentRef<'q, S>,
        bundle: Bundle<'q, S>,
        depth: usize,
    ) {
        let job = Arc::new(SmallsortJob {
            pstep,
            bundle,
            depth,
            substep_working: AtomicUsize::new(0),
            state: Mutex::new(SmallState::<S, B> {
                bktcache: Vec::new(),
                keycache: Vec::new(),
                ss_stack: Vec::new(),
                ss_pop_front: 0,
                ms_stack: Vec::new(),
                ms_pop_front: 0,
            }),
        });
        ctx.queue.enqueue(Box::new(move |ctx| job.run(ctx)));
    }

    fn run(self: Arc<Self>, ctx: &Context<'q, S>) {
        // guard substep, released after the lock is gone
        self.substep_working.fetch_add(1, Ordering::Relaxed);
        {
            let mut st = self.state.lock().unwrap();
            let n = self.bundle.size();
            if n >= SMALLSORT_THRESHOLD {
                st.bktcache = vec![0u16; n];
                Self::sort_sample_sort(&self, ctx, &mut *st, self.bundle, self.depth);
            } else {
                Self::sort_mkqs_cache(&self, ctx, &mut *st, self.bundle, self.depth);
            }
            st.bktcache = Vec::new();
            st.keycache = Vec::new();
        }
        self.substep_notify_done(ctx);
    }

    // *** sequential sample sort over an explicit stack

    fn sort_sample_sort(
        this: &Arc<Self>,
        ctx: &Context<'q, S>,
        st: &mut SmallState<'q, S, B>,
        bundle: Bundle<'q, S>,
        depth: usize,
    ) {
        debug_assert!(st.ss_pop_front == 0 && st.ss_stack.is_empty());
        let frame = SeqFrame::new(bundle, depth, &mut st.bktcache);
        st.ss_stack.push(frame);

        while st.ss_stack.len() > st.ss_pop_front {
            let action = {
                let s = st.ss_stack.last_mut().unwrap();
                let i = s.idx;
                s.idx += 1;
                if i < BKTNUM {
                    s.bucket_action(i)
                } else {
                    Action::Pop
                }
            };
            match action {
                Action::Skip => {}
                Action::Mkqs(sub, d) => Self::sort_mkqs_cache(this, ctx, st, sub, d),
                Action::PushSeq(sub, d) => {
                    let f = SeqFrame::new(sub, d, &mut st.bktcache);
                    st.ss_stack.push(f);
                }
                Action::Fill(sub, v) => {
                    sub.copy_back().fill_lcp(v);
                }
                Action::Pop => {
                    let f = st.ss_stack.pop().unwrap();
                    f.calculate_lcp();
                }
                _ => unreachable!(),
            }
            if ctx.queue.has_idle() {
                Self::free_work(this, ctx, st);
            }
        }
    }

    // *** multikey quicksort over cached keys

    fn sort_mkqs_cache(
        this: &Arc<Self>,
        ctx: &Context<'q, S>,
        st: &mut SmallState<'q, S, B>,
        bundle: Bundle<'q, S>,
        depth: usize,
    ) {
        if bundle.size() < INSSORT_THRESHOLD {
            inssort::insertion_sort(bundle.copy_back(), depth);
            return;
        }
        if st.keycache.len() < bundle.size() {
            st.keycache.resize(bundle.size(), 0);
        }

        debug_assert!(st.ms_pop_front == 0 && st.ms_stack.is_empty());
        let frame = MkqsFrame::new(bundle, 0, depth, true, &mut st.keycache);
        st.ms_stack.push(frame);

        while st.ms_stack.len() > st.ms_pop_front {
            let action = {
                let ms = st.ms_stack.last_mut().unwrap();
                ms.idx += 1;
                match ms.idx {
                    1 => ms.lt_action(),
                    2 => ms.eq_action(),
                    3 => ms.gt_action(),
                    _ => Action::Pop,
                }
            };
            match action {
                Action::Skip => {}
                Action::Ins(sub, off, d, dirty) => {
                    let len = sub.size();
                    inssort::insertion_sort_cache(sub, &mut st.keycache[off..off + len], d, dirty);
                }
                Action::PushMkqs(sub, off, d, dirty) => {
                    let f = MkqsFrame::new(sub, off, d, dirty, &mut st.keycache);
                    st.ms_stack.push(f);
                }
                Action::Fill(sub, v) => {
                    sub.copy_back().fill_lcp(v);
                }
                Action::Pop => {
                    let f = st.ms_stack.pop().unwrap();
                    f.calculate_lcp();
                }
                _ => unreachable!(),
            }
            if ctx.queue.has_idle() {
                Self::free_work(this, ctx, st);
            }
        }
    }

    // *** work sharing

    /// Convert the bottom of the recursion stacks into independent jobs.
    /// Published frames are not popped; they stop being iterated and their
    /// LCP duties move to the completion hook.
    fn free_work(this: &Arc<Self>, ctx: &Context<'q, S>, st: &mut SmallState<'q, S, B>) {
        debug_assert!(st.ss_stack.len() >= st.ss_pop_front);

        if st.ss_stack.len() == st.ss_pop_front {
            return Self::mkqs_free_work(this, ctx, st);
        }

        // publish every unvisited bucket of the bottom frame
        let f = st.ss_pop_front;
        loop {
            let action = {
                let s = &mut st.ss_stack[f];
                if s.idx >= BKTNUM {
                    break;
                }
                let i = s.idx;
                s.idx += 1;
                s.bucket_action(i)
            };
            match action {
                Action::Skip => {}
                Action::Fill(sub, v) => {
                    sub.copy_back().fill_lcp(v);
                }
                Action::Mkqs(sub, d) | Action::PushSeq(sub, d) => {
                    Self::publish(this, ctx, sub, d);
                }
                _ => unreachable!(),
            }
        }
        st.ss_pop_front += 1;
    }

    fn mkqs_free_work(this: &Arc<Self>, ctx: &Context<'q, S>, st: &mut SmallState<'q, S, B>) {
        debug_assert!(st.ms_stack.len() >= st.ms_pop_front);

        for _ in 0..MKQS_FREE_WORK_MAX {
            if st.ms_stack.len() == st.ms_pop_front {
                return;
            }

            // publish the still-untouched subranges of the bottom frame
            let ms = &st.ms_stack[st.ms_pop_front];
            let (bundle, depth, idx) = (ms.bundle, ms.depth, ms.idx);
            let (num_lt, num_eq, num_gt) = (ms.num_lt, ms.num_eq, ms.num_gt);
            let (eq_recurse, lcp_eq) = (ms.eq_recurse, ms.lcp_eq);

            if idx == 0 && num_lt != 0 {
                Self::publish(this, ctx, bundle.sub(0, num_lt), depth);
            }
            if idx <= 1 {
                debug_assert!(num_eq > 0);
                let sub = bundle.sub(num_lt, num_eq);
                if eq_recurse {
                    Self::publish(this, ctx, sub, depth + KEY_SIZE);
                } else {
                    sub.copy_back().fill_lcp(depth + lcp_eq);
                }
            }
            if idx <= 2 && num_gt != 0 {
                Self::publish(this, ctx, bundle.sub(num_lt + num_eq, num_gt), depth);
            }

            st.ms_pop_front += 1;
        }
    }

    fn publish(this: &Arc<Self>, ctx: &Context<'q, S>, sub: Bundle<'q, S>, depth: usize) {
        this.substep_working.fetch_add(1, Ordering::Relaxed);
        let parent: Arc<dyn SortStep<'q, S> + 'q> = this.clone();
        enqueue_sort(ctx, Some(parent), sub, depth);
    }

    // *** completion

    fn substep_all_done(&self, ctx: &Context<'q, S>) {
        {
            let mut st = self.state.lock().unwrap();
            // settle the LCP duties of published frames, deepest first
            while st.ms_pop_front > 0 {
                st.ms_pop_front -= 1;
                st.ms_stack[st.ms_pop_front].calculate_lcp();
            }
            st.ms_stack.clear();
            while st.ss_pop_front > 0 {
                st.ss_pop_front -= 1;
                st.ss_stack[st.ss_pop_front].calculate_lcp();
            }
            st.ss_stack.clear();
        }
        if let Some(pstep) = &self.pstep {
            pstep.substep_notify_done(ctx);
        }
    }
}

impl<'q, S: StringAccess + 'q, B: BktSize + 'q> SortStep<'q, S> for SmallsortJob<'q, S, B> {
    fn substep_notify_done(&self, ctx: &Context<'q, S>) {
        debug_assert!(self.substep_working.load(Ordering::Relaxed) > 0);
        if self.substep_working.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.substep_all_done(ctx);
        }
    }
}

/// One level of the sequential in-cache sample sort.
///
/// The constructor runs the whole level: sample, build the classifier,
/// classify into the shared bucket-id cache, histogram, inclusive prefix
/// sum, and the out-of-place permutation into the shadow side. Afterwards
/// `bkt` holds the bucket boundaries and the outer loop walks the buckets
/// via `idx`.
struct SeqFrame<'q, S: StringAccess, B: BktSize> {
    bundle: Bundle<'q, S>,
    depth: usize,
    idx: usize,
    classifier: Box<Classifier>,
    bkt: Vec<B>,
}

impl<'q, S: StringAccess, B: BktSize> SeqFrame<'q, S, B> {
    fn new(bundle: Bundle<'q, S>, depth: usize, bktcache: &mut Vec<u16>) -> Self {
        let n = bundle.size();
        let strset = bundle.active();
        debug_assert!(n >= SAMPLE_SIZE && bktcache.len() >= n);

        let mut samples = vec![0 as Key; SAMPLE_SIZE];
        let mut rng = LcgRandom::new((n as u64) ^ ((depth as u64) << 40));
        for s in samples.iter_mut() {
            // this job owns the range.
            *s = unsafe { strset.key_at((rng.next() as usize) % n, depth) };
        }
        let mut classifier = Box::new(Classifier::new());
        classifier.build(&mut samples);

        classifier.classify(&strset, 0, n, &mut bktcache[..n], depth);

        let mut bkt: Vec<B> = vec![B::ZERO; BKTNUM + 1];
        for &b in bktcache[..n].iter() {
            bkt[b as usize] += B::ONE;
        }
        let mut sum = B::ZERO;
        for slot in bkt[..BKTNUM].iter_mut() {
            sum += *slot;
            *slot = sum;
        }
        debug_assert_eq!(sum.as_index(), n);
        bkt[BKTNUM] = B::from_index(n);

        // permute out-of-place; bkt decays to the exclusive prefix sum
        let shadow = bundle.shadow();
        for j in 0..n {
            let b = bktcache[j] as usize;
            bkt[b] -= B::ONE;
            // every string has a unique target slot.
            unsafe { shadow.set(bkt[b].as_index(), strset.get(j)) };
        }

        SeqFrame {
            bundle,
            depth,
            idx: 0,
            classifier,
            bkt,
        }
    }

    /// What to do with bucket `i` of this level.
    fn bucket_action(&self, i: usize) -> Action<'q, S> {
        let left = self.bkt[i].as_index();
        let bktsize = self.bkt[i + 1].as_index() - left;
        if bktsize == 0 {
            return Action::Skip;
        }
        let sub = self.bundle.flip(left, bktsize);
        if i % 2 == 0 {
            // less-than bucket (the final greater bucket has a zero
            // sentinel LCP byte)
            let d = self.depth + (self.classifier.splitter_lcp(i / 2) & 0x7F) as usize;
            if bktsize < SMALLSORT_THRESHOLD {
                Action::Mkqs(sub, d)
            } else {
                Action::PushSeq(sub, d)
            }
        } else if self.classifier.splitter_lcp(i / 2) & 0x80 != 0 {
            // equal bucket with NUL-terminated splitter: done
            Action::Fill(sub, self.depth + key_depth(self.classifier.splitter(i / 2)))
        } else if bktsize < SMALLSORT_THRESHOLD {
            Action::Mkqs(sub, self.depth + KEY_SIZE)
        } else {
            Action::PushSeq(sub, self.depth + KEY_SIZE)
        }
    }

    fn calculate_lcp(&self) {
        if self.bundle.has_lcp() {
            sample_sort_lcp(
                &self.classifier,
                self.bundle.original(),
                self.depth,
                &self.bkt[..],
            );
        }
    }
}

/// One multikey quicksort step over cached keys.
///
/// The constructor refreshes the key cache if needed, picks a median-of-9
/// pivot, runs a ternary partition that migrates equal keys to the ends and
/// swings them to the middle, and records the boundary LCPs against the
/// maximum less-than and minimum greater-than keys seen while partitioning.
struct MkqsFrame<'q, S: StringAccess> {
    bundle: Bundle<'q, S>,
    cache_off: usize,
    num_lt: usize,
    num_eq: usize,
    num_gt: usize,
    depth: usize,
    idx: usize,
    /// false when the pivot is NUL-terminated: the equal run is sorted
    eq_recurse: bool,
    lcp_lt: usize,
    lcp_eq: usize,
    lcp_gt: usize,
    dchar_eq: u8,
    dchar_gt: u8,
}

fn med3(c: &[Key], i: usize, j: usize, k: usize) -> usize {
    if c[i] == c[j] {
        return i;
    }
    if c[k] == c[i] || c[k] == c[j] {
        return k;
    }
    if c[i] < c[j] {
        if c[j] < c[k] {
            j
        } else if c[i] < c[k] {
            k
        } else {
            i
        }
    } else if c[j] > c[k] {
        j
    } else if c[i] < c[k] {
        i
    } else {
        k
    }
}

fn swap_range<S: StringAccess>(
    strset: &StringSet<'_, S>,
    cache: &mut [Key],
    a: usize,
    b: usize,
    len: usize,
) {
    for i in 0..len {
        // disjoint positions within the owned range.
        unsafe { strset.swap(a + i, b + i) };
        cache.swap(a + i, b + i);
    }
}

impl<'q, S: StringAccess> MkqsFrame<'q, S> {
    fn new(
        bundle: Bundle<'q, S>,
        cache_off: usize,
        depth: usize,
        cache_dirty: bool,
        keycache: &mut [Key],
    ) -> Self {
        let n = bundle.size();
        debug_assert!(n >= INSSORT_THRESHOLD);
        let strset = bundle.active();
        let cache = &mut keycache[cache_off..cache_off + n];

        if cache_dirty {
            for (i, c) in cache.iter_mut().enumerate() {
                *c = unsafe { strset.key_at(i, depth) };
            }
        }

        // median of 9
        let p = med3(
            cache,
            med3(cache, 0, n / 8, n / 4),
            med3(cache, n / 2 - n / 8, n / 2, n / 2 + n / 8),
            med3(cache, n - 1 - n / 4, n - 1 - n / 8, n - 3),
        );
        unsafe { strset.swap(0, p) };
        cache.swap(0, p);
        let pivot = cache[0];

        let mut max_lt: Key = 0;
        let mut min_gt: Key = Key::MAX;

        // 0 [pivot] 1 [===] leq [<<<] llt [???] rgt [>>>] req [===] n-1
        let mut leq = 1;
        let mut llt = 1;
        let mut rgt = n - 1;
        let mut req = n - 1;
        loop {
            while llt <= rgt {
                let c = cache[llt];
                if c > pivot {
                    min_gt = min_gt.min(c);
                    break;
                } else if c == pivot {
                    unsafe { strset.swap(leq, llt) };
                    cache.swap(leq, llt);
                    leq += 1;
                } else {
                    max_lt = max_lt.max(c);
                }
                llt += 1;
            }
            while llt <= rgt {
                let c = cache[rgt];
                if c < pivot {
                    max_lt = max_lt.max(c);
                    break;
                } else if c == pivot {
                    unsafe { strset.swap(req, rgt) };
                    cache.swap(req, rgt);
                    req -= 1;
                } else {
                    min_gt = min_gt.min(c);
                }
                rgt -= 1;
            }
            if llt > rgt {
                break;
            }
            unsafe { strset.swap(llt, rgt) };
            cache.swap(llt, rgt);
            llt += 1;
            rgt -= 1;
        }

        let num_leq = leq;
        let num_req = n - 1 - req;
        let num_eq = num_leq + num_req;
        let num_lt = llt - leq;
        let num_gt = req - rgt;
        debug_assert!(num_eq > 0);
        debug_assert_eq!(num_lt + num_eq + num_gt, n);

        // swing the equal keys from both ends into the middle
        let size1 = num_leq.min(num_lt);
        swap_range(&strset, cache, 0, llt - size1, size1);
        let size2 = num_req.min(num_gt);
        swap_range(&strset, cache, llt, n - size2, size2);

        let eq_recurse = pivot & 0xFF != 0;

        let (mut lcp_lt, mut dchar_eq) = (0, 0);
        if num_lt > 0 {
            lcp_lt = key_lcp(max_lt, pivot);
            dchar_eq = key_char(pivot, lcp_lt);
        }
        let lcp_eq = key_depth(pivot);
        let (mut lcp_gt, mut dchar_gt) = (0, 0);
        if num_gt > 0 {
            lcp_gt = key_lcp(pivot, min_gt);
            dchar_gt = key_char(min_gt, lcp_gt);
        }

        MkqsFrame {
            bundle,
            cache_off,
            num_lt,
            num_eq,
            num_gt,
            depth,
            idx: 0,
            eq_recurse,
            lcp_lt,
            lcp_eq,
            lcp_gt,
            dchar_eq,
            dchar_gt,
        }
    }

    fn lt_action(&self) -> Action<'q, S> {
        if self.num_lt == 0 {
            return Action::Skip;
        }
        let sub = self.bundle.sub(0, self.num_lt);
        if self.num_lt < INSSORT_THRESHOLD {
            Action::Ins(sub, self.cache_off, self.depth, false)
        } else {
            Action::PushMkqs(sub, self.cache_off, self.depth, false)
        }
    }

    fn eq_action(&self) -> Action<'q, S> {
        debug_assert!(self.num_eq > 0);
        let sub = self.bundle.sub(self.num_lt, self.num_eq);
        if !self.eq_recurse {
            Action::Fill(sub, self.depth + self.lcp_eq)
        } else if self.num_eq < INSSORT_THRESHOLD {
            Action::Ins(sub, self.cache_off + self.num_lt, self.depth + KEY_SIZE, true)
        } else {
            Action::PushMkqs(sub, self.cache_off + self.num_lt, self.depth + KEY_SIZE, true)
        }
    }

    fn gt_action(&self) -> Action<'q, S> {
        if self.num_gt == 0 {
            return Action::Skip;
        }
        let sub = self.bundle.sub(self.num_lt + self.num_eq, self.num_gt);
        let off = self.cache_off + self.num_lt + self.num_eq;
        if self.num_gt < INSSORT_THRESHOLD {
            Action::Ins(sub, off, self.depth, false)
        } else {
            Action::PushMkqs(sub, off, self.depth, false)
        }
    }

    /// Write the two boundary LCPs once the three parts are sorted.
    fn calculate_lcp(&self) {
        if !self.bundle.has_lcp() {
            return;
        }
        let orig = self.bundle.original();
        if self.num_lt > 0 {
            unsafe {
                orig.set_lcp(self.num_lt, self.depth + self.lcp_lt);
                orig.set_cache(self.num_lt, self.dchar_eq);
            }
        }
        if self.num_gt > 0 {
            unsafe {
                orig.set_lcp(self.num_lt + self.num_eq, self.depth + self.lcp_gt);
                orig.set_cache(self.num_lt + self.num_eq, self.dchar_gt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn med3_picks_middle() {
        let c = [5u64, 1, 9];
        assert_eq!(med3(&c, 0, 1, 2), 0);
        let c = [1u64, 5, 9];
        assert_eq!(med3(&c, 0, 1, 2), 1);
        let c = [9u64, 5, 1];
        assert_eq!(med3(&c, 0, 1, 2), 1);
        let c = [7u64, 7, 3];
        assert_eq!(med3(&c, 0, 1, 2), 0);
    }

    #[test]
    fn mkqs_partition_invariants() {
        let owned: Vec<Vec<u8>> = (0..64u32)
            .map(|i| format!("k{:02}suffix", i * 7 % 64).into_bytes())
            .collect();
        let mut strings: Vec<&[u8]> = owned.iter().map(|v| v.as_slice()).collect();
        let mut scratch: Vec<&[u8]> = vec![b""; 64];
        let mut keycache = vec![0 as Key; 64];

        let frame = {
            let bundle = Bundle::new(
                AtomicSlice::new(&mut strings[..]),
                AtomicSlice::new(&mut scratch[..]),
                None,
                None,
            );
            MkqsFrame::new(bundle, 0, 0, true, &mut keycache)
        };

        assert_eq!(frame.num_lt + frame.num_eq + frame.num_gt, 64);
        assert!(frame.num_eq > 0);
        let pivot = keycache[frame.num_lt];
        for i in 0..frame.num_lt {
            assert!(keycache[i] < pivot);
        }
        for i in frame.num_lt..frame.num_lt + frame.num_eq {
            assert_eq!(keycache[i], pivot);
        }
        for i in frame.num_lt + frame.num_eq..64 {
            assert!(keycache[i] > pivot);
        }
        // eq area keys contain no NUL within eight bytes, so recursion is on
        assert!(frame.eq_recurse);
    }
}
