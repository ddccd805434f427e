use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cfg_if::cfg_if;

use super::bundle::Bundle;
use super::classify::*;
use super::jobqueue::JobQueue;
use super::smallsort::SmallsortJob;
use super::strset::StringAccess;
use super::types::*;

/// Ranges below this size are sorted by one sequential job.
pub const SMALLSORT_THRESHOLD: usize = 1024 * 1024;

/// Ranges below this size use insertion sort.
pub const INSSORT_THRESHOLD: usize = 32;

/// Upper bound on the partition count of one parallel sample sort step.
pub const MAXPROCS: usize = 2 * 64 + 1;

/// Benchmark mode: run only the top-level sample sort step, then stop.
const SINGLE_STEP: bool = cfg!(feature = "single-step");

/// Boxed job closure run by the queue workers.
pub type JobBox<'q, S> = Box<dyn FnOnce(&Context<'q, S>) + Send + 'q>;

/// Global state of one sort root.
pub struct Context<'q, S: StringAccess> {
    /// total size of the input
    pub totalsize: usize,
    /// number of worker threads
    pub threadnum: usize,
    /// job queue the workers drain
    pub queue: JobQueue<JobBox<'q, S>>,
}

impl<'q, S: StringAccess> Context<'q, S> {
    pub fn new(totalsize: usize, threadnum: usize) -> Self {
        Context {
            totalsize,
            threadnum,
            queue: JobQueue::new(),
        }
    }

    /// Ranges above this sort in parallel, the rest sequentially.
    #[inline]
    pub fn sequential_threshold(&self) -> usize {
        std::cmp::max(SMALLSORT_THRESHOLD, self.totalsize / self.threadnum)
    }
}

/// A node in the dynamic tree of outstanding sort work.
///
/// Children notify their parent when they finish; the decrement that reaches
/// zero runs the parent's completion hook. Steps are kept alive by the Arcs
/// the outstanding jobs hold.
pub trait SortStep<'q, S: StringAccess>: Send + Sync {
    fn substep_notify_done(&self, ctx: &Context<'q, S>);
}

pub type ParentRef<'q, S> = Option<Arc<dyn SortStep<'q, S> + 'q>>;

/// Route a sub-range to the right kind of job: a parallel sample sort step
/// for ranges above the sequential threshold, otherwise a sequential
/// small-sort job whose bucket counters are sized to the range.
pub fn enqueue_sort<'q, S: StringAccess + 'q>(
    ctx: &Context<'q, S>,
    pstep: ParentRef<'q, S>,
    bundle: Bundle<'q, S>,
    depth: usize,
) {
    if bundle.size() > ctx.sequential_threshold() || SINGLE_STEP {
        SampleSortStep::create(ctx, pstep, bundle, depth);
    } else {
        spawn_smallsort(ctx, pstep, bundle, depth);
    }
}

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        fn spawn_smallsort<'q, S: StringAccess + 'q>(
            ctx: &Context<'q, S>,
            pstep: ParentRef<'q, S>,
            bundle: Bundle<'q, S>,
            depth: usize,
        ) {
            if bundle.size() < (1 << 32) {
                SmallsortJob::<S, u32>::enqueue(ctx, pstep, bundle, depth);
            } else {
                SmallsortJob::<S, u64>::enqueue(ctx, pstep, bundle, depth);
            }
        }
    } else {
        fn spawn_smallsort<'q, S: StringAccess + 'q>(
            ctx: &Context<'q, S>,
            pstep: ParentRef<'q, S>,
            bundle: Bundle<'q, S>,
            depth: usize,
        ) {
            SmallsortJob::<S, u32>::enqueue(ctx, pstep, bundle, depth);
        }
    }
}

/// Ceiling division.
#[inline(always)]
pub fn ceil_divide(x: usize, y: usize) -> usize {
    if x != 0 {
        1 + (x - 1) / y
    } else {
        0
    }
}

/// Out-of-place parallel sample sort step.
///
/// Runs as a chain of jobs over one range: a SampleJob builds the
/// classifier, `parts` CountJobs classify and histogram disjoint parts,
/// `parts` DistributeJobs permute into the shadow side, and the finish hook
/// enqueues one child per non-trivial bucket. Phase hand-off goes through
/// the `pwork` counter: the worker that decrements it to zero runs the
/// phase-finished hook and owns all per-part scratch at that point.
pub struct SampleSortStep<'q, S: StringAccess> {
    pstep: ParentRef<'q, S>,
    bundle: Bundle<'q, S>,
    depth: usize,

    /// number of parts the range was split into
    parts: usize,
    /// size of each part except the last
    psize: usize,
    /// parts still working on the current phase
    pwork: AtomicUsize,
    /// outstanding children
    substep_working: AtomicUsize,

    /// built by the SampleJob, read-only afterwards
    classifier: Slot<Classifier>,
    /// per-part bucket id caches
    bktcache: Box<[Slot<Vec<u16>>]>,
    /// per-part bucket counters; part 0 keeps the bucket boundaries and has
    /// one extra slot for the sentinel
    bkt: Box<[Slot<Vec<u64>>]>,
}

impl<'q, S: StringAccess + 'q> SampleSortStep<'q, S> {
    pub fn create(
        ctx: &Context<'q, S>,
        pstep: ParentRef<'q, S>,
        bundle: Bundle<'q, S>,
        depth: usize,
    ) {
        let n = bundle.size();
        let mut parts = ceil_divide(n, ctx.sequential_threshold()) * 2;
        if parts == 0 {
            parts = 1;
        }
        if parts > MAXPROCS {
            parts = MAXPROCS;
        }
        let psize = ceil_divide(n, parts);

        let step = Arc::new(SampleSortStep {
            pstep,
            bundle,
            depth,
            parts,
            psize,
            pwork: AtomicUsize::new(0),
            substep_working: AtomicUsize::new(0),
            classifier: Slot::new(Classifier::new()),
            bktcache: (0..parts).map(|_| Slot::new(Vec::new())).collect(),
            bkt: (0..parts).map(|_| Slot::new(Vec::new())).collect(),
        });

        ctx.queue.enqueue(Box::new(move |ctx| step.sample(ctx)));
    }

    /// Part bounds of part `p`.
    #[inline]
    fn part_range(&self, p: usize) -> (usize, usize) {
        let begin = std::cmp::min(p * self.psize, self.bundle.size());
        let end = std::cmp::min((p + 1) * self.psize, self.bundle.size());
        (begin, end)
    }

    #[inline]
    fn substep_add(&self) {
        self.substep_working.fetch_add(1, Ordering::Relaxed);
    }

    // *** sample phase

    fn sample(self: Arc<Self>, ctx: &Context<'q, S>) {
        let n = self.bundle.size();
        let strset = self.bundle.active();

        let mut samples = vec![0 as Key; SAMPLE_SIZE];
        let mut rng = LcgRandom::new((n as u64) ^ ((self.depth as u64) << 40));
        for s in samples.iter_mut() {
            // sampling reads only; counting has not started yet.
            *s = unsafe { strset.key_at((rng.next() as usize) % n, self.depth) };
        }

        // sole writer of the classifier; count jobs are enqueued below and
        // the queue hand-off orders their reads after this.
        unsafe { self.classifier.get_mut() }.build(&mut samples);

        self.pwork.store(self.parts, Ordering::Release);
        for p in 0..self.parts {
            let step = self.clone();
            ctx.queue.enqueue(Box::new(move |ctx| step.count(p, ctx)));
        }
    }

    // *** counting phase

    fn count(self: Arc<Self>, p: usize, ctx: &Context<'q, S>) {
        let (begin, end) = self.part_range(p);
        let strset = self.bundle.active();

        let mut cache = vec![0u16; end - begin];
        let classifier = unsafe { self.classifier.get() };
        classifier.classify(&strset, begin, end, &mut cache[..], self.depth);

        let width = if p == 0 { BKTNUM + 1 } else { BKTNUM };
        let mut bkt = vec![0u64; width];
        for &b in cache.iter() {
            bkt[b as usize] += 1;
        }

        // this part's slots are owned by this job until the phase counter
        // says otherwise.
        unsafe {
            *self.bktcache[p].get_mut() = cache;
            *self.bkt[p].get_mut() = bkt;
        }

        if self.pwork.fetch_sub(1, Ordering::AcqRel) == 1 {
            Self::count_finished(&self, ctx);
        }
    }

    fn count_finished(this: &Arc<Self>, ctx: &Context<'q, S>) {
        if SINGLE_STEP {
            return;
        }

        // inclusive prefix sum across buckets, then parts: afterwards
        // bkt[p][i] is the exclusive upper bound part p decrements while
        // distributing into bucket i.
        let mut sum = 0u64;
        for i in 0..BKTNUM {
            for p in 0..this.parts {
                // last decrementer of pwork owns all part slots.
                let bkt = unsafe { this.bkt[p].get_mut() };
                sum += bkt[i];
                bkt[i] = sum;
            }
        }
        debug_assert_eq!(sum as usize, this.bundle.size());

        this.pwork.store(this.parts, Ordering::Release);
        for p in 0..this.parts {
            let step = this.clone();
            ctx.queue.enqueue(Box::new(move |ctx| step.distribute(p, ctx)));
        }
    }

    // *** distribution phase

    fn distribute(self: Arc<Self>, p: usize, ctx: &Context<'q, S>) {
        let (begin, end) = self.part_range(p);
        let active = self.bundle.active();
        let shadow = self.bundle.shadow();

        let cache = unsafe { std::mem::take(self.bktcache[p].get_mut()) };
        let bkt = unsafe { self.bkt[p].get_mut() };

        for (j, i) in (begin..end).enumerate() {
            let b = cache[j] as usize;
            bkt[b] -= 1;
            // every string has a unique target slot: the bucket bounds of
            // the parts partition the output range.
            unsafe { shadow.set(bkt[b] as usize, active.get(i)) };
        }
        drop(cache);
        if p != 0 {
            // part 0's bounds are needed for the recursion
            unsafe { *self.bkt[p].get_mut() = Vec::new() };
        }

        if self.pwork.fetch_sub(1, Ordering::AcqRel) == 1 {
            Self::distribute_finished(&self, ctx);
        }
    }

    fn distribute_finished(this: &Arc<Self>, ctx: &Context<'q, S>) {
        let bkt = unsafe { this.bkt[0].get_mut() };
        debug_assert_eq!(bkt[0], 0);
        bkt[BKTNUM] = this.bundle.size() as u64;

        let classifier = unsafe { this.classifier.get() };

        // hold an anonymous substep while spawning children, so the last
        // child cannot trigger completion early.
        this.substep_add();

        for i in 0..BKTNUM {
            let bktsize = (bkt[i + 1] - bkt[i]) as usize;
            if bktsize == 0 {
                continue;
            }
            let sub = this.bundle.flip(bkt[i] as usize, bktsize);
            if bktsize == 1 {
                sub.copy_back();
            } else if i % 2 == 0 {
                // less-than bucket (or the final greater bucket, whose
                // sentinel LCP byte is zero): all strings share the LCP of
                // the two adjacent splitters.
                Self::spawn_child(
                    this,
                    ctx,
                    sub,
                    this.depth + (classifier.splitter_lcp(i / 2) & 0x7F) as usize,
                );
            } else if classifier.splitter_lcp(i / 2) & 0x80 != 0 {
                // equal bucket of a NUL-terminated splitter: done.
                let subb = sub.copy_back();
                subb.fill_lcp(this.depth + key_depth(classifier.splitter(i / 2)));
            } else {
                // equal bucket: the splitter's eight bytes are common.
                Self::spawn_child(this, ctx, sub, this.depth + KEY_SIZE);
            }
        }

        this.substep_notify_done(ctx);
    }

    fn spawn_child(this: &Arc<Self>, ctx: &Context<'q, S>, sub: Bundle<'q, S>, depth: usize) {
        this.substep_add();
        let parent: Arc<dyn SortStep<'q, S> + 'q> = this.clone();
        enqueue_sort(ctx, Some(parent), sub, depth);
    }

    // *** after recursive sorting

    fn substep_all_done(&self, ctx: &Context<'q, S>) {
        if self.bundle.has_lcp() {
            let bkt = unsafe { self.bkt[0].get() };
            let classifier = unsafe { self.classifier.get() };
            sample_sort_lcp(classifier, self.bundle.original(), self.depth, &bkt[..]);
        }
        if let Some(pstep) = &self.pstep {
            pstep.substep_notify_done(ctx);
        }
    }
}

impl<'q, S: StringAccess + 'q> SortStep<'q, S> for SampleSortStep<'q, S> {
    fn substep_notify_done(&self, ctx: &Context<'q, S>) {
        debug_assert!(self.substep_working.load(Ordering::Relaxed) > 0);
        if self.substep_working.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.substep_all_done(ctx);
        }
    }
}

/// Fill the LCP and distinguishing-character entries at this step's bucket
/// boundaries, after every bucket has been sorted and copied back.
///
/// Walks the non-empty buckets carrying the key of the previous bucket's
/// last string; equal buckets take their splitter's key without touching
/// memory. Index 0 of the range is never written, it belongs to the caller.
pub fn sample_sort_lcp<'q, S: StringAccess, B: BktSize>(
    classifier: &Classifier,
    bundle: Bundle<'q, S>,
    depth: usize,
    bkt: &[B],
) {
    debug_assert!(!bundle.flipped());
    let out = bundle.output();
    let mut prev: Option<Key> = None;

    for b in 0..BKTNUM {
        let left = bkt[b].as_index();
        if left == bkt[b + 1].as_index() {
            continue;
        }
        let thiskey = if b % 2 == 1 {
            classifier.splitter(b / 2)
        } else {
            // all children finished before this runs.
            unsafe { out.key_at(left, depth) }
        };
        if let Some(prevkey) = prev {
            let rlcp = key_lcp(prevkey, thiskey);
            unsafe {
                bundle.set_lcp(left, depth + rlcp);
                bundle.set_cache(left, key_char(thiskey, rlcp));
            }
        }
        prev = Some(if b % 2 == 1 {
            thiskey
        } else {
            unsafe { out.key_at(bkt[b + 1].as_index() - 1, depth) }
        });
    }
}
