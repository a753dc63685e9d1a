//! Deferred reclamation of relocated GPU stores.
//!
//! When a buffer or image is replaced (array growth, texture resize, atlas
//! growth) the old store may still be read by frames that are in flight. The
//! replacement is published immediately, but the old store is only destroyed
//! once every frame slot has passed its fence and re-published its bindings.
//!
//! Each task is a pair of callbacks plus the set of frame slots that have not
//! been notified yet:
//!
//! ```text
//!   add_task ──► PendingRetirement { frames_remaining = {0..N} }
//!                  │ tick(f): per_frame(ctx, f), remove f
//!                  ▼
//!                PendingRetirement { frames_remaining = {} }
//!                  │ finalize(ctx)
//!                  ▼
//!                Destroyed
//! ```
//!
//! The store that replaced it is the owner's `Active` generation.
//!
//! Callbacks receive the context mutably instead of capturing references, so
//! the queue can live inside the context it operates on. The owner splits a
//! tick into [`take_due`](DeferredReclamationQueue::take_due),
//! [`DueBatch::run`] and [`restore`](DeferredReclamationQueue::restore).
//!
//! # Example
//!
//! ```ignore
//! let mut queue = DeferredReclamationQueue::<Vec<String>>::new(2);
//! queue.add(
//!     |log, frame| log.push(format!("refresh {frame}")),
//!     |log| log.push("destroy".into()),
//! );
//! let mut log = Vec::new();
//! queue.tick(0, &mut log);
//! queue.tick(1, &mut log); // "destroy" runs here
//! ```

use std::fmt;

/// Callback run once per frame slot after the slot's fence has been waited on.
pub type PerFrameFn<C> = Box<dyn FnMut(&mut C, u32) + Send>;

/// Callback run once after every frame slot has been notified.
pub type FinalizeFn<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Monotonic id of a retired store generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

/// Growable set of frame slot indices.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FrameSet {
    words: Vec<u64>,
}

impl FrameSet {
    /// The set `{0, 1, .., frames - 1}`.
    pub fn full(frames: u32) -> Self {
        let mut words = vec![u64::MAX; (frames as usize).div_ceil(64)];
        let tail = frames % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self { words }
    }

    pub fn contains(&self, frame: u32) -> bool {
        let (word, bit) = (frame as usize / 64, frame % 64);
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << bit) != 0)
    }

    /// Remove `frame`, returning whether it was present.
    pub fn remove(&mut self, frame: u32) -> bool {
        let (word, bit) = (frame as usize / 64, frame % 64);
        match self.words.get_mut(word) {
            Some(w) if *w & (1u64 << bit) != 0 => {
                *w &= !(1u64 << bit);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64u32)
                .filter(move |b| w & (1u64 << b) != 0)
                .map(move |b| i as u32 * 64 + b)
        })
    }
}

impl fmt::Debug for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Where a retired store is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetirementState {
    /// Replaced; waiting for the listed frame slots to move on.
    PendingRetirement { frames_remaining: FrameSet },
    /// Finalized.
    Destroyed,
}

/// One pending retirement.
pub struct DeferredTask<C> {
    generation: Generation,
    per_frame: Option<PerFrameFn<C>>,
    finalize: Option<FinalizeFn<C>>,
    state: RetirementState,
}

impl<C> DeferredTask<C> {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> &RetirementState {
        &self.state
    }

    fn is_due(&self, frame: u32) -> bool {
        matches!(
            &self.state,
            RetirementState::PendingRetirement { frames_remaining } if frames_remaining.contains(frame)
        )
    }

    /// Run the per-frame callback for `frame`. Returns true once no frames remain.
    fn notify(&mut self, frame: u32, ctx: &mut C) -> bool {
        let RetirementState::PendingRetirement { frames_remaining } = &mut self.state else {
            return false;
        };
        if !frames_remaining.remove(frame) {
            return frames_remaining.is_empty();
        }
        if let Some(per_frame) = self.per_frame.as_mut() {
            per_frame(ctx, frame);
        }
        frames_remaining.is_empty()
    }

    fn retire(mut self, ctx: &mut C) {
        debug_assert!(matches!(
            &self.state,
            RetirementState::PendingRetirement { frames_remaining } if frames_remaining.is_empty()
        ));
        self.state = RetirementState::Destroyed;
        if let Some(finalize) = self.finalize.take() {
            finalize(ctx);
        }
        log::debug!("Retired store generation {}", self.generation.0);
    }
}

impl<C> fmt::Debug for DeferredTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("has_per_frame", &self.per_frame.is_some())
            .field("has_finalize", &self.finalize.is_some())
            .finish()
    }
}

/// Tasks taken out of the queue for one frame slot.
pub struct DueBatch<C> {
    frame: u32,
    tasks: Vec<DeferredTask<C>>,
}

impl<C> DueBatch<C> {
    /// Number of tasks that fire for this frame.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Notify every task, retire the finished ones and return the rest.
    pub fn run(self, ctx: &mut C) -> Vec<DeferredTask<C>> {
        let mut survivors = Vec::with_capacity(self.tasks.len());
        for mut task in self.tasks {
            if task.notify(self.frame, ctx) {
                task.retire(ctx);
            } else {
                survivors.push(task);
            }
        }
        survivors
    }
}

/// Queue of stores waiting for every frame slot to move past them.
pub struct DeferredReclamationQueue<C> {
    frames_in_flight: u32,
    tasks: Vec<DeferredTask<C>>,
    next_generation: u64,
}

impl<C> DeferredReclamationQueue<C> {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight,
            tasks: Vec::new(),
            next_generation: 0,
        }
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Enqueue a retirement. Either callback may be absent.
    pub fn add_task(
        &mut self,
        per_frame: Option<PerFrameFn<C>>,
        finalize: Option<FinalizeFn<C>>,
    ) -> Generation {
        let generation = Generation(self.next_generation);
        self.next_generation += 1;
        self.tasks.push(DeferredTask {
            generation,
            per_frame,
            finalize,
            state: RetirementState::PendingRetirement {
                frames_remaining: FrameSet::full(self.frames_in_flight),
            },
        });
        log::debug!(
            "Queued deferred task generation {} over {} frames",
            generation.0,
            self.frames_in_flight
        );
        generation
    }

    /// Enqueue a retirement from two closures.
    pub fn add<P, F>(&mut self, per_frame: P, finalize: F) -> Generation
    where
        P: FnMut(&mut C, u32) + Send + 'static,
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.add_task(Some(Box::new(per_frame)), Some(Box::new(finalize)))
    }

    /// Enqueue an empty task so every frame slot re-records its commands once.
    pub fn request_rerecord(&mut self) -> Generation {
        self.add_task(None, None)
    }

    /// Number of tasks not yet retired.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether any task still waits on `frame`.
    pub fn is_due(&self, frame: u32) -> bool {
        self.tasks.iter().any(|t| t.is_due(frame))
    }

    pub fn tasks(&self) -> &[DeferredTask<C>] {
        &self.tasks
    }

    /// Remove and return the tasks that still wait on `frame`.
    pub fn take_due(&mut self, frame: u32) -> DueBatch<C> {
        let (due, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|t| t.is_due(frame));
        self.tasks = rest;
        DueBatch { frame, tasks: due }
    }

    /// Put back tasks returned from [`DueBatch::run`], ahead of anything queued meanwhile.
    pub fn restore(&mut self, mut survivors: Vec<DeferredTask<C>>) {
        survivors.append(&mut self.tasks);
        self.tasks = survivors;
    }

    /// Notify every task waiting on `frame`. Returns how many fired.
    pub fn tick(&mut self, frame: u32, ctx: &mut C) -> usize {
        let batch = self.take_due(frame);
        let fired = batch.len();
        let survivors = batch.run(ctx);
        self.restore(survivors);
        fired
    }

    /// Remove every task regardless of progress.
    pub fn take_all(&mut self) -> Vec<DeferredTask<C>> {
        std::mem::take(&mut self.tasks)
    }

    /// Notify all outstanding frames and retire everything. Only valid once the
    /// device is idle.
    pub fn flush(&mut self, ctx: &mut C) -> usize {
        let tasks = self.take_all();
        let count = tasks.len();
        complete_all(tasks, ctx);
        count
    }
}

/// Run remaining frames and the finalizer of each task.
pub fn complete_all<C>(tasks: Vec<DeferredTask<C>>, ctx: &mut C) {
    for mut task in tasks {
        let remaining: Vec<u32> = match &task.state {
            RetirementState::PendingRetirement { frames_remaining } => {
                frames_remaining.iter().collect()
            }
            RetirementState::Destroyed => continue,
        };
        for frame in remaining {
            task.notify(frame, ctx);
        }
        task.retire(ctx);
    }
}

impl<C> fmt::Debug for DeferredReclamationQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReclamationQueue")
            .field("frames_in_flight", &self.frames_in_flight)
            .field("tasks", &self.tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    type Log = Vec<String>;

    fn logging_task(queue: &mut DeferredReclamationQueue<Log>, name: &'static str) {
        queue.add(
            move |log: &mut Log, frame| log.push(format!("{name}:{frame}")),
            move |log: &mut Log| log.push(format!("{name}:final")),
        );
    }

    #[rstest]
    #[case([0, 1, 2])]
    #[case([2, 0, 1])]
    #[case([1, 2, 0])]
    #[case([2, 1, 0])]
    fn test_three_frames_any_order(#[case] order: [u32; 3]) {
        let mut queue = DeferredReclamationQueue::new(3);
        logging_task(&mut queue, "a");
        let mut log = Log::new();

        for (i, frame) in order.iter().enumerate() {
            assert_eq!(queue.tick(*frame, &mut log), 1);
            let finalized = log.iter().any(|l| l == "a:final");
            assert_eq!(finalized, i == 2, "finalize ran early or late");
        }

        let mut expected: Log = order.iter().map(|f| format!("a:{f}")).collect();
        expected.push("a:final".into());
        assert_eq!(log, expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_repeated_frame_does_not_refire() {
        let mut queue = DeferredReclamationQueue::new(2);
        logging_task(&mut queue, "a");
        let mut log = Log::new();

        assert_eq!(queue.tick(0, &mut log), 1);
        assert_eq!(queue.tick(0, &mut log), 0);
        assert_eq!(log, vec!["a:0".to_string()]);
        assert!(!queue.is_due(0));
        assert!(queue.is_due(1));
    }

    #[test]
    fn test_independent_tasks() {
        let mut queue = DeferredReclamationQueue::new(2);
        let mut log = Log::new();
        logging_task(&mut queue, "a");
        queue.tick(0, &mut log);
        logging_task(&mut queue, "b");

        assert_eq!(queue.tick(1, &mut log), 2);
        assert!(log.contains(&"a:final".to_string()));
        assert!(!log.contains(&"b:final".to_string()));

        queue.tick(0, &mut log);
        assert_eq!(log.last().map(String::as_str), Some("b:final"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rerecord_request_touches_every_frame() {
        let mut queue = DeferredReclamationQueue::<Log>::new(3);
        queue.request_rerecord();
        let mut log = Log::new();

        for frame in 0..3 {
            assert!(queue.is_due(frame));
            assert_eq!(queue.tick(frame, &mut log), 1);
        }
        assert!(queue.is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn test_more_than_32_frames() {
        let frames = 40;
        let mut queue = DeferredReclamationQueue::new(frames);
        logging_task(&mut queue, "a");
        let mut log = Log::new();

        for frame in (0..frames).rev() {
            queue.tick(frame, &mut log);
        }
        assert_eq!(log.len(), frames as usize + 1);
        assert_eq!(log.last().map(String::as_str), Some("a:final"));
    }

    #[test]
    fn test_split_tick_keeps_tasks_added_meanwhile() {
        let mut queue = DeferredReclamationQueue::<Log>::new(2);
        logging_task(&mut queue, "a");
        let mut log = Log::new();

        let batch = queue.take_due(0);
        logging_task(&mut queue, "b");
        let survivors = batch.run(&mut log);
        queue.restore(survivors);

        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.tasks()[0].generation(), Generation(0));
        assert_eq!(queue.tasks()[1].generation(), Generation(1));
    }

    #[test]
    fn test_flush_finalizes_everything() {
        let mut queue = DeferredReclamationQueue::new(3);
        logging_task(&mut queue, "a");
        let mut log = Log::new();
        queue.tick(1, &mut log);

        assert_eq!(queue.flush(&mut log), 1);
        assert_eq!(log, vec!["a:1", "a:0", "a:2", "a:final"]);
    }

    #[test]
    fn test_frame_set() {
        let mut set = FrameSet::full(70);
        assert_eq!(set.len(), 70);
        assert!(set.contains(69));
        assert!(!set.contains(70));
        assert!(set.remove(64));
        assert!(!set.remove(64));
        assert_eq!(set.len(), 69);

        let mut small = FrameSet::full(2);
        small.remove(0);
        small.remove(1);
        assert!(small.is_empty());
    }
}
