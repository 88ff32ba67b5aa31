//! Cooperative safepoints: running code on another thread's stack.
//!
//! A requester queues an action on the target's [`SafepointSlot`] and
//! blocks on a completion barrier. The target picks actions up only when
//! it reaches [`ThreadContext::checkpoint`] (loop back-edges, call
//! boundaries), runs them inline on its own stack and releases the
//! requester. Nothing is ever preempted: a thread that never checkpoints
//! starves its requesters.
//!
//! Actions queue in submission order per target, so concurrent requesters
//! never fail or block each other at submission.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    GuestThread, RuntimeError, SourceLocation, ThreadContext, ThreadId,
    Unwind,
};

/// Work run on the target thread, given its context and the site of the
/// checkpoint that picked it up. An `Err` unwinds the target's stack.
pub type SafepointAction = Box<
    dyn FnOnce(&mut ThreadContext, &SourceLocation) -> Result<(), Unwind>
        + Send,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionState {
    Pending,
    Ran,
    Raised,
    Abandoned,
}

struct Completion {
    state: Mutex<CompletionState>,
    cv: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompletionState::Pending),
            cv: Condvar::new(),
        })
    }

    fn finish(&self, state: CompletionState) {
        *self.state.lock() = state;
        self.cv.notify_all();
    }

    fn wait_for(&self, dur: Duration) -> CompletionState {
        let mut state = self.state.lock();
        if *state == CompletionState::Pending {
            let _ = self.cv.wait_for(&mut state, dur);
        }
        *state
    }
}

struct PendingAction {
    action: SafepointAction,
    completion: Arc<Completion>,
    requester: ThreadId,
}

struct SlotQueue {
    actions: VecDeque<PendingAction>,
    accepting: bool,
}

/// Per-thread queue of pending actions. `pending` mirrors "queue is not
/// empty" so checkpoints stay a single load when nothing is queued.
pub(crate) struct SafepointSlot {
    queue: Mutex<SlotQueue>,
    pending: AtomicBool,
}

impl SafepointSlot {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(SlotQueue {
                actions: VecDeque::new(),
                accepting: true,
            }),
            pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().actions.len()
    }

    fn submit(&self, action: PendingAction) -> Result<(), PendingAction> {
        let mut queue = self.queue.lock();
        if !queue.accepting {
            return Err(action);
        }
        queue.actions.push_back(action);
        self.pending.store(true, Ordering::Release);
        Ok(())
    }

    fn take_next(&self) -> Option<PendingAction> {
        let mut queue = self.queue.lock();
        let next = queue.actions.pop_front();
        if queue.actions.is_empty() {
            self.pending.store(false, Ordering::Release);
        }
        next
    }

    /// Stops accepting actions and releases everything still queued.
    /// Returns how many requesters were released.
    pub(crate) fn close(&self) -> usize {
        let abandoned: Vec<PendingAction> = {
            let mut queue = self.queue.lock();
            queue.accepting = false;
            self.pending.store(false, Ordering::Release);
            queue.actions.drain(..).collect()
        };
        for pending in &abandoned {
            pending.completion.finish(CompletionState::Abandoned);
        }
        abandoned.len()
    }
}

impl fmt::Debug for SafepointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafepointSlot")
            .field("pending", &self.len())
            .finish()
    }
}

/// How a submitted action ended from the requester's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The action ran on the target (it may have raised there).
    Executed,
    /// The target was dead or exited before running the action.
    TargetDead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafepointStats {
    pub requests: u64,
    pub executed: u64,
    pub polls: u64,
    pub abandoned: u64,
}

#[derive(Debug)]
pub struct SafepointManager {
    requests: AtomicU64,
    executed: AtomicU64,
    polls: AtomicU64,
    abandoned: AtomicU64,
    poll_interval: Duration,
}

impl SafepointManager {
    /// `poll_interval` bounds how long a blocked requester goes without
    /// servicing its own checkpoint.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            requests: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            poll_interval,
        }
    }

    /// Runs `action` on `target`'s stack at its next checkpoint and blocks
    /// until it has run. A dead target raises `ThreadError`.
    pub fn pause_and_run<F>(
        &self,
        ctx: &mut ThreadContext,
        target: &Arc<GuestThread>,
        action: F,
    ) -> Result<(), Unwind>
    where
        F: FnOnce(&mut ThreadContext, &SourceLocation) -> Result<(), Unwind>
            + Send
            + 'static,
    {
        match self.deliver(ctx, target, Box::new(action), None)? {
            Delivery::Executed => Ok(()),
            Delivery::TargetDead => {
                Err(ctx.raise(RuntimeError::ThreadNotAlive(target.id)))
            }
        }
    }

    /// Like [`Self::pause_and_run`] but gives up waiting after `timeout`.
    /// The action stays queued and still runs when the target gets to it.
    pub fn pause_and_run_timeout<F>(
        &self,
        ctx: &mut ThreadContext,
        target: &Arc<GuestThread>,
        action: F,
        timeout: Duration,
    ) -> Result<(), Unwind>
    where
        F: FnOnce(&mut ThreadContext, &SourceLocation) -> Result<(), Unwind>
            + Send
            + 'static,
    {
        match self.deliver(ctx, target, Box::new(action), Some(timeout))? {
            Delivery::Executed => Ok(()),
            Delivery::TargetDead => {
                Err(ctx.raise(RuntimeError::ThreadNotAlive(target.id)))
            }
        }
    }

    /// Submits `action` and waits for it. While waiting the requester keeps
    /// running its own checkpoint, so two threads pausing each other cannot
    /// deadlock; an exception injected into the requester ends its wait.
    pub fn deliver(
        &self,
        ctx: &mut ThreadContext,
        target: &Arc<GuestThread>,
        action: SafepointAction,
        timeout: Option<Duration>,
    ) -> Result<Delivery, Unwind> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        if target.id == ctx.thread_id() {
            log::debug!("safepoint action for current thread {} runs inline", target.id);
            let site = ctx.current_site();
            self.executed.fetch_add(1, Ordering::Relaxed);
            action(ctx, &site)?;
            return Ok(Delivery::Executed);
        }

        let completion = Completion::new();
        let pending = PendingAction {
            action,
            completion: Arc::clone(&completion),
            requester: ctx.thread_id(),
        };
        if target.safepoint.submit(pending).is_err() {
            log::debug!("thread {} is not accepting safepoint actions", target.id);
            return Ok(Delivery::TargetDead);
        }
        log::debug!(
            "thread {} queued a safepoint action on thread {}",
            ctx.thread_id(),
            target.id
        );

        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        loop {
            let slice = match deadline {
                Some((deadline, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        log::warn!(
                            "gave up waiting for thread {} to reach a safepoint",
                            target.id
                        );
                        return Err(ctx.raise(RuntimeError::SafepointTimeout {
                            thread: target.id,
                            timeout,
                        }));
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            match completion.wait_for(slice) {
                CompletionState::Ran | CompletionState::Raised => {
                    return Ok(Delivery::Executed);
                }
                CompletionState::Abandoned => return Ok(Delivery::TargetDead),
                CompletionState::Pending => ctx.checkpoint()?,
            }
        }
    }

    /// Runs every action queued for the calling thread, oldest first. Stops
    /// at the first action that raises and hands its unwind to the caller;
    /// the rest stay queued for the next checkpoint.
    pub fn poll(&self, ctx: &mut ThreadContext) -> Result<(), Unwind> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::clone(ctx.thread());
        if !thread.safepoint.has_pending() {
            return Ok(());
        }

        while let Some(pending) = thread.safepoint.take_next() {
            let site = ctx.current_site();
            log::debug!(
                "thread {} runs safepoint action from thread {} at {site}",
                thread.id,
                pending.requester
            );
            let result = (pending.action)(ctx, &site);
            self.executed.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(()) => pending.completion.finish(CompletionState::Ran),
                Err(unwind) => {
                    pending.completion.finish(CompletionState::Raised);
                    return Err(unwind);
                }
            }
        }
        Ok(())
    }

    /// Called when `thread` exits: no further actions are accepted and
    /// queued requesters are released.
    pub(crate) fn release_thread(&self, thread: &GuestThread) {
        let released = thread.safepoint.close();
        if released > 0 {
            log::debug!(
                "thread {} exited with {released} pending safepoint actions",
                thread.id
            );
            self.abandoned.fetch_add(released as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> SafepointStats {
        SafepointStats {
            requests: self.requests.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}
