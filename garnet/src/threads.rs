use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    Delivery, Exception, Outcome, RuntimeError, SafepointAction,
    ThreadContext, Unwind, Value, safepoint::SafepointSlot,
};

pub const GUEST_MIN_PRIORITY: i32 = -3;
pub const GUEST_MAX_PRIORITY: i32 = 3;
pub const NATIVE_MIN_PRIORITY: i32 = 1;
pub const NATIVE_NORM_PRIORITY: i32 = 5;
pub const NATIVE_MAX_PRIORITY: i32 = 10;

/// Maps -3..=3 onto 1..=10 with 0 landing on the native norm.
pub fn guest_to_native_priority(priority: i32) -> i32 {
    let g = f64::from(priority.clamp(GUEST_MIN_PRIORITY, GUEST_MAX_PRIORITY));
    let native = (g * g) / 18.0 + 1.5 * g + 5.0;
    (native.round() as i32).clamp(NATIVE_MIN_PRIORITY, NATIVE_MAX_PRIORITY)
}

/// Inverse of [`guest_to_native_priority`].
pub fn native_to_guest_priority(priority: i32) -> i32 {
    let n = f64::from(priority.clamp(NATIVE_MIN_PRIORITY, NATIVE_MAX_PRIORITY));
    let guest = 1.5 * (8.0 * n + 41.0).sqrt() - 13.5;
    (guest.round() as i32).clamp(GUEST_MIN_PRIORITY, GUEST_MAX_PRIORITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Created,
    Running,
    Dead,
}

impl ThreadStatus {
    pub fn name(self) -> &'static str {
        match self {
            ThreadStatus::Created => "created",
            ThreadStatus::Running => "run",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// The scheduler's native priority knob.
pub trait PriorityFacility: Send + Sync + fmt::Debug {
    fn native_priority(&self, unit: &NativeUnit) -> i32;
    fn set_native_priority(&self, unit: &NativeUnit, priority: i32);
}

/// std exposes no portable priority API, so the value is kept on the
/// unit as a hint.
#[derive(Debug, Default)]
pub struct AdvisoryPriority;

impl PriorityFacility for AdvisoryPriority {
    fn native_priority(&self, unit: &NativeUnit) -> i32 {
        unit.advisory_priority.load(Ordering::Acquire)
    }

    fn set_native_priority(&self, unit: &NativeUnit, priority: i32) {
        let priority = priority.clamp(NATIVE_MIN_PRIORITY, NATIVE_MAX_PRIORITY);
        unit.advisory_priority.store(priority, Ordering::Release);
    }
}

/// An OS thread backing a guest thread.
pub struct NativeUnit {
    handle: Mutex<Option<JoinHandle<()>>>,
    done: (Mutex<bool>, Condvar),
    advisory_priority: AtomicI32,
}

impl NativeUnit {
    fn unstarted() -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(None),
            done: (Mutex::new(false), Condvar::new()),
            advisory_priority: AtomicI32::new(NATIVE_NORM_PRIORITY),
        })
    }

    /// Unit for a thread the runtime did not spawn (the main thread).
    pub(crate) fn adopt_current() -> Arc<Self> {
        Self::unstarted()
    }

    pub(crate) fn spawn<F>(
        name: String,
        stack_size: Option<usize>,
        f: F,
    ) -> io::Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        let unit = Self::unstarted();
        let unit2 = Arc::clone(&unit);

        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder.spawn(move || {
            let _done = MarkDone(unit2);
            f();
        })?;
        *unit.handle.lock() = Some(handle);
        Ok(unit)
    }

    pub fn is_finished(&self) -> bool {
        *self.done.0.lock()
    }

    pub fn join_timeout(&self, dur: Duration) -> bool {
        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        if !*done {
            let _ = cv.wait_for(&mut done, dur);
        }
        *done
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
            return;
        }

        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        while !*done {
            cv.wait(&mut done);
        }
    }
}

/// Sets the unit's done flag even when the thread unwinds.
struct MarkDone(Arc<NativeUnit>);

impl Drop for MarkDone {
    fn drop(&mut self) {
        let (ref mx, ref cv) = self.0.done;
        *mx.lock() = true;
        cv.notify_all();
    }
}

impl fmt::Debug for NativeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeUnit")
            .field("finished", &self.is_finished())
            .field("advisory_priority", &self.advisory_priority.load(Ordering::Relaxed))
            .finish()
    }
}

struct ThreadState {
    status: ThreadStatus,
    /// Priority descriptor; cleared when the thread dies.
    priority: Option<i32>,
    result: Option<Result<Value, Exception>>,
}

/// Runtime-side descriptor of a guest thread.
pub struct GuestThread {
    pub id: ThreadId,
    name: String,
    state: Mutex<ThreadState>,
    finished: Condvar,
    native: Mutex<Option<Arc<NativeUnit>>>,
    pub(crate) safepoint: SafepointSlot,
}

impl GuestThread {
    pub(crate) fn new(id: ThreadId, name: String, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            state: Mutex::new(ThreadState {
                status: ThreadStatus::Created,
                priority: Some(priority.clamp(GUEST_MIN_PRIORITY, GUEST_MAX_PRIORITY)),
                result: None,
            }),
            finished: Condvar::new(),
            native: Mutex::new(None),
            safepoint: SafepointSlot::new(),
        })
    }

    /// Descriptor for the thread that is already running this code.
    pub(crate) fn adopt_current(
        id: ThreadId,
        name: String,
        priority: i32,
        facility: &dyn PriorityFacility,
    ) -> Arc<Self> {
        let thread = Self::new(id, name, priority);
        thread.state.lock().status = ThreadStatus::Running;
        thread.attach_native(NativeUnit::adopt_current(), facility);
        thread
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.state.lock().status
    }

    pub fn is_alive(&self) -> bool {
        self.status() != ThreadStatus::Dead
    }

    pub fn pending_actions(&self) -> usize {
        self.safepoint.len()
    }

    pub(crate) fn mark_started(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        match state.status {
            ThreadStatus::Created => {
                state.status = ThreadStatus::Running;
                Ok(())
            }
            ThreadStatus::Running => Err(RuntimeError::ThreadAlreadyStarted(self.id)),
            ThreadStatus::Dead => Err(RuntimeError::ThreadNotAlive(self.id)),
        }
    }

    /// Hands the descriptor's priority over to the freshly spawned unit.
    pub(crate) fn attach_native(
        &self,
        unit: Arc<NativeUnit>,
        facility: &dyn PriorityFacility,
    ) {
        let state = self.state.lock();
        if state.status == ThreadStatus::Running {
            let priority = state.priority.unwrap_or(0);
            facility.set_native_priority(&unit, guest_to_native_priority(priority));
        }
        *self.native.lock() = Some(unit);
    }

    pub(crate) fn finish(&self, result: Result<Value, Exception>) {
        let mut state = self.state.lock();
        state.status = ThreadStatus::Dead;
        state.priority = None;
        state.result = Some(result);
        self.finished.notify_all();
    }

    /// Waits up to `dur` for the thread to die; answers whether it has.
    pub fn wait_dead(&self, dur: Duration) -> bool {
        let mut state = self.state.lock();
        if state.status != ThreadStatus::Dead {
            let _ = self.finished.wait_for(&mut state, dur);
        }
        state.status == ThreadStatus::Dead
    }

    /// Value or exception the thread ended with, once it is dead.
    pub fn result(&self) -> Option<Result<Value, Exception>> {
        self.state.lock().result.clone()
    }

    /// Joins the backing OS thread, if there is one.
    pub fn join_native(&self) {
        let unit = self.native.lock().clone();
        if let Some(unit) = unit {
            unit.join();
        }
    }

    /// Whether the backing OS thread has run to completion.
    pub fn native_finished(&self) -> bool {
        self.native.lock().as_ref().is_some_and(|unit| unit.is_finished())
    }

    fn live_unit(&self, state: &ThreadState) -> Option<Arc<NativeUnit>> {
        if state.status != ThreadStatus::Running {
            return None;
        }
        self.native.lock().clone()
    }

    /// Reads the native priority when a unit is live, the descriptor
    /// otherwise.
    pub fn priority(&self, facility: &dyn PriorityFacility) -> Result<i32, RuntimeError> {
        let state = self.state.lock();
        if let Some(unit) = self.live_unit(&state) {
            return Ok(native_to_guest_priority(facility.native_priority(&unit)));
        }
        state.priority.ok_or(RuntimeError::ThreadNotAlive(self.id))
    }

    /// Clamps `requested` to the guest range and applies it. Answers the
    /// priority actually set.
    pub fn set_priority(
        &self,
        facility: &dyn PriorityFacility,
        requested: i64,
    ) -> Result<i32, RuntimeError> {
        let priority = requested
            .clamp(i64::from(GUEST_MIN_PRIORITY), i64::from(GUEST_MAX_PRIORITY))
            as i32;

        let mut state = self.state.lock();
        let unit = self.live_unit(&state);
        if unit.is_none() && state.priority.is_none() {
            return Err(RuntimeError::ThreadNotAlive(self.id));
        }
        if let Some(unit) = unit {
            facility.set_native_priority(&unit, guest_to_native_priority(priority));
        }
        state.priority = Some(priority);
        log::debug!("thread {} priority set to {priority}", self.id);
        Ok(priority)
    }
}

impl fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("safepoint", &self.safepoint)
            .finish()
    }
}

/// Raises `exception` inside `target` at its next checkpoint and waits
/// until it has been thrown there. The backtrace, unless the exception
/// already has one, is captured on the target's stack. Raising into a dead
/// thread does nothing.
pub fn raise_in_thread(
    ctx: &mut ThreadContext,
    target: &Arc<GuestThread>,
    exception: Exception,
) -> Outcome {
    let shared = Arc::clone(&ctx.vm.shared);
    let injected = Arc::clone(&exception);
    let action: SafepointAction = Box::new(move |ctx, site| {
        log::debug!(
            "raising {} in thread {} at {site}",
            injected.class().name(),
            ctx.thread_id()
        );
        injected.attach_backtrace_if_absent(ctx.backtrace());
        Err(Unwind::Raise(injected))
    });

    match shared.safepoints.deliver(ctx, target, action, None)? {
        Delivery::Executed => Ok(Value::Nil),
        Delivery::TargetDead => {
            log::debug!("raise into dead thread {} ignored", target.id);
            Ok(Value::Nil)
        }
    }
}
