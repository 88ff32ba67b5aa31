use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;

use crate::{
    AdvisoryPriority, BlockKind, Closure, Exception, ExceptionClass, GuestException,
    GuestThread, NativeUnit, PriorityFacility, RuntimeError, SafepointManager,
    ThreadContext, ThreadId, Unwind, Value, escape_orphan,
};

#[derive(Debug, Clone)]
pub struct VMCreateInfo {
    pub main_thread_name: String,
    /// Guest priority new threads start with.
    pub default_priority: i32,
    /// Longest a blocked thread goes without servicing its own safepoint.
    pub safepoint_poll_interval: Duration,
    pub thread_stack_size: Option<usize>,
}

impl Default for VMCreateInfo {
    fn default() -> Self {
        Self {
            main_thread_name: "main".into(),
            default_priority: 0,
            safepoint_poll_interval: Duration::from_millis(2),
            thread_stack_size: None,
        }
    }
}

#[derive(Debug)]
pub struct VMShared {
    pub info: VMCreateInfo,
    pub safepoints: SafepointManager,
    pub priorities: Arc<dyn PriorityFacility>,
    threads: RwLock<HashMap<ThreadId, Arc<GuestThread>>>,
    next_thread_id: AtomicU64,
    main_thread: Arc<GuestThread>,
}

pub struct VM {
    inner: Arc<VMShared>,
}

#[derive(Debug, Clone)]
pub struct VMProxy {
    pub shared: Arc<VMShared>,
}

impl VM {
    pub fn new(info: VMCreateInfo) -> Self {
        Self::with_priority_facility(info, Arc::new(AdvisoryPriority))
    }

    pub fn with_priority_facility(
        info: VMCreateInfo,
        priorities: Arc<dyn PriorityFacility>,
    ) -> Self {
        let main_id = ThreadId(1);
        let main_thread = GuestThread::adopt_current(
            main_id,
            info.main_thread_name.clone(),
            info.default_priority,
            priorities.as_ref(),
        );
        let mut threads = HashMap::new();
        threads.insert(main_id, Arc::clone(&main_thread));

        let inner = VMShared {
            safepoints: SafepointManager::new(info.safepoint_poll_interval),
            priorities,
            threads: RwLock::new(threads),
            next_thread_id: AtomicU64::new(main_id.0 + 1),
            main_thread,
            info,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn new_proxy(&self) -> VMProxy {
        VMProxy {
            shared: self.inner.clone(),
        }
    }

    pub fn main_thread(&self) -> &Arc<GuestThread> {
        &self.inner.main_thread
    }

    /// Execution context for code running on the thread that built the VM.
    pub fn main_context(&self) -> ThreadContext {
        ThreadContext::new(self.new_proxy(), Arc::clone(&self.inner.main_thread))
    }
}

impl VMShared {
    fn register(&self, thread: &Arc<GuestThread>) {
        self.threads.write().insert(thread.id, Arc::clone(thread));
    }

    fn unregister(&self, id: ThreadId) {
        self.threads.write().remove(&id);
    }
}

impl VMProxy {
    pub fn create_proxy(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }

    /// Registers a thread that has not started yet.
    pub fn create_thread(&self, name: Option<&str>) -> Arc<GuestThread> {
        let id = ThreadId(self.shared.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let name = name.map_or_else(|| format!("thread-{id}"), str::to_owned);
        let thread = GuestThread::new(id, name, self.shared.info.default_priority);
        self.shared.register(&thread);
        thread
    }

    /// Starts `thread` on a new OS thread, running `body` with `args`.
    pub fn start_thread(
        &self,
        thread: &Arc<GuestThread>,
        body: Closure,
        args: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        thread.mark_started()?;

        let proxy = self.create_proxy();
        let runner = Arc::clone(thread);
        let spawned = NativeUnit::spawn(
            format!("garnet-{}", thread.name()),
            self.shared.info.thread_stack_size,
            move || run_thread(proxy, runner, body, args),
        );

        match spawned {
            Ok(unit) => {
                thread.attach_native(unit, self.shared.priorities.as_ref());
                log::debug!("thread {} ({}) started", thread.id, thread.name());
                Ok(())
            }
            Err(err) => {
                log::error!("failed to spawn native thread for {}: {err}", thread.id);
                self.shared.safepoints.release_thread(thread);
                thread.finish(Err(GuestException::new(
                    ExceptionClass::ThreadError,
                    format!("can't create thread: {err}"),
                )));
                self.shared.unregister(thread.id);
                Err(RuntimeError::ThreadSpawn(err))
            }
        }
    }

    pub fn spawn(
        &self,
        name: Option<&str>,
        body: Closure,
        args: Vec<Value>,
    ) -> Result<Arc<GuestThread>, RuntimeError> {
        let thread = self.create_thread(name);
        self.start_thread(&thread, body, args)?;
        Ok(thread)
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<GuestThread>> {
        self.shared.threads.read().get(&id).cloned()
    }

    /// Threads that have not exited, ordered by id.
    pub fn threads(&self) -> Vec<Arc<GuestThread>> {
        let mut threads: Vec<_> = self.shared.threads.read().values().cloned().collect();
        threads.sort_by_key(|t| t.id);
        threads
    }

    pub fn main_thread(&self) -> &Arc<GuestThread> {
        &self.shared.main_thread
    }
}

/// Closes out a guest thread when its runner returns or unwinds.
struct ThreadExit {
    shared: Arc<VMShared>,
    thread: Arc<GuestThread>,
    result: Option<Result<Value, Exception>>,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        // anything queued after the last checkpoint never runs
        self.shared.safepoints.release_thread(&self.thread);

        let result = self.result.take().unwrap_or_else(|| {
            log::error!("thread {} panicked in host code", self.thread.id);
            Err(GuestException::new(
                ExceptionClass::ThreadError,
                format!("thread {} terminated by a host panic", self.thread.id),
            ))
        });
        match &result {
            Ok(_) => log::debug!("thread {} finished", self.thread.id),
            Err(exception) => {
                log::debug!("thread {} terminated with {exception}", self.thread.id)
            }
        }
        self.thread.finish(result);
        self.shared.unregister(self.thread.id);
    }
}

fn run_thread(vm: VMProxy, thread: Arc<GuestThread>, body: Closure, args: Vec<Value>) {
    let mut exit = ThreadExit {
        shared: Arc::clone(&vm.shared),
        thread: Arc::clone(&thread),
        result: None,
    };
    let mut ctx = ThreadContext::new(vm, thread);
    let body = body.with_kind(BlockKind::ThreadBody);

    let outcome = match ctx.checkpoint() {
        Ok(()) => body.call(&mut ctx, &args, &Closure::null()),
        Err(unwind) => Err(unwind),
    };
    let outcome = escape_orphan(&mut ctx, outcome);

    exit.result = Some(outcome.map_err(|unwind| match unwind {
        Unwind::Raise(exception) => exception,
        Unwind::Signal(signal) => GuestException::new(
            ExceptionClass::LocalJumpError,
            format!("unexpected {}", signal.name()),
        ),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Binding, ControlSignal, Signature, SourceLocation, ThreadStatus,
        native_body,
    };

    fn thread_body(
        f: impl Fn(&mut ThreadContext, &[Value]) -> crate::Outcome
            + Send
            + Sync
            + 'static,
    ) -> Closure {
        let body = native_body(Signature::OPTIONAL_REST, move |ctx, _, args, _| {
            f(ctx, args)
        });
        let binding =
            Binding::toplevel(Value::Nil, SourceLocation::new("t.rb", 1, "block"));
        Closure::capture(binding, body, BlockKind::Proc)
    }

    #[test]
    fn spawned_thread_value_is_returned_by_join() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let proxy = vm.new_proxy();

        let body = thread_body(|_, args| Ok(args[0].clone()));
        let thread = proxy
            .spawn(Some("worker"), body, vec![Value::Fixnum(42)])
            .expect("spawn");
        assert_eq!(thread.name(), "worker");

        let value = ctx.join(&thread, None).expect("join");
        assert_eq!(value, Value::Fixnum(42));
        assert_eq!(thread.status(), ThreadStatus::Dead);
        assert!(proxy.thread(thread.id).is_none(), "dead threads unregister");
        thread.join_native();
    }

    #[test]
    fn thread_exception_is_reraised_by_join() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let body = thread_body(|ctx, _| {
            Err(ctx.raise_exception(GuestException::new(
                ExceptionClass::RuntimeError,
                "boom",
            )))
        });
        let thread = vm.new_proxy().spawn(None, body, vec![]).expect("spawn");

        let err = ctx.join(&thread, None).unwrap_err();
        let exception = err.exception().expect("raise");
        assert_eq!(exception.message(), "boom");
        assert_eq!(exception.backtrace().expect("backtrace").thread, thread.id);
    }

    #[test]
    fn break_out_of_thread_body_is_a_local_jump_error() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let body =
            thread_body(|_, _| Err(ControlSignal::Break(Value::Nil).into()));
        let thread = vm.new_proxy().spawn(None, body, vec![]).expect("spawn");

        let err = ctx.join(&thread, None).unwrap_err();
        assert_eq!(
            *err.exception().expect("raise").class(),
            ExceptionClass::LocalJumpError
        );
    }

    #[test]
    fn starting_twice_fails() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let proxy = vm.new_proxy();
        let thread = proxy.create_thread(Some("once"));
        assert_eq!(thread.status(), ThreadStatus::Created);

        proxy
            .start_thread(&thread, thread_body(|_, _| Ok(Value::Nil)), vec![])
            .expect("first start");
        let again =
            proxy.start_thread(&thread, thread_body(|_, _| Ok(Value::Nil)), vec![]);
        assert!(matches!(
            again,
            Err(RuntimeError::ThreadAlreadyStarted(_) | RuntimeError::ThreadNotAlive(_))
        ));
        ctx.join(&thread, None).expect("join");
    }

    #[test]
    fn join_with_timeout_answers_nil_while_running() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let body = thread_body(|_, _| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Value::Fixnum(1))
        });
        let thread = vm.new_proxy().spawn(None, body, vec![]).expect("spawn");

        let early = ctx.join(&thread, Some(Duration::from_millis(10))).expect("join");
        assert!(early.is_nil());
        assert!(thread.is_alive());
        assert_eq!(ctx.join(&thread, None).expect("join"), Value::Fixnum(1));
    }

    #[test]
    fn host_panic_kills_the_thread_without_hanging_joiners() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let proxy = vm.new_proxy();
        let body = thread_body(|_, _| panic!("native body fault"));
        let thread = proxy.spawn(Some("faulty"), body, vec![]).expect("spawn");

        let err = ctx.join(&thread, None).unwrap_err();
        let exception = err.exception().expect("raise");
        assert_eq!(*exception.class(), ExceptionClass::ThreadError);
        assert!(exception.message().contains("host panic"));
        assert!(proxy.thread(thread.id).is_none());
        thread.join_native();
        assert!(thread.native_finished());
    }

    #[test]
    fn main_thread_starts_at_default_priority() {
        let vm = VM::new(VMCreateInfo {
            default_priority: 3,
            ..Default::default()
        });
        let proxy = vm.new_proxy();
        let priority = vm.main_thread().priority(proxy.shared.priorities.as_ref());
        assert_eq!(priority.unwrap(), 3);
    }

    #[derive(Debug, Default)]
    struct RecordingPriority {
        applied: parking_lot::Mutex<Vec<i32>>,
    }

    impl PriorityFacility for RecordingPriority {
        fn native_priority(&self, _: &NativeUnit) -> i32 {
            self.applied.lock().last().copied().unwrap_or(0)
        }

        fn set_native_priority(&self, _: &NativeUnit, priority: i32) {
            self.applied.lock().push(priority);
        }
    }

    #[test]
    fn custom_facility_is_told_about_the_main_thread() {
        let facility = Arc::new(RecordingPriority::default());
        let vm = VM::with_priority_facility(
            VMCreateInfo {
                default_priority: -3,
                ..Default::default()
            },
            facility.clone(),
        );
        assert_eq!(*facility.applied.lock(), vec![1]);
        assert_eq!(vm.main_thread().priority(facility.as_ref()).unwrap(), -3);
    }

    #[test]
    fn thread_list_includes_main_first() {
        let vm = VM::new(VMCreateInfo {
            main_thread_name: "root".into(),
            ..Default::default()
        });
        let proxy = vm.new_proxy();
        let pending = proxy.create_thread(None);

        let threads = proxy.threads();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].name(), "root");
        assert_eq!(threads[1].id, pending.id);
        assert_eq!(pending.name(), format!("thread-{}", pending.id));
    }
}
