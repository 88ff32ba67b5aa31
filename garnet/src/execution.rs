use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    Backtrace, Closure, Exception, ExceptionClass, GuestException,
    GuestThread, Outcome, RuntimeError, SourceLocation, ThreadId, Unwind,
    VMProxy, Value, escape_orphan,
};

/// Per-thread execution state. Only ever touched by the thread it
/// belongs to; other threads reach it through safepoint actions.
pub struct ThreadContext {
    pub vm: VMProxy,
    thread: Arc<GuestThread>,
    call_stack: Vec<SourceLocation>,
    loop_count: u64,
}

impl ThreadContext {
    pub fn new(vm: VMProxy, thread: Arc<GuestThread>) -> Self {
        Self {
            vm,
            thread,
            call_stack: Vec::with_capacity(32),
            loop_count: 0,
        }
    }

    pub fn thread(&self) -> &Arc<GuestThread> {
        &self.thread
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.id
    }

    pub fn push_frame(&mut self, location: SourceLocation) {
        self.call_stack.push(location);
    }

    pub fn pop_frame(&mut self) {
        let popped = self.call_stack.pop();
        debug_assert!(popped.is_some(), "call stack underflow");
    }

    pub fn depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Innermost frame, or the thread's entry point when nothing is on
    /// the stack.
    pub fn current_site(&self) -> SourceLocation {
        self.call_stack.last().cloned().unwrap_or_else(|| {
            SourceLocation::native(&format!("<thread {}>", self.thread.name()))
        })
    }

    pub fn backtrace(&self) -> Backtrace {
        let mut frames: Vec<SourceLocation> =
            self.call_stack.iter().rev().cloned().collect();
        if frames.is_empty() {
            frames.push(self.current_site());
        }
        Backtrace {
            thread: self.thread.id,
            frames,
        }
    }

    /// Raises `error` as a guest exception rooted at the current stack.
    pub fn raise(&self, error: RuntimeError) -> Unwind {
        self.raise_exception(error.into_exception())
    }

    /// Raises an existing exception, filling in the backtrace if it has
    /// none yet.
    pub fn raise_exception(&self, exception: Exception) -> Unwind {
        exception.attach_backtrace_if_absent(self.backtrace());
        Unwind::Raise(exception)
    }

    /// Runs any safepoint actions pending for this thread, inline.
    pub fn checkpoint(&mut self) -> Result<(), Unwind> {
        let shared = Arc::clone(&self.vm.shared);
        shared.safepoints.poll(self)
    }

    /// Calls `block` from a point no iteration owns, so stray signals turn
    /// into `LocalJumpError`s.
    pub fn call_toplevel(&mut self, block: &Closure, args: &[Value]) -> Outcome {
        let outcome = block.call(self, args, &Closure::null());
        escape_orphan(self, outcome)
    }

    /// Waits for `target` to finish while still servicing safepoints.
    /// Answers its value, re-raises its exception, or `nil` on timeout.
    pub fn join(
        &mut self,
        target: &Arc<GuestThread>,
        timeout: Option<Duration>,
    ) -> Outcome {
        if target.id == self.thread_id() {
            return Err(self.raise_exception(GuestException::new(
                ExceptionClass::ThreadError,
                "Target thread must not be current thread",
            )));
        }
        let slice = self.vm.shared.info.safepoint_poll_interval;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if target.wait_dead(slice) {
                break;
            }
            self.checkpoint()?;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Value::Nil);
            }
        }
        match target.result() {
            Some(Ok(value)) => Ok(value),
            Some(Err(exception)) => Err(Unwind::Raise(exception)),
            None => Ok(Value::Nil),
        }
    }

    /// Records how many elements a loop visited (diagnostics only).
    pub fn report_loop_count(&mut self, label: &str, count: u64) {
        self.loop_count += count;
        log::trace!(
            "{label} visited {count} elements on thread {}",
            self.thread.id
        );
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VM, VMCreateInfo};

    #[test]
    fn backtrace_lists_innermost_frame_first() {
        let mut ctx = VM::new(VMCreateInfo::default()).main_context();
        ctx.push_frame(SourceLocation::new("a.rb", 1, "outer"));
        ctx.push_frame(SourceLocation::new("a.rb", 7, "inner"));

        let backtrace = ctx.backtrace();
        assert_eq!(backtrace.thread, ctx.thread_id());
        let labels: Vec<&str> =
            backtrace.frames.iter().map(|f| &*f.label).collect();
        assert_eq!(labels, vec!["inner", "outer"]);

        ctx.pop_frame();
        ctx.pop_frame();
        assert_eq!(ctx.backtrace().frames.len(), 1, "entry frame only");
    }

    #[test]
    fn raise_exception_keeps_an_existing_backtrace() {
        let mut ctx = VM::new(VMCreateInfo::default()).main_context();
        ctx.push_frame(SourceLocation::new("first.rb", 1, "first"));
        let exception = GuestException::new(ExceptionClass::RuntimeError, "x");
        let _ = ctx.raise_exception(exception.clone());
        ctx.pop_frame();

        ctx.push_frame(SourceLocation::new("second.rb", 2, "second"));
        let _ = ctx.raise_exception(exception.clone());
        let backtrace = exception.backtrace().expect("backtrace attached");
        assert_eq!(&*backtrace.innermost().expect("frame").label, "first");
    }

    #[test]
    fn joining_self_is_a_thread_error() {
        let mut ctx = VM::new(VMCreateInfo::default()).main_context();
        let me = ctx.thread().clone();
        let err = ctx.join(&me, None).unwrap_err();
        assert_eq!(
            *err.exception().expect("raise").class(),
            ExceptionClass::ThreadError
        );
    }
}
