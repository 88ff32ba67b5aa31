use std::{fmt, io, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{ControlSignal, SourceLocation, ThreadId, Value};

/// Result of running guest code: a value, or something unwinding.
pub type Outcome = Result<Value, Unwind>;

pub type Exception = Arc<GuestException>;

/// Faults the runtime itself detects on behalf of the guest program.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("wrong number of arguments (given {given}, expected {expected})")]
    Arity { given: usize, expected: String },
    #[error("no block given (yield)")]
    NoBlockGiven,
    #[error("{0}")]
    OrphanSignal(&'static str),
    #[error("step can't be negative")]
    NegativeStep,
    #[error("step can't be 0")]
    ZeroStep,
    #[error("thread {0} not alive")]
    ThreadNotAlive(ThreadId),
    #[error("thread {0} already started")]
    ThreadAlreadyStarted(ThreadId),
    #[error(
        "timed out after {timeout:?} waiting for thread {thread} to reach a safepoint"
    )]
    SafepointTimeout { thread: ThreadId, timeout: Duration },
    #[error("no implicit conversion of {got} into {expected}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error(
        "wrong number of arguments for `{name}' (given {given}, expected {expected})"
    )]
    PrimitiveArity {
        name: &'static str,
        given: usize,
        expected: usize,
    },
    #[error("undefined primitive `{0}'")]
    UnknownPrimitive(String),
    #[error("can't create thread: {0}")]
    ThreadSpawn(#[from] io::Error),
}

impl RuntimeError {
    pub fn exception_class(&self) -> ExceptionClass {
        match self {
            RuntimeError::Arity { .. }
            | RuntimeError::NegativeStep
            | RuntimeError::ZeroStep
            | RuntimeError::PrimitiveArity { .. } => {
                ExceptionClass::ArgumentError
            }
            RuntimeError::NoBlockGiven | RuntimeError::OrphanSignal(_) => {
                ExceptionClass::LocalJumpError
            }
            RuntimeError::ThreadNotAlive(_)
            | RuntimeError::ThreadAlreadyStarted(_)
            | RuntimeError::SafepointTimeout { .. }
            | RuntimeError::ThreadSpawn(_) => ExceptionClass::ThreadError,
            RuntimeError::TypeMismatch { .. } => ExceptionClass::TypeError,
            RuntimeError::UnknownPrimitive(_) => ExceptionClass::NoMethodError,
        }
    }

    /// Builds the guest exception without a backtrace. Prefer
    /// [`crate::ThreadContext::raise`], which captures one.
    pub fn into_exception(self) -> Exception {
        GuestException::new(self.exception_class(), self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionClass {
    StandardError,
    RuntimeError,
    ArgumentError,
    TypeError,
    LocalJumpError,
    ThreadError,
    NoMethodError,
    Named(Arc<str>),
}

impl ExceptionClass {
    pub fn named(name: &str) -> Self {
        ExceptionClass::Named(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        match self {
            ExceptionClass::StandardError => "StandardError",
            ExceptionClass::RuntimeError => "RuntimeError",
            ExceptionClass::ArgumentError => "ArgumentError",
            ExceptionClass::TypeError => "TypeError",
            ExceptionClass::LocalJumpError => "LocalJumpError",
            ExceptionClass::ThreadError => "ThreadError",
            ExceptionClass::NoMethodError => "NoMethodError",
            ExceptionClass::Named(name) => name,
        }
    }
}

/// Captured call stack of one thread, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    pub thread: ThreadId,
    pub frames: Vec<SourceLocation>,
}

impl Backtrace {
    pub fn innermost(&self) -> Option<&SourceLocation> {
        self.frames.first()
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "thread {}:", self.thread)?;
        for frame in &self.frames {
            writeln!(f, "\tfrom {frame}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GuestException {
    class: ExceptionClass,
    message: String,
    backtrace: Mutex<Option<Backtrace>>,
}

impl GuestException {
    pub fn new(class: ExceptionClass, message: impl Into<String>) -> Exception {
        Arc::new(Self {
            class,
            message: message.into(),
            backtrace: Mutex::new(None),
        })
    }

    pub fn class(&self) -> &ExceptionClass {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> Option<Backtrace> {
        self.backtrace.lock().clone()
    }

    pub fn has_backtrace(&self) -> bool {
        self.backtrace.lock().is_some()
    }

    pub fn attach_backtrace(&self, backtrace: Backtrace) {
        *self.backtrace.lock() = Some(backtrace);
    }

    /// Keeps an existing backtrace; returns whether `backtrace` was stored.
    pub fn attach_backtrace_if_absent(&self, backtrace: Backtrace) -> bool {
        let mut slot = self.backtrace.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(backtrace);
        true
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class.name())
    }
}

/// Anything that leaves a block body other than a normal return.
#[derive(Debug, Clone)]
pub enum Unwind {
    Signal(ControlSignal),
    Raise(Exception),
}

impl Unwind {
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Unwind::Raise(e) => Some(e),
            Unwind::Signal(_) => None,
        }
    }

    pub fn signal(&self) -> Option<&ControlSignal> {
        match self {
            Unwind::Signal(s) => Some(s),
            Unwind::Raise(_) => None,
        }
    }
}

impl From<RuntimeError> for Unwind {
    fn from(err: RuntimeError) -> Self {
        Unwind::Raise(err.into_exception())
    }
}

impl From<ControlSignal> for Unwind {
    fn from(signal: ControlSignal) -> Self {
        Unwind::Signal(signal)
    }
}

impl fmt::Display for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unwind::Signal(s) => write!(f, "unhandled {} signal", s.name()),
            Unwind::Raise(e) => write!(f, "{e}"),
        }
    }
}
