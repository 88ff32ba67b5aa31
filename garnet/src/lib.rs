mod binding;
mod block;
mod error;
mod execution;
mod range;
mod safepoint;
mod signal;
mod threads;
mod value;
mod vm;

pub mod primitives;

pub use binding::{
    Binding, DynamicScope, Frame, FrameRef, MethodId, SourceLocation,
    Visibility,
};
pub use block::{
    BlockBody, BlockKind, Closure, EvalType, NativeBody, Signature,
    native_body,
};
pub use error::{
    Backtrace, Exception, ExceptionClass, GuestException, Outcome,
    RuntimeError, Unwind,
};
pub use execution::ThreadContext;
pub use range::FixnumRange;
pub use safepoint::{
    Delivery, SafepointAction, SafepointManager, SafepointStats,
};
pub use signal::{
    ControlSignal, ElementOutcome, StepOutcome, escape_orphan, yield_element,
};
pub use threads::{
    AdvisoryPriority, GUEST_MAX_PRIORITY, GUEST_MIN_PRIORITY, GuestThread,
    NATIVE_MAX_PRIORITY, NATIVE_MIN_PRIORITY, NATIVE_NORM_PRIORITY,
    NativeUnit, PriorityFacility, ThreadId, ThreadStatus,
    guest_to_native_priority, native_to_guest_priority, raise_in_thread,
};
pub use value::{GuestObject, ObjectId, ObjectRef, Value};
pub use vm::{VM, VMCreateInfo, VMProxy, VMShared};
