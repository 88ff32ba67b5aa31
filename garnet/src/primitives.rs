use std::sync::Arc;

use crate::{
    Closure, FixnumRange, GuestThread, Outcome, RuntimeError, ThreadContext,
    Unwind, Value, escape_orphan,
};

mod range;
mod thread;

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimitiveMessageIndex(usize);

pub type PrimitiveFunction = fn(&mut PrimitiveContext) -> Outcome;

// the receiver does not count as input
// e.g. `(1..3).step(2) { }` has inputs: 1
#[derive(Debug, Copy, Clone)]
pub struct PrimitiveMessage<'a> {
    pub name: &'a str,
    pub inputs: usize,
    pub needs_block: bool,
    pub ptr: PrimitiveFunction,
}

impl<'a> PrimitiveMessage<'a> {
    pub const fn new(name: &'a str, inputs: usize, ptr: PrimitiveFunction) -> Self {
        Self {
            name,
            inputs,
            needs_block: false,
            ptr,
        }
    }

    pub const fn with_block(name: &'a str, inputs: usize, ptr: PrimitiveFunction) -> Self {
        Self {
            name,
            inputs,
            needs_block: true,
            ptr,
        }
    }
}

pub struct PrimitiveContext<'ex, 'arg> {
    pub ctx: &'ex mut ThreadContext,
    pub receiver: &'arg Value,
    pub arguments: &'arg [Value],
    pub block: &'arg Closure,
}

impl PrimitiveContext<'_, '_> {
    /// Arity was checked on entry, so `index` is always in bounds.
    pub fn input(&self, index: usize) -> &Value {
        &self.arguments[index]
    }

    pub fn raise(&self, error: RuntimeError) -> Unwind {
        self.ctx.raise(error)
    }

    pub fn fixnum_input(&self, index: usize) -> Result<i64, Unwind> {
        let value = self.input(index);
        value.as_fixnum().ok_or_else(|| {
            self.raise(RuntimeError::TypeMismatch {
                expected: "Integer",
                got: value.type_name(),
            })
        })
    }

    pub fn receiver_range(&self) -> Result<FixnumRange, Unwind> {
        match self.receiver {
            Value::Range(range) => Ok(*range),
            other => Err(self.raise(RuntimeError::TypeMismatch {
                expected: "Range",
                got: other.type_name(),
            })),
        }
    }

    pub fn receiver_thread(&self) -> Result<Arc<GuestThread>, Unwind> {
        match self.receiver {
            Value::Thread(thread) => Ok(Arc::clone(thread)),
            other => Err(self.raise(RuntimeError::TypeMismatch {
                expected: "Thread",
                got: other.type_name(),
            })),
        }
    }
}

pub const PRIMITIVES: &[PrimitiveMessage] = &[
    PrimitiveMessage::with_block("each", 0, range::each),
    PrimitiveMessage::with_block("collect", 0, range::collect),
    PrimitiveMessage::with_block("map", 0, range::collect),
    PrimitiveMessage::with_block("step", 1, range::step),
    PrimitiveMessage::new("first", 0, range::first),
    PrimitiveMessage::new("last", 0, range::last),
    PrimitiveMessage::new("exclude_end?", 0, range::exclude_end),
    PrimitiveMessage::new("include?", 1, range::include),
    PrimitiveMessage::new("===", 1, range::include),
    PrimitiveMessage::new("to_a", 0, range::to_a),
    PrimitiveMessage::new("to_s", 0, range::to_s),
    PrimitiveMessage::new("thread_raise", 1, thread::raise),
    PrimitiveMessage::new("thread_get_priority", 0, thread::get_priority),
    PrimitiveMessage::new("thread_set_priority", 1, thread::set_priority),
];

pub fn primitive_index(name: &str) -> Option<PrimitiveMessageIndex> {
    PRIMITIVES
        .iter()
        .position(|p| p.name == name)
        .map(PrimitiveMessageIndex)
}

pub fn get_primitive(id: PrimitiveMessageIndex) -> PrimitiveMessage<'static> {
    debug_assert!(id.0 < PRIMITIVES.len());
    PRIMITIVES[id.0]
}

/// Looks `name` up and invokes it on `receiver`. Signals that leak out of
/// the primitive become `LocalJumpError`s here.
pub fn send_primitive(
    ctx: &mut ThreadContext,
    name: &str,
    receiver: &Value,
    arguments: &[Value],
    block: &Closure,
) -> Outcome {
    let Some(id) = primitive_index(name) else {
        return Err(ctx.raise(RuntimeError::UnknownPrimitive(name.to_owned())));
    };
    let primitive = get_primitive(id);
    if arguments.len() != primitive.inputs {
        return Err(ctx.raise(RuntimeError::PrimitiveArity {
            name: primitive.name,
            given: arguments.len(),
            expected: primitive.inputs,
        }));
    }
    if primitive.needs_block && !block.is_given() {
        return Err(ctx.raise(RuntimeError::NoBlockGiven));
    }

    log::trace!("primitive {} on {}", primitive.name, receiver.type_name());
    let outcome = {
        let mut pctx = PrimitiveContext {
            ctx: &mut *ctx,
            receiver,
            arguments,
            block,
        };
        (primitive.ptr)(&mut pctx)
    };
    escape_orphan(ctx, outcome)
}
