//! Blocks: a callable body plus the [`Binding`] it was captured in.
//!
//! A [`Closure`] is a cheap handle. Everything expensive (the binding, the
//! body, the escape cell) sits behind an `Arc`, so cloning the handle and
//! the explicit `clone_*` operations only differ in which of those they
//! share.

use std::{
    borrow::Cow,
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    Binding, ObjectRef, Outcome, RuntimeError, SourceLocation, ThreadContext,
    Unwind, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    #[default]
    Normal,
    Proc,
    Lambda,
    ThreadBody,
}

impl BlockKind {
    pub const fn checks_arity(self) -> bool {
        matches!(self, BlockKind::Lambda)
    }
}

/// How a block is being reused by an `eval`-family call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalType {
    #[default]
    None,
    InstanceEval,
    ModuleEval,
    BindingEval,
}

/// Positional parameter shape of a block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    pub required: usize,
    pub optional: usize,
    pub rest: bool,
}

impl Signature {
    pub const NO_ARGUMENTS: Signature = Signature::new(0, 0, false);
    pub const ONE_REQUIRED: Signature = Signature::new(1, 0, false);
    pub const OPTIONAL_REST: Signature = Signature::new(0, 0, true);

    pub const fn new(required: usize, optional: usize, rest: bool) -> Self {
        Self {
            required,
            optional,
            rest,
        }
    }

    /// Guest-visible arity: `n` for fixed arity, `-(required + 1)` otherwise.
    pub fn arity(&self) -> i64 {
        let required = self.required as i64;
        if self.optional > 0 || self.rest {
            -(required + 1)
        } else {
            required
        }
    }

    pub fn max(&self) -> Option<usize> {
        (!self.rest).then_some(self.required + self.optional)
    }

    pub fn parameter_count(&self) -> usize {
        self.required + self.optional
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.required && self.max().is_none_or(|max| count <= max)
    }

    fn describe(&self) -> String {
        match self.max() {
            None => format!("{}+", self.required),
            Some(max) if max == self.required => max.to_string(),
            Some(max) => format!("{}..{}", self.required, max),
        }
    }
}

/// Executable code of a block. Implemented by the evaluation engine.
pub trait BlockBody: Send + Sync {
    fn signature(&self) -> Signature;

    /// Runs the body with already-adapted `args`. `self` and locals come
    /// from `block.binding()`.
    fn call(
        &self,
        ctx: &mut ThreadContext,
        block: &Closure,
        args: &[Value],
        block_arg: &Closure,
    ) -> Outcome;
}

/// A body backed by a Rust closure.
pub struct NativeBody<F> {
    signature: Signature,
    f: F,
}

impl<F> NativeBody<F>
where
    F: Fn(&mut ThreadContext, &Closure, &[Value], &Closure) -> Outcome
        + Send
        + Sync,
{
    pub fn new(signature: Signature, f: F) -> Self {
        Self { signature, f }
    }
}

impl<F> BlockBody for NativeBody<F>
where
    F: Fn(&mut ThreadContext, &Closure, &[Value], &Closure) -> Outcome
        + Send
        + Sync,
{
    fn signature(&self) -> Signature {
        self.signature
    }

    fn call(
        &self,
        ctx: &mut ThreadContext,
        block: &Closure,
        args: &[Value],
        block_arg: &Closure,
    ) -> Outcome {
        (self.f)(ctx, block, args, block_arg)
    }
}

pub fn native_body<F>(signature: Signature, f: F) -> Arc<dyn BlockBody>
where
    F: Fn(&mut ThreadContext, &Closure, &[Value], &Closure) -> Outcome
        + Send
        + Sync
        + 'static,
{
    Arc::new(NativeBody::new(signature, f))
}

struct NullBody;

impl BlockBody for NullBody {
    fn signature(&self) -> Signature {
        Signature::OPTIONAL_REST
    }

    fn call(
        &self,
        ctx: &mut ThreadContext,
        _block: &Closure,
        _args: &[Value],
        _block_arg: &Closure,
    ) -> Outcome {
        Err(ctx.raise(RuntimeError::NoBlockGiven))
    }
}

static NULL_BLOCK: OnceLock<Closure> = OnceLock::new();

#[derive(Clone)]
pub struct Closure {
    binding: Arc<Binding>,
    body: Arc<dyn BlockBody>,
    kind: BlockKind,
    eval_type: EvalType,
    escape: Arc<AtomicBool>,
    proc_object: Option<ObjectRef>,
}

impl Closure {
    pub fn capture(
        binding: Arc<Binding>,
        body: Arc<dyn BlockBody>,
        kind: BlockKind,
    ) -> Self {
        Self {
            binding,
            body,
            kind,
            eval_type: EvalType::None,
            escape: Arc::new(AtomicBool::new(false)),
            proc_object: None,
        }
    }

    /// The "no block" sentinel.
    pub fn null() -> Closure {
        Self::null_ref().clone()
    }

    fn null_ref() -> &'static Closure {
        NULL_BLOCK.get_or_init(|| {
            Closure::capture(
                Binding::toplevel(Value::Nil, SourceLocation::native("<no block>")),
                Arc::new(NullBody),
                BlockKind::Normal,
            )
        })
    }

    pub fn is_given(&self) -> bool {
        !Arc::ptr_eq(&self.body, &Self::null_ref().body)
    }

    pub fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    pub fn body(&self) -> &Arc<dyn BlockBody> {
        &self.body
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn eval_type(&self) -> EvalType {
        self.eval_type
    }

    pub fn signature(&self) -> Signature {
        self.body.signature()
    }

    pub fn with_kind(mut self, kind: BlockKind) -> Self {
        self.kind = kind;
        self
    }

    /// Invokes the body. The call boundary is a safepoint; it is polled
    /// before the block's frame is pushed.
    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        args: &[Value],
        block_arg: &Closure,
    ) -> Outcome {
        let args = self.adapt_args(ctx, args)?;
        ctx.checkpoint()?;
        ctx.push_frame(self.binding.location().clone());
        let result = self.body.call(ctx, self, &args, block_arg);
        ctx.pop_frame();
        result
    }

    /// Passes `value` as one positional argument. Non-lambda blocks taking
    /// several parameters receive an array spread over them.
    pub fn yield_single(&self, ctx: &mut ThreadContext, value: Value) -> Outcome {
        if self.spreads_single_array() {
            if let Value::Array(items) = &value {
                return self.call(ctx, items, &Closure::null());
            }
        }
        self.call(ctx, &[value], &Closure::null())
    }

    /// Always spreads an array argument over the parameters.
    pub fn yield_array(&self, ctx: &mut ThreadContext, value: Value) -> Outcome {
        match value {
            Value::Array(items) => self.call(ctx, &items, &Closure::null()),
            other => self.call(ctx, &[other], &Closure::null()),
        }
    }

    fn spreads_single_array(&self) -> bool {
        let signature = self.signature();
        !self.kind.checks_arity()
            && (signature.parameter_count() > 1
                || (signature.rest && signature.required > 0))
    }

    fn adapt_args<'a>(
        &self,
        ctx: &ThreadContext,
        args: &'a [Value],
    ) -> Result<Cow<'a, [Value]>, Unwind> {
        let signature = self.signature();
        if signature.accepts(args.len()) {
            return Ok(Cow::Borrowed(args));
        }
        if self.kind.checks_arity() {
            return Err(ctx.raise(RuntimeError::Arity {
                given: args.len(),
                expected: signature.describe(),
            }));
        }

        let mut adapted = args.to_vec();
        if let Some(max) = signature.max() {
            adapted.truncate(max);
        }
        if adapted.len() < signature.required {
            adapted.resize(signature.required, Value::Nil);
        }
        Ok(Cow::Owned(adapted))
    }

    /// New block over the same binding; the frame stays shared.
    pub fn clone_shallow(&self) -> Closure {
        Closure {
            binding: Arc::clone(&self.binding),
            body: Arc::clone(&self.body),
            kind: self.kind,
            eval_type: self.eval_type,
            escape: Arc::clone(&self.escape),
            proc_object: None,
        }
    }

    /// New block over a duplicated binding; writes to locals on either
    /// side are invisible to the other.
    pub fn clone_with_fresh_frame(&self) -> Closure {
        Closure {
            binding: self.binding.duplicate(),
            ..self.clone_shallow()
        }
    }

    /// New block running against `self_value`, still sharing locals.
    pub fn clone_for_eval(&self, self_value: Value, eval_type: EvalType) -> Closure {
        Closure {
            binding: self.binding.rebind(self_value),
            eval_type,
            ..self.clone_shallow()
        }
    }

    pub fn mark_escaped(&self) {
        self.escape.store(true, Ordering::Release);
    }

    pub fn has_escaped(&self) -> bool {
        self.escape.load(Ordering::Acquire)
    }

    pub fn proc_object(&self) -> Option<&ObjectRef> {
        self.proc_object.as_ref()
    }

    pub fn set_proc_object(&mut self, proc_object: ObjectRef) {
        self.proc_object = Some(proc_object);
    }
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.body, &other.body) && *self.binding == *other.binding
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_given() {
            return write!(f, "Closure(<no block>)");
        }
        f.debug_struct("Closure")
            .field("kind", &self.kind)
            .field("signature", &self.signature())
            .field("location", self.binding.location())
            .field("escaped", &self.has_escaped())
            .finish()
    }
}
