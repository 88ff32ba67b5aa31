use crate::{Closure, Outcome, RuntimeError, ThreadContext, Unwind, Value};

/// Non-local jumps out of a block body, consumed by the iteration
/// construct that yielded to the block.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    Break(Value),
    Next,
    Redo,
}

impl ControlSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ControlSignal::Break(_) => "break",
            ControlSignal::Next => "next",
            ControlSignal::Redo => "redo",
        }
    }

    fn orphan_message(&self) -> &'static str {
        match self {
            ControlSignal::Break(_) => "break from proc-closure",
            ControlSignal::Next => "next used outside of block",
            ControlSignal::Redo => "redo used outside of block",
        }
    }
}

/// What a single yield ended with.
#[derive(Debug)]
pub enum StepOutcome {
    Completed(Value),
    Break(Value),
    Next,
    Redo,
}

impl StepOutcome {
    /// Splits signals from exceptions; exceptions keep unwinding.
    pub fn classify(outcome: Outcome) -> Result<StepOutcome, Unwind> {
        match outcome {
            Ok(value) => Ok(StepOutcome::Completed(value)),
            Err(Unwind::Signal(ControlSignal::Break(value))) => {
                Ok(StepOutcome::Break(value))
            }
            Err(Unwind::Signal(ControlSignal::Next)) => Ok(StepOutcome::Next),
            Err(Unwind::Signal(ControlSignal::Redo)) => Ok(StepOutcome::Redo),
            Err(raise @ Unwind::Raise(_)) => Err(raise),
        }
    }
}

/// Result of one element of an iteration once redos are exhausted.
#[derive(Debug)]
pub enum ElementOutcome {
    Completed(Value),
    Skipped,
    Broke(Value),
}

/// Yields `element` to `block`, re-running it for as long as it redoes.
/// Redo counts as a back-edge, so the thread checkpoints before each rerun.
pub fn yield_element(
    ctx: &mut ThreadContext,
    block: &Closure,
    element: Value,
) -> Result<ElementOutcome, Unwind> {
    loop {
        let outcome = block.yield_single(ctx, element.clone());
        match StepOutcome::classify(outcome)? {
            StepOutcome::Completed(value) => {
                return Ok(ElementOutcome::Completed(value));
            }
            StepOutcome::Break(value) => return Ok(ElementOutcome::Broke(value)),
            StepOutcome::Next => return Ok(ElementOutcome::Skipped),
            StepOutcome::Redo => ctx.checkpoint()?,
        }
    }
}

/// Turns a signal that reached a boundary with no owning iteration into a
/// `LocalJumpError`.
pub fn escape_orphan(ctx: &mut ThreadContext, outcome: Outcome) -> Outcome {
    match outcome {
        Err(Unwind::Signal(signal)) => {
            log::debug!(
                "orphan {} signal on thread {}",
                signal.name(),
                ctx.thread_id()
            );
            Err(ctx.raise(RuntimeError::OrphanSignal(signal.orphan_message())))
        }
        other => other,
    }
}
