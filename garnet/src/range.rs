use std::fmt;

use crate::{
    Closure, ElementOutcome, Outcome, RuntimeError, SourceLocation,
    ThreadContext, Unwind, Value, yield_element,
};

const PREALLOCATE_LIMIT: usize = 4096;

/// Integer range `begin..end` / `begin...end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixnumRange {
    pub begin: i64,
    pub end: i64,
    pub exclude_end: bool,
}

impl FixnumRange {
    pub const fn new(begin: i64, end: i64, exclude_end: bool) -> Self {
        Self {
            begin,
            end,
            exclude_end,
        }
    }

    pub const fn inclusive(begin: i64, end: i64) -> Self {
        Self::new(begin, end, false)
    }

    pub const fn exclusive(begin: i64, end: i64) -> Self {
        Self::new(begin, end, true)
    }

    /// First value not in the range. Widened so `..i64::MAX` terminates.
    pub const fn exclusive_end(&self) -> i128 {
        if self.exclude_end {
            self.end as i128
        } else {
            self.end as i128 + 1
        }
    }

    pub fn len(&self) -> usize {
        let len = (self.exclusive_end() - self.begin as i128).max(0);
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> i64 {
        self.begin
    }

    pub fn last(&self) -> i64 {
        self.end
    }

    pub fn contains(&self, n: i64) -> bool {
        n >= self.begin && (n as i128) < self.exclusive_end()
    }

    /// `include?` / `===`: only integers can be members.
    pub fn includes(&self, value: &Value) -> bool {
        value.as_fixnum().is_some_and(|n| self.contains(n))
    }

    pub fn to_vec(&self) -> Vec<Value> {
        let end = self.exclusive_end();
        let mut out = Vec::with_capacity(self.len().min(PREALLOCATE_LIMIT));
        let mut n = self.begin as i128;
        while n < end {
            out.push(Value::Fixnum(n as i64));
            n += 1;
        }
        out
    }

    /// Yields every element. Returns the range, or the payload of a break.
    pub fn each(&self, ctx: &mut ThreadContext, block: &Closure) -> Outcome {
        let broke = self.iterate(ctx, block, 1, "Range#each", |_| {})?;
        Ok(broke.unwrap_or(Value::Range(*self)))
    }

    /// Collects one result per completed element. `next` contributes no
    /// element; `break` replaces the whole result with its payload.
    pub fn collect(&self, ctx: &mut ThreadContext, block: &Closure) -> Outcome {
        let mut results = Vec::with_capacity(self.len().min(PREALLOCATE_LIMIT));
        let broke = self.iterate(ctx, block, 1, "Range#collect", |value| {
            results.push(value)
        })?;
        Ok(broke.unwrap_or(Value::Array(results)))
    }

    /// Yields every `step`-th element. A non-positive step never reaches
    /// the end and is rejected up front.
    pub fn step(
        &self,
        ctx: &mut ThreadContext,
        step: i64,
        block: &Closure,
    ) -> Outcome {
        if step < 0 {
            return Err(ctx.raise(RuntimeError::NegativeStep));
        }
        if step == 0 {
            return Err(ctx.raise(RuntimeError::ZeroStep));
        }
        let broke = self.iterate(ctx, block, step, "Range#step", |_| {})?;
        Ok(broke.unwrap_or(Value::Range(*self)))
    }

    /// Shared loop of the iteration constructs. `Some(payload)` means a
    /// break ended it early.
    fn iterate<F>(
        &self,
        ctx: &mut ThreadContext,
        block: &Closure,
        step: i64,
        label: &'static str,
        mut on_completed: F,
    ) -> Result<Option<Value>, Unwind>
    where
        F: FnMut(Value),
    {
        debug_assert!(step > 0);
        let exclusive_end = self.exclusive_end();
        let step = step as i128;

        ctx.push_frame(SourceLocation::native(label));
        let mut visited = 0u64;
        let mut n = self.begin as i128;
        let result = loop {
            if n >= exclusive_end {
                break Ok(None);
            }
            visited += 1;
            // n < exclusive_end <= i64::MAX + 1
            match yield_element(ctx, block, Value::Fixnum(n as i64)) {
                Ok(ElementOutcome::Completed(value)) => on_completed(value),
                Ok(ElementOutcome::Skipped) => {}
                Ok(ElementOutcome::Broke(value)) => break Ok(Some(value)),
                Err(unwind) => break Err(unwind),
            }
            if let Err(unwind) = ctx.checkpoint() {
                break Err(unwind);
            }
            n += step;
        };
        ctx.pop_frame();
        ctx.report_loop_count(label, visited);
        result
    }
}

impl fmt::Display for FixnumRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dots = if self.exclude_end { "..." } else { ".." };
        write!(f, "{}{}{}", self.begin, dots, self.end)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        Binding, BlockKind, ControlSignal, ExceptionClass, GuestException,
        Signature, VM, VMCreateInfo, native_body,
    };

    fn context() -> ThreadContext {
        VM::new(VMCreateInfo::default()).main_context()
    }

    /// Block recording every argument it sees and answering with `f(n)`.
    fn recording(
        f: impl Fn(i64, usize) -> Outcome + Send + Sync + 'static,
    ) -> (Closure, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let body = native_body(Signature::ONE_REQUIRED, move |_, _, args, _| {
            let n = args[0].as_fixnum().expect("fixnum element");
            let calls = {
                let mut seen = seen2.lock();
                seen.push(n);
                seen.len()
            };
            f(n, calls)
        });
        let binding = Binding::toplevel(
            Value::Nil,
            SourceLocation::new("range_test.rb", 1, "block"),
        );
        (Closure::capture(binding, body, BlockKind::Proc), seen)
    }

    fn double() -> (Closure, Arc<Mutex<Vec<i64>>>) {
        recording(|n, _| Ok(Value::Fixnum(n * 2)))
    }

    #[test]
    fn each_visits_inclusive_and_exclusive_ranges() {
        let mut ctx = context();
        for (range, expected) in [
            (FixnumRange::inclusive(1, 4), vec![1, 2, 3, 4]),
            (FixnumRange::exclusive(1, 4), vec![1, 2, 3]),
            (FixnumRange::exclusive(-2, 1), vec![-2, -1, 0]),
            (FixnumRange::inclusive(3, 2), vec![]),
            (FixnumRange::exclusive(3, 3), vec![]),
        ] {
            let (block, seen) = double();
            let result = range.each(&mut ctx, &block).unwrap();
            assert_eq!(result, Value::Range(range));
            assert_eq!(*seen.lock(), expected, "range {range}");
        }
    }

    #[test]
    fn collect_length_and_elements_match_progression() {
        let mut ctx = context();
        for (a, b) in [(0, 0), (0, 5), (-3, 4), (10, 2)] {
            let (block, _) = double();
            let range = FixnumRange::exclusive(a, b);
            let result = range.collect(&mut ctx, &block).unwrap();
            let Value::Array(items) = result else {
                panic!("collect must answer an array");
            };
            assert_eq!(items.len(), (b - a).max(0) as usize);
            for (i, item) in items.iter().enumerate() {
                assert_eq!(*item, Value::Fixnum((a + i as i64) * 2));
            }
        }
    }

    #[test]
    fn step_visits_arithmetic_progression() {
        let mut ctx = context();
        let (block, seen) = double();
        let range = FixnumRange::inclusive(1, 10);
        assert_eq!(range.step(&mut ctx, 3, &block).unwrap(), Value::Range(range));
        assert_eq!(*seen.lock(), vec![1, 4, 7, 10]);

        let (block, seen) = double();
        FixnumRange::exclusive(1, 10).step(&mut ctx, 3, &block).unwrap();
        assert_eq!(*seen.lock(), vec![1, 4, 7]);
    }

    #[test]
    fn step_rejects_non_positive_steps_before_iterating() {
        let mut ctx = context();
        for (step, message) in [(0, "step can't be 0"), (-1, "step can't be negative")] {
            let (block, seen) = double();
            let err = FixnumRange::inclusive(1, 5)
                .step(&mut ctx, step, &block)
                .unwrap_err();
            let exception = err.exception().expect("raise expected");
            assert_eq!(*exception.class(), ExceptionClass::ArgumentError);
            assert_eq!(exception.message(), message);
            assert!(seen.lock().is_empty());
        }
    }

    #[test]
    fn break_stops_iteration_and_replaces_result() {
        let mut ctx = context();
        let (block, seen) = recording(|n, _| {
            if n == 3 {
                Err(ControlSignal::Break(Value::symbol("stopped")).into())
            } else {
                Ok(Value::Nil)
            }
        });
        let range = FixnumRange::inclusive(1, 100);
        assert_eq!(range.each(&mut ctx, &block).unwrap(), Value::symbol("stopped"));
        assert_eq!(*seen.lock(), vec![1, 2, 3]);

        let (block, seen) = recording(|n, _| {
            if n == 2 {
                Err(ControlSignal::Break(Value::Fixnum(-1)).into())
            } else {
                Ok(Value::Fixnum(n))
            }
        });
        assert_eq!(range.collect(&mut ctx, &block).unwrap(), Value::Fixnum(-1));
        assert_eq!(seen.lock().len(), 2);

        let (block, seen) = recording(|_, _| Err(ControlSignal::Break(Value::Nil).into()));
        assert_eq!(range.step(&mut ctx, 5, &block).unwrap(), Value::Nil);
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn next_skips_the_element_in_collect() {
        let mut ctx = context();
        let (block, seen) = recording(|n, _| {
            if n % 2 == 0 {
                Err(ControlSignal::Next.into())
            } else {
                Ok(Value::Fixnum(n * 10))
            }
        });
        let result = FixnumRange::inclusive(1, 5).collect(&mut ctx, &block).unwrap();
        assert_eq!(
            result,
            Value::Array(vec![Value::Fixnum(10), Value::Fixnum(30), Value::Fixnum(50)])
        );
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn redo_reruns_same_element_without_advancing() {
        let mut ctx = context();
        let redos = Arc::new(AtomicUsize::new(0));
        let redos2 = redos.clone();
        let (block, seen) = recording(move |n, _| {
            if n == 2 && redos2.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ControlSignal::Redo.into())
            } else {
                Ok(Value::Fixnum(n))
            }
        });
        let result = FixnumRange::exclusive(1, 4).collect(&mut ctx, &block).unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 2, 2, 3]);
        assert_eq!(
            result,
            Value::Array(vec![Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)])
        );
        assert_eq!(ctx.loop_count(), 3, "redo must not count as a visit");
    }

    #[test]
    fn exceptions_propagate_out_of_iteration() {
        let mut ctx = context();
        let (block, seen) = recording(|n, _| {
            if n == 2 {
                Err(Unwind::Raise(GuestException::new(
                    ExceptionClass::RuntimeError,
                    "boom",
                )))
            } else {
                Ok(Value::Nil)
            }
        });
        let err = FixnumRange::inclusive(1, 5).each(&mut ctx, &block).unwrap_err();
        assert_eq!(err.exception().expect("raise").message(), "boom");
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn inclusive_range_ending_at_max_terminates() {
        let mut ctx = context();
        let (block, seen) = recording(|n, _| Ok(Value::Fixnum(n)));
        let range = FixnumRange::inclusive(i64::MAX - 2, i64::MAX);
        range.each(&mut ctx, &block).unwrap();
        assert_eq!(seen.lock().len(), 3);
        let Value::Array(items) = range.collect(&mut ctx, &block).unwrap() else {
            panic!("array expected");
        };
        assert_eq!(items.last(), Some(&Value::Fixnum(i64::MAX)));
    }

    #[test]
    fn queries_and_conversions() {
        let range = FixnumRange::exclusive(2, 5);
        assert_eq!(range.first(), 2);
        assert_eq!(range.last(), 5);
        assert!(range.includes(&Value::Fixnum(4)));
        assert!(!range.includes(&Value::Fixnum(5)));
        assert!(!range.includes(&Value::string("3")));
        assert!(FixnumRange::inclusive(2, 5).includes(&Value::Fixnum(5)));
        assert_eq!(range.to_vec(), vec![Value::Fixnum(2), Value::Fixnum(3), Value::Fixnum(4)]);
        assert_eq!(range.to_string(), "2...5");
        assert_eq!(FixnumRange::inclusive(1, 3).to_string(), "1..3");
        assert!(FixnumRange::exclusive(1, 1).is_empty());
    }
}
