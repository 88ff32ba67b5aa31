use super::PrimitiveContext;
use crate::{
    ExceptionClass, GuestException, Outcome, RuntimeError, Value,
    raise_in_thread,
};

/// `thread_raise(exception_or_message)`
pub fn raise(ctx: &mut PrimitiveContext) -> Outcome {
    let target = ctx.receiver_thread()?;
    let exception = match ctx.input(0) {
        Value::Exception(exception) => exception.clone(),
        Value::String(message) => {
            GuestException::new(ExceptionClass::RuntimeError, &**message)
        }
        other => {
            return Err(ctx.raise(RuntimeError::TypeMismatch {
                expected: "Exception",
                got: other.type_name(),
            }));
        }
    };
    raise_in_thread(ctx.ctx, &target, exception)
}

pub fn get_priority(ctx: &mut PrimitiveContext) -> Outcome {
    let target = ctx.receiver_thread()?;
    let priorities = ctx.ctx.vm.shared.priorities.clone();
    match target.priority(priorities.as_ref()) {
        Ok(priority) => Ok(Value::Fixnum(i64::from(priority))),
        Err(err) => Err(ctx.raise(err)),
    }
}

pub fn set_priority(ctx: &mut PrimitiveContext) -> Outcome {
    let target = ctx.receiver_thread()?;
    let requested = ctx.fixnum_input(0)?;
    let priorities = ctx.ctx.vm.shared.priorities.clone();
    match target.set_priority(priorities.as_ref(), requested) {
        Ok(priority) => Ok(Value::Fixnum(i64::from(priority))),
        Err(err) => Err(ctx.raise(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use crate::{
        Binding, BlockKind, Closure, FixnumRange, Signature,
        SourceLocation, ThreadContext, VM, VMCreateInfo, native_body,
        primitives::send_primitive,
    };

    use super::*;

    fn block<F>(signature: Signature, f: F) -> Closure
    where
        F: Fn(&mut ThreadContext, &Closure, &[Value], &Closure) -> Outcome
            + Send
            + Sync
            + 'static,
    {
        let binding =
            Binding::toplevel(Value::Nil, SourceLocation::new("t.rb", 1, "block"));
        Closure::capture(binding, native_body(signature, f), BlockKind::Proc)
    }

    #[test]
    fn priority_primitives_clamp_and_fail_on_dead_threads() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let none = Closure::null();
        let pending = Value::Thread(vm.new_proxy().create_thread(None));

        let set = send_primitive(&mut ctx, "thread_set_priority", &pending, &[Value::Fixnum(10)], &none)
            .expect("set");
        assert_eq!(set, Value::Fixnum(3));
        let get = send_primitive(&mut ctx, "thread_get_priority", &pending, &[], &none)
            .expect("get");
        assert_eq!(get, Value::Fixnum(3));

        let body = block(Signature::OPTIONAL_REST, |_, _, _, _| Ok(Value::Nil));
        let finished = vm.new_proxy().spawn(None, body, vec![]).expect("spawn");
        ctx.join(&finished, None).expect("join");

        let err = send_primitive(&mut ctx, "thread_get_priority", &Value::Thread(finished.clone()), &[], &none)
            .unwrap_err();
        let exception = err.exception().expect("raise");
        assert_eq!(*exception.class(), ExceptionClass::ThreadError);
        assert_eq!(exception.message(), format!("thread {} not alive", finished.id));
    }

    #[test]
    fn thread_raise_wraps_messages_in_runtime_error() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let started = Arc::new(AtomicBool::new(false));
        let body = {
            let started = started.clone();
            block(Signature::OPTIONAL_REST, move |ctx, _, _, _| {
                let started = started.clone();
                let each = block(Signature::ONE_REQUIRED, move |_, _, _, _| {
                    started.store(true, Ordering::SeqCst);
                    Ok(Value::Nil)
                });
                FixnumRange::inclusive(0, i64::MAX).each(ctx, &each)
            })
        };
        let target = vm.new_proxy().spawn(Some("looping"), body, vec![]).expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !started.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "worker never started");
            thread::sleep(Duration::from_millis(1));
        }

        let answer = send_primitive(
            &mut ctx,
            "thread_raise",
            &Value::Thread(target.clone()),
            &[Value::string("wake up")],
            &Closure::null(),
        )
        .expect("raise delivered");
        assert!(answer.is_nil());

        let err = ctx.join(&target, None).unwrap_err();
        let exception = err.exception().expect("raise");
        assert_eq!(*exception.class(), ExceptionClass::RuntimeError);
        assert_eq!(exception.message(), "wake up");
        assert_eq!(exception.backtrace().expect("backtrace").thread, target.id);
    }

    #[test]
    fn thread_raise_payloads() {
        let vm = VM::new(VMCreateInfo::default());
        let mut ctx = vm.main_context();
        let me = Value::Thread(vm.main_thread().clone());
        let err = send_primitive(&mut ctx, "thread_raise", &me, &[Value::Fixnum(1)], &Closure::null())
            .unwrap_err();
        assert_eq!(
            *err.exception().expect("raise").class(),
            ExceptionClass::TypeError
        );

        let exception = GuestException::new(ExceptionClass::named("Interrupt"), "self");
        let err = send_primitive(
            &mut ctx,
            "thread_raise",
            &me,
            &[Value::Exception(exception.clone())],
            &Closure::null(),
        )
        .unwrap_err();
        assert!(Arc::ptr_eq(err.exception().expect("raise"), &exception));
    }
}
