use clap::{Parser as ClapParser, Subcommand};
use env_logger::Env;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use garnet::{
    Binding, BlockKind, Closure, ControlSignal, ExceptionClass, FixnumRange,
    GuestException, GuestThread, Outcome, RuntimeError, Signature,
    SourceLocation, ThreadContext, Unwind, VM, VMCreateInfo, Value, native_body,
    primitives::send_primitive, raise_in_thread,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Milliseconds a blocked thread waits between its own safepoint polls
    #[arg(long, default_value_t = 2)]
    poll_interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Iterate a range, printing each element and the collected squares
    Range {
        #[arg(long, allow_hyphen_values = true)]
        begin: i64,
        #[arg(long, allow_hyphen_values = true)]
        end: i64,
        #[arg(long, help = "Leave `end` out of the range")]
        exclusive: bool,
        #[arg(long, allow_hyphen_values = true)]
        step: Option<i64>,
    },
    /// Raise into a worker thread busy iterating and show where it landed
    Raise {
        #[arg(long, default_value = "interrupted")]
        message: String,
    },
    /// Set a priority on an unstarted and on a running thread
    Priority {
        #[arg(long, allow_hyphen_values = true)]
        value: i64,
    },
}

fn block<F>(label: &str, signature: Signature, f: F) -> Closure
where
    F: Fn(&mut ThreadContext, &Closure, &[Value], &Closure) -> Outcome
        + Send
        + Sync
        + 'static,
{
    let binding = Binding::toplevel(Value::Nil, SourceLocation::new("garnet", 1, label));
    Closure::capture(binding, native_body(signature, f), BlockKind::Proc)
}

/// A worker that loops over `0..=i64::MAX` until `stop` is set.
fn busy_worker(
    vm: &VM,
    started: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> Result<Arc<GuestThread>, String> {
    let body = block("worker", Signature::OPTIONAL_REST, move |ctx, _, _, _| {
        let started = started.clone();
        let stop = stop.clone();
        let each = block("spin", Signature::ONE_REQUIRED, move |_, _, _, _| {
            started.store(true, Ordering::Release);
            if stop.load(Ordering::Acquire) {
                return Err(ControlSignal::Break(Value::Nil).into());
            }
            Ok(Value::Nil)
        });
        FixnumRange::inclusive(0, i64::MAX).each(ctx, &each)
    });
    vm.new_proxy()
        .spawn(Some("worker"), body, vec![])
        .map_err(|err| err.to_string())
}

fn wait_for(flag: &AtomicBool) -> Result<(), String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            return Err("worker did not start".into());
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn describe(unwind: Unwind) -> String {
    match unwind.exception() {
        Some(exception) => match exception.backtrace() {
            Some(backtrace) => format!("{exception}\n{backtrace}"),
            None => exception.to_string(),
        },
        None => unwind.to_string(),
    }
}

fn run_range(
    vm: &VM,
    begin: i64,
    end: i64,
    exclusive: bool,
    step: Option<i64>,
) -> Result<(), String> {
    let mut ctx = vm.main_context();
    let receiver = Value::Range(FixnumRange::new(begin, end, exclusive));
    let print = block("print", Signature::ONE_REQUIRED, |_, _, args, _| {
        println!("{}", args[0]);
        Ok(Value::Nil)
    });
    let square = block("square", Signature::ONE_REQUIRED, |ctx, _, args, _| {
        match args[0].as_fixnum() {
            Some(n) => Ok(Value::Fixnum(n.wrapping_mul(n))),
            None => Err(ctx.raise(RuntimeError::TypeMismatch {
                expected: "Integer",
                got: args[0].type_name(),
            })),
        }
    });

    let visited = match step {
        Some(step) => send_primitive(&mut ctx, "step", &receiver, &[Value::Fixnum(step)], &print),
        None => send_primitive(&mut ctx, "each", &receiver, &[], &print),
    };
    visited.map_err(describe)?;

    let squares =
        send_primitive(&mut ctx, "collect", &receiver, &[], &square).map_err(describe)?;
    println!("{receiver}.collect => {squares}");
    log::info!("visited {} elements", ctx.loop_count());
    Ok(())
}

fn run_raise(vm: &VM, message: &str) -> Result<(), String> {
    let mut ctx = vm.main_context();
    let started = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let worker = busy_worker(vm, started.clone(), stop)?;
    wait_for(&started)?;

    let exception = GuestException::new(ExceptionClass::RuntimeError, message);
    raise_in_thread(&mut ctx, &worker, exception).map_err(describe)?;

    match ctx.join(&worker, None) {
        Ok(value) => println!("worker finished with {value}"),
        Err(unwind) => println!("worker died: {}", describe(unwind)),
    }
    let stats = vm.new_proxy().shared.safepoints.stats();
    println!(
        "safepoints: {} requested, {} executed, {} polls",
        stats.requests, stats.executed, stats.polls
    );
    Ok(())
}

fn run_priority(vm: &VM, value: i64) -> Result<(), String> {
    let mut ctx = vm.main_context();
    let none = Closure::null();

    let pending = Value::Thread(vm.new_proxy().create_thread(Some("pending")));
    let set = send_primitive(&mut ctx, "thread_set_priority", &pending, &[Value::Fixnum(value)], &none)
        .map_err(describe)?;
    let get = send_primitive(&mut ctx, "thread_get_priority", &pending, &[], &none)
        .map_err(describe)?;
    println!("unstarted thread: requested {value}, set {set}, reads {get}");

    let started = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let worker = busy_worker(vm, started.clone(), stop.clone())?;
    wait_for(&started)?;

    let running = Value::Thread(worker.clone());
    let set = send_primitive(&mut ctx, "thread_set_priority", &running, &[Value::Fixnum(value)], &none)
        .map_err(describe)?;
    let get = send_primitive(&mut ctx, "thread_get_priority", &running, &[], &none)
        .map_err(describe)?;
    println!("running thread: requested {value}, set {set}, reads {get}");

    stop.store(true, Ordering::Release);
    ctx.join(&worker, None).map_err(describe)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level.as_str()))
        .init();

    let vm = VM::new(VMCreateInfo {
        safepoint_poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
        ..Default::default()
    });

    let result = match cli.command {
        Command::Range {
            begin,
            end,
            exclusive,
            step,
        } => run_range(&vm, begin, end, exclusive, step),
        Command::Raise { message } => run_raise(&vm, &message),
        Command::Priority { value } => run_priority(&vm, value),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
