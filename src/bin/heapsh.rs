//! heapsh - interactive heap shell
//!
//! Pokes a tinyrt heap one command at a time. Commands work on the value
//! stack of the heap thread; `RUST_LOG=tinyrt=debug` shows GC activity.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tinyrt::{Context, GcFlags, ObjRef, Value};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  intern <s>        push the interned string <s>
  obj               push a new object
  put <key> <num>   set <key> on the object on top of the stack
  get <key>         push the value of <key> from the object on top
  del <key>         delete <key> from the object on top
  dup               duplicate the top value
  pop               drop the top value
  gc                run a full collection
  stats             print heap statistics
  stack             list the value stack
  help              show this text
  quit              leave";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut ctx = match Context::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error creating context: {e}");
            std::process::exit(1);
        }
    };
    let mut editor = match DefaultEditor::new() {
        Ok(ed) => ed,
        Err(e) => {
            eprintln!("Error starting line editor: {e}");
            std::process::exit(1);
        }
    };

    println!("heapsh - tinyrt heap shell");
    println!("Type 'help' for commands, Ctrl+D to exit.\n");

    loop {
        match editor.readline("heap> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if matches!(line, "quit" | "exit") {
                    break;
                }
                if let Err(e) = run_command(&mut ctx, line) {
                    println!("Error: {e}");
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        }
    }
}

fn run_command(ctx: &mut Context, line: &str) -> tinyrt::Result<()> {
    let thr = ctx.heap_thread();
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or_default();
    let arg = words.next();

    match (cmd, arg) {
        ("intern", Some(s)) => {
            let s = ctx.push_string(thr, s)?;
            println!("{:?} refcount={}", ctx.string_display(s), refcount(ctx, Value::String(s)));
        }
        ("obj", None) => {
            let o = ctx.push_object(thr)?;
            println!("pushed object {:?}", o.heap_ref());
        }
        ("put", Some(key)) => {
            let Some(n) = words.next().and_then(|w| w.parse::<f64>().ok()) else {
                println!("usage: put <key> <num>");
                return Ok(());
            };
            require_object(ctx, thr)?;
            ctx.push(thr, Value::number(n))?;
            let ok = ctx.put_prop_str(thr, -2, key, false)?;
            println!("{}", if ok { "ok" } else { "rejected" });
        }
        ("get", Some(key)) => {
            require_object(ctx, thr)?;
            ctx.get_prop_str(thr, -1, key)?;
            let v = ctx.get(thr, -1)?;
            println!("{}", ctx.value_summary(v));
        }
        ("del", Some(key)) => {
            require_object(ctx, thr)?;
            let ok = ctx.del_prop_str(thr, -1, key, false)?;
            println!("{ok}");
        }
        ("dup", None) => ctx.dup(thr, -1)?,
        ("pop", None) => ctx.pop(thr)?,
        ("gc", None) => {
            let s = ctx.collect(GcFlags::NONE);
            println!(
                "kept={} freed objects={} strings={} buffers={} finalizers={}",
                s.kept, s.freed_objects, s.freed_strings, s.freed_buffers, s.finalizers_run
            );
        }
        ("stats", None) => {
            let s = ctx.stats();
            println!("objects:       {}", s.objects);
            println!("strings:       {}", s.strings);
            println!("buffers:       {}", s.buffers);
            println!("string table:  {}/{}", s.strtab_used, s.strtab_size);
            println!("bytes used:    {}", s.bytes_used);
            println!("gc runs:       {}", s.gc_runs);
            println!("refzero frees: {}", s.refzero_frees);
            println!("finalizers:    {}", s.finalizers_run);
        }
        ("stack", None) => {
            let top = ctx.get_top(thr)?;
            if top == 0 {
                println!("(empty)");
            }
            for i in 0..top {
                let v = ctx.get(thr, i as isize)?;
                println!("[{i}] {} refcount={}", ctx.value_summary(v), refcount(ctx, v));
            }
        }
        ("help", _) => println!("{HELP}"),
        _ => println!("unknown command '{line}', try 'help'"),
    }
    Ok(())
}

fn require_object(ctx: &Context, thr: ObjRef) -> tinyrt::Result<()> {
    match ctx.get(thr, -1)? {
        Value::Object(_) => Ok(()),
        _ => Err(tinyrt::Error::type_error("top of stack is not an object")),
    }
}

fn refcount(ctx: &Context, v: Value) -> String {
    ctx.refcount(v).map_or_else(|| "-".into(), |n| n.to_string())
}
