mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{Asm, context, define_native, run};
use tinyrt::{CallStatus, Context, Error, HeapConfig, ObjRef, Result, Value};

fn add(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    let a = ctx.get(thr, 0)?.as_number().unwrap_or(f64::NAN);
    let b = ctx.get(thr, 1)?.as_number().unwrap_or(f64::NAN);
    ctx.push(thr, Value::number(a + b))?;
    Ok(1)
}

fn fail(_ctx: &mut Context, _thr: ObjRef) -> Result<usize> {
    Err(Error::type_error("nope"))
}

/// Calls its first argument with no arguments
fn invoke(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    ctx.dup(thr, 0)?;
    ctx.push(thr, Value::Undefined)?;
    ctx.call(thr, 0)?;
    Ok(1)
}

#[test]
fn test_return_constant() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    let tpl = Asm::new(0, 0).num(42.0).ret().finish();
    assert_eq!(run(&mut ctx, &tpl, &[]).unwrap(), Value::number(42.0));
    assert_eq!(ctx.get_top(thr).unwrap(), 1);
    assert_eq!(ctx.callstack_depth(thr).unwrap(), 0);
}

#[test]
fn test_arguments_land_in_registers() {
    let mut ctx = context();
    let sum = Asm::new(2, 2).reg(0).reg(1).add().ret().finish();
    let args = [Value::number(2.0), Value::number(3.0)];
    assert_eq!(run(&mut ctx, &sum, &args).unwrap(), Value::number(5.0));

    // Registers past the arguments start out undefined
    let third = Asm::new(2, 3).reg(2).ret().finish();
    assert_eq!(run(&mut ctx, &third, &args).unwrap(), Value::Undefined);

    // Falling off the end returns undefined
    let empty = Asm::new(0, 0).finish();
    assert_eq!(run(&mut ctx, &empty, &[]).unwrap(), Value::Undefined);
}

#[test]
fn test_script_calls_script() {
    let mut ctx = context();
    let double = Asm::new(1, 1).reg(0).reg(0).add().ret().finish();
    let outer = Asm::new(0, 0)
        .func(double)
        .undef()
        .num(4.0)
        .call(1)
        .num(1.0)
        .add()
        .ret()
        .finish();
    assert_eq!(run(&mut ctx, &outer, &[]).unwrap(), Value::number(9.0));

    let depth = Asm::new(0, 0).depth().ret().finish();
    let outer = Asm::new(0, 0).func(depth).undef().call(0).ret().finish();
    assert_eq!(run(&mut ctx, &outer, &[]).unwrap(), Value::number(2.0));
}

#[test]
fn test_tail_call() {
    let mut ctx = context();
    let depth = Asm::new(0, 0).depth().ret().finish();
    let tail = Asm::new(0, 0).func(depth).undef().tail_call(0).ret().finish();

    // main -> tail -> depth: the tail call reuses tail's activation
    let main = Asm::new(0, 0).func(tail.clone()).undef().call(0).ret().finish();
    assert_eq!(run(&mut ctx, &main, &[]).unwrap(), Value::number(2.0));

    // Entered from native code the tail call degrades to a plain call
    assert_eq!(run(&mut ctx, &tail, &[]).unwrap(), Value::number(2.0));
}

#[test]
fn test_native_through_global() {
    let mut ctx = context();
    define_native(&mut ctx, "add", add, Some(2));
    let tpl = Asm::new(0, 0)
        .get_var("add")
        .undef()
        .num(2.0)
        .num(3.0)
        .call(2)
        .ret()
        .finish();
    assert_eq!(run(&mut ctx, &tpl, &[]).unwrap(), Value::number(5.0));

    let missing = Asm::new(0, 0).get_var("nothing").ret().finish();
    assert!(matches!(run(&mut ctx, &missing, &[]), Err(Error::Reference(_))));
}

#[test]
fn test_catch_thrown_value() {
    let mut ctx = context();
    let mut asm = Asm::new(0, 1);
    let handler = asm.try_catch(0);
    asm.num(7.0).throw();
    asm.bind(handler).end_try().reg(0).num(1.0).add().ret();
    let tpl = asm.finish();
    assert_eq!(run(&mut ctx, &tpl, &[]).unwrap(), Value::number(8.0));
    assert_eq!(ctx.thrown_value(), Value::Undefined);
}

#[test]
fn test_catch_native_error() {
    let mut ctx = context();
    define_native(&mut ctx, "fail", fail, None);
    let mut asm = Asm::new(0, 1);
    let handler = asm.try_catch(0);
    asm.get_var("fail").undef().call(0).end_try().ret();
    asm.bind(handler).end_try().reg(0).ret();
    let tpl = asm.finish();

    let err = run(&mut ctx, &tpl, &[]).unwrap();
    assert!(err.is_object());
    assert_eq!(ctx.value_summary(err), "TypeError: nope");
}

#[test]
fn test_uncaught_error_through_pcall() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    let tpl = Asm::new(0, 0).num(3.0).throw().finish();
    ctx.push_compiled_function(thr, &tpl, None).unwrap();
    ctx.push(thr, Value::Undefined).unwrap();
    assert_eq!(ctx.pcall(thr, 0).unwrap(), CallStatus::Error);
    assert_eq!(ctx.get_top(thr).unwrap(), 1);
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(3.0));
    assert_eq!(ctx.callstack_depth(thr).unwrap(), 0);

    // Without protection the thrown value waits in the context
    ctx.pop(thr).unwrap();
    assert_eq!(run(&mut ctx, &tpl, &[]), Err(Error::Thrown));
    assert_eq!(ctx.thrown_value(), Value::number(3.0));
    assert_eq!(ctx.get_top(thr).unwrap(), 0);
}

#[test]
fn test_catch_unwinds_nested_activations() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    let thrower = Asm::new(0, 0).num(9.0).throw().finish();
    let mut asm = Asm::new(0, 1);
    let handler = asm.try_catch(0);
    asm.func(thrower).undef().call(0).end_try().num(0.0).ret();
    asm.bind(handler).end_try().reg(0).depth().add().ret();
    let tpl = asm.finish();

    // Caught in the outer activation: depth is back to 1
    assert_eq!(run(&mut ctx, &tpl, &[]).unwrap(), Value::number(10.0));
    assert_eq!(ctx.callstack_depth(thr).unwrap(), 0);
    assert!(ctx.catcher(thr).unwrap().is_none());
}

#[test]
fn test_catch_across_native_boundary() {
    let mut ctx = context();
    define_native(&mut ctx, "invoke", invoke, Some(1));
    let thrower = Asm::new(0, 0).num(9.0).throw().finish();
    let mut asm = Asm::new(0, 1);
    let handler = asm.try_catch(0);
    asm.get_var("invoke").undef().func(thrower).call(1).end_try().ret();
    asm.bind(handler).end_try().reg(0).ret();
    let tpl = asm.finish();
    assert_eq!(run(&mut ctx, &tpl, &[]).unwrap(), Value::number(9.0));
}

#[test]
fn test_callstack_limit() {
    let cfg = HeapConfig::default().with_callstack_max(16);
    let mut ctx = Context::with_config(cfg).unwrap();
    ctx.set_executor(Rc::new(common::TestExecutor));
    let thr = ctx.heap_thread();

    let global = ctx.global();
    ctx.push(thr, Value::Object(global)).unwrap();
    let tpl = Asm::new(0, 0).get_var("f").undef().call(0).ret().finish();
    ctx.push_compiled_function(thr, &tpl, None).unwrap();
    ctx.put_prop_str(thr, -2, "f", true).unwrap();
    ctx.get_prop_str(thr, -1, "f").unwrap();
    ctx.push(thr, Value::Undefined).unwrap();

    assert_eq!(ctx.pcall(thr, 0).unwrap(), CallStatus::Error);
    let err = ctx.get(thr, -1).unwrap();
    assert_eq!(ctx.value_summary(err), "RangeError: callstack limit");
    assert_eq!(ctx.callstack_depth(thr).unwrap(), 0);
}

#[test]
fn test_interrupt_stops_loop() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    let polls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&polls);
    ctx.set_interrupt_handler(Some(Box::new(move || {
        counter.set(counter.get() + 1);
        counter.get() > 100
    })));

    let mut asm = Asm::new(0, 0);
    let start = asm.here();
    asm.jump_to(start);
    let tpl = asm.finish();
    ctx.push_compiled_function(thr, &tpl, None).unwrap();
    ctx.push(thr, Value::Undefined).unwrap();
    assert_eq!(ctx.pcall(thr, 0).unwrap(), CallStatus::Error);
    let err = ctx.get(thr, -1).unwrap();
    assert_eq!(ctx.value_summary(err), "RangeError: execution timeout");
    assert_eq!(polls.get(), 101);
}

#[test]
fn test_construct_compiled() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    let tpl = Asm::new(1, 1).this().reg(0).put_prop("x").ret().finish();
    ctx.push_compiled_function(thr, &tpl, None).unwrap();
    ctx.dup(thr, -1).unwrap();
    ctx.push(thr, Value::number(7.0)).unwrap();
    ctx.construct(thr, 1).unwrap();

    // [f inst]: the non-object return value is ignored
    assert_eq!(ctx.get_top(thr).unwrap(), 2);
    assert!(ctx.instance_of(thr, -1, -2).unwrap());
    ctx.get_prop_str(thr, -1, "x").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(7.0));
}

#[test]
fn test_bound_compiled_function() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    let tpl = Asm::new(2, 2).reg(0).reg(1).add().ret().finish();
    ctx.push_compiled_function(thr, &tpl, None).unwrap();
    ctx.push(thr, Value::Undefined).unwrap();
    ctx.push(thr, Value::number(10.0)).unwrap();
    ctx.push_bound_function(thr, 1).unwrap();
    ctx.push(thr, Value::Null).unwrap();
    ctx.push(thr, Value::number(5.0)).unwrap();
    ctx.call(thr, 1).unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(15.0));
}

#[test]
fn test_this_coercion() {
    let mut ctx = context();
    let sloppy = Asm::new(0, 0).this().ret().finish();
    let global = ctx.global();
    assert_eq!(run(&mut ctx, &sloppy, &[]).unwrap(), Value::Object(global));

    let strict = Asm::new(0, 0).strict().this().ret().finish();
    assert_eq!(run(&mut ctx, &strict, &[]).unwrap(), Value::Undefined);
}

#[test]
fn test_line_numbers_follow_pc() {
    let mut ctx = context();
    let thr = ctx.heap_thread();
    // PUSH_CONST takes three bytes: pcs 0, 3, 6 (ADD) and 7 (RETURN)
    let tpl = Asm::new(0, 0).line(1).num(1.0).line(2).num(2.0).add().line(3).ret().finish();
    assert_eq!(run(&mut ctx, &tpl, &[]).unwrap(), Value::number(3.0));

    let f = ctx.push_compiled_function(thr, &tpl, None).unwrap();
    assert_eq!(ctx.function_line(f, 0).unwrap(), Some(1));
    assert_eq!(ctx.function_line(f, 3).unwrap(), Some(2));
    assert_eq!(ctx.function_line(f, 6).unwrap(), Some(2));
    assert_eq!(ctx.function_line(f, 7).unwrap(), Some(3));
}
