use std::cell::Cell;

use tinyrt::{Context, GcFlags, HeapConfig, ObjRef, Result, Value};

thread_local! {
    static FINALIZED: Cell<usize> = const { Cell::new(0) };
}

fn finalized() -> usize {
    FINALIZED.with(Cell::get)
}

fn count(_ctx: &mut Context, _thr: ObjRef) -> Result<usize> {
    FINALIZED.with(|c| c.set(c.get() + 1));
    Ok(0)
}

/// Stores the dying object in `global.saved`
fn rescue(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    FINALIZED.with(|c| c.set(c.get() + 1));
    let global = ctx.global();
    ctx.push(thr, Value::Object(global))?;
    ctx.dup(thr, 0)?;
    ctx.put_prop_str(thr, -2, "saved", true)?;
    Ok(0)
}

/// Push two objects referencing each other; returns them
fn push_cycle(ctx: &mut Context, thr: ObjRef) -> (ObjRef, ObjRef) {
    let a = ctx.push_object(thr).unwrap();
    let b = ctx.push_object(thr).unwrap();
    ctx.dup(thr, -1).unwrap();
    ctx.put_prop_str(thr, -3, "peer", true).unwrap();
    ctx.dup(thr, -2).unwrap();
    ctx.put_prop_str(thr, -2, "peer", true).unwrap();
    (a, b)
}

#[test]
fn test_refcounts_follow_references() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let holder = ctx.push_object(thr).unwrap();
    let obj = ctx.push_object(thr).unwrap();
    let v = Value::Object(obj);
    assert_eq!(ctx.refcount(v), Some(1));

    ctx.dup(thr, -1).unwrap();
    assert_eq!(ctx.refcount(v), Some(2));
    ctx.put_prop_str(thr, 0, "child", true).unwrap();
    assert_eq!(ctx.refcount(v), Some(2));

    // A collection leaves exact counts behind
    ctx.collect(GcFlags::NONE);
    assert_eq!(ctx.refcount(v), Some(2));

    ctx.pop(thr).unwrap();
    assert_eq!(ctx.refcount(v), Some(1));
    ctx.del_prop_str(thr, 0, "child", true).unwrap();
    assert_eq!(ctx.refcount(v), None);
    assert_eq!(ctx.refcount(Value::Object(holder)), Some(1));
}

#[test]
fn test_interned_strings_shared_and_released() {
    let mut ctx = Context::new().unwrap();
    let before = ctx.stats().strings;
    let a = ctx.intern("shared key").unwrap();
    let b = ctx.intern(b"shared key").unwrap();
    assert_eq!(a, b);
    assert_eq!(ctx.refcount(Value::String(a)), Some(2));
    assert_eq!(ctx.stats().strings, before + 1);

    ctx.release(a);
    assert_eq!(ctx.string_bytes(b).unwrap(), b"shared key");
    ctx.release(b);
    assert_eq!(ctx.stats().strings, before);
    assert!(ctx.string_bytes(a).is_err());
}

#[test]
fn test_cycle_needs_collection() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let before = ctx.stats().objects;
    let (a, _) = push_cycle(&mut ctx, thr);
    let weak = ctx.weak_ref(thr, -2).unwrap();
    ctx.set_top(thr, 0).unwrap();

    assert_eq!(ctx.stats().objects, before + 2);
    assert_eq!(ctx.weak_get(weak), Some(a));

    let stats = ctx.collect(GcFlags::NONE);
    assert_eq!(stats.freed_objects, 2);
    assert_eq!(ctx.stats().objects, before);
    assert_eq!(ctx.weak_get(weak), None);
    assert!(!ctx.push_weak(thr, weak).unwrap());
}

#[test]
fn test_finalizer_rescue_on_refzero() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let obj = ctx.push_object(thr).unwrap();
    let weak = ctx.weak_ref(thr, -1).unwrap();
    ctx.push_native_function(thr, rescue, Some(2), 0).unwrap();
    ctx.set_finalizer(thr, -2).unwrap();
    ctx.pop(thr).unwrap();

    assert_eq!(finalized(), 1);
    assert_eq!(ctx.weak_get(weak), Some(obj));
    assert_eq!(ctx.refcount(Value::Object(obj)), Some(1));

    // Without its finalizer the object dies on the next drop
    let global = ctx.global();
    ctx.push(thr, Value::Object(global)).unwrap();
    ctx.get_prop_str(thr, -1, "saved").unwrap();
    ctx.push(thr, Value::Undefined).unwrap();
    ctx.set_finalizer(thr, -2).unwrap();
    ctx.pop(thr).unwrap();
    ctx.del_prop_str(thr, -1, "saved", true).unwrap();
    assert_eq!(ctx.weak_get(weak), None);
    assert_eq!(finalized(), 1);
}

#[test]
fn test_finalizer_on_cycle_runs_once() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let (a, _) = push_cycle(&mut ctx, thr);
    let weak = ctx.weak_ref(thr, -2).unwrap();
    ctx.push_native_function(thr, count, Some(2), 0).unwrap();
    ctx.set_finalizer(thr, -3).unwrap();
    ctx.set_top(thr, 0).unwrap();

    // The first collection finalizes, the cycle still holds itself
    let stats = ctx.collect(GcFlags::NONE);
    assert_eq!(stats.finalizable, 1);
    assert_eq!(stats.finalizers_run, 1);
    assert_eq!(stats.freed_objects, 0);
    assert_eq!(ctx.weak_get(weak), Some(a));

    let stats = ctx.collect(GcFlags::NONE);
    assert_eq!(stats.finalizers_run, 0);
    // The pair and the finalizer function
    assert_eq!(stats.freed_objects, 3);
    assert_eq!(ctx.weak_get(weak), None);
    assert_eq!(finalized(), 1);
}

#[test]
fn test_deferred_finalizers() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    push_cycle(&mut ctx, thr);
    ctx.push_native_function(thr, count, Some(2), 0).unwrap();
    ctx.set_finalizer(thr, -2).unwrap();
    ctx.set_top(thr, 0).unwrap();

    let stats = ctx.collect(GcFlags::NO_FINALIZERS);
    assert_eq!(stats.finalizable, 1);
    assert_eq!(stats.finalizers_run, 0);
    assert_eq!(finalized(), 0);

    let stats = ctx.collect(GcFlags::NONE);
    assert_eq!(stats.finalizers_run, 1);
    assert_eq!(finalized(), 1);
}

#[test]
fn test_finalizers_run_at_teardown() {
    {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        ctx.push_object(thr).unwrap();
        ctx.push_native_function(thr, finalize_on_teardown, Some(2), 0).unwrap();
        ctx.set_finalizer(thr, -2).unwrap();
        ctx.stash_push(thr).unwrap();
    }
    assert_eq!(finalized(), 1);
}

fn finalize_on_teardown(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    assert_eq!(ctx.get(thr, 1)?, Value::Bool(true));
    assert!(ctx.is_destroying());
    FINALIZED.with(|c| c.set(c.get() + 1));
    Ok(0)
}

#[test]
fn test_stash_roots_values() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let (a, _) = push_cycle(&mut ctx, thr);
    ctx.pop(thr).unwrap();
    ctx.stash_push(thr).unwrap();
    assert_eq!(ctx.stash_len(), 1);
    assert_eq!(ctx.get_top(thr).unwrap(), 0);

    ctx.collect(GcFlags::NONE);
    assert!(ctx.refcount(Value::Object(a)).is_some());

    assert!(ctx.stash_pop(thr).unwrap());
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::Object(a));
    assert!(!ctx.stash_pop(thr).unwrap());
}

#[test]
fn test_emergency_collection_reclaims_cycles() {
    let cfg = HeapConfig::default()
        .with_max_bytes(256 * 1024)
        .with_voluntary_gc(false);
    let mut ctx = Context::with_config(cfg).unwrap();
    let thr = ctx.heap_thread();
    for _ in 0..10_000 {
        push_cycle(&mut ctx, thr);
        ctx.set_top(thr, 0).unwrap();
    }
    assert!(ctx.stats().gc_runs > 0);
    assert!(ctx.stats().bytes_used <= 256 * 1024);
}

#[test]
fn test_voluntary_trigger() {
    let cfg = HeapConfig::default().with_gc_trigger(0, 100, 10);
    let mut ctx = Context::with_config(cfg).unwrap();
    let thr = ctx.heap_thread();
    for _ in 0..1_000 {
        ctx.push_object(thr).unwrap();
        ctx.pop(thr).unwrap();
    }
    assert!(ctx.stats().gc_runs >= 5);

    let cfg = HeapConfig::default().with_gc_trigger(0, 100, 10).with_voluntary_gc(false);
    let mut ctx = Context::with_config(cfg).unwrap();
    let thr = ctx.heap_thread();
    for _ in 0..1_000 {
        ctx.push_object(thr).unwrap();
        ctx.pop(thr).unwrap();
    }
    assert_eq!(ctx.stats().gc_runs, 0);
}

#[test]
fn test_buffers() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let buf = ctx.push_buffer(thr, 4, true).unwrap();
    ctx.buffer_data_mut(buf).unwrap().copy_from_slice(b"abcd");
    ctx.resize_buffer(thr, -1, 6).unwrap();
    assert_eq!(ctx.buffer_data(buf).unwrap(), b"abcd\0\0");

    ctx.get_prop_str(thr, -1, "length").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(6.0));
    ctx.pop(thr).unwrap();

    let before = ctx.stats().buffers;
    ctx.pop(thr).unwrap();
    assert_eq!(ctx.stats().buffers, before - 1);
}
