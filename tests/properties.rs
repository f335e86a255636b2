use std::collections::HashMap;

use proptest::prelude::*;
use tinyrt::{Context, EnumFlags, Error, GcFlags, HeapConfig, ObjRef, PropFlags, Result, Value};

fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof!["[a-c]{1,2}", (0u32..12).prop_map(|i| i.to_string())]
}

proptest! {
    #[test]
    fn test_model_read_after_write(
        ops in prop::collection::vec((key_strategy(), prop::option::of(-1000i32..1000)), 1..64),
        as_array in any::<bool>(),
    ) {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        if as_array {
            ctx.push_array(thr).unwrap();
        } else {
            ctx.push_object(thr).unwrap();
        }

        let mut model: HashMap<String, i32> = HashMap::new();
        for (key, value) in &ops {
            match value {
                Some(v) => {
                    ctx.push(thr, Value::number(f64::from(*v))).unwrap();
                    prop_assert!(ctx.put_prop_str(thr, 0, key, true).unwrap());
                    model.insert(key.clone(), *v);
                }
                None => {
                    prop_assert!(ctx.del_prop_str(thr, 0, key, true).unwrap());
                    model.remove(key);
                }
            }
        }

        for (key, _) in &ops {
            let expected = model.get(key).map(|&v| Value::number(f64::from(v)));
            prop_assert_eq!(ctx.has_prop_str(thr, 0, key).unwrap(), expected.is_some());
            ctx.get_prop_str(thr, 0, key).unwrap();
            prop_assert_eq!(ctx.get(thr, -1).unwrap(), expected.unwrap_or(Value::Undefined));
            ctx.pop(thr).unwrap();
        }
        prop_assert_eq!(ctx.get_top(thr).unwrap(), 1);
    }

    #[test]
    fn test_enumeration_matches_model(keys in prop::collection::vec(key_strategy(), 0..24)) {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        ctx.push_object(thr).unwrap();
        let mut expected: Vec<String> = Vec::new();
        for key in &keys {
            ctx.push(thr, Value::Null).unwrap();
            ctx.put_prop_str(thr, 0, key, true).unwrap();
            if !expected.contains(key) {
                expected.push(key.clone());
            }
        }
        // Array indices in ascending order, then the rest in insertion order
        let (mut indices, names): (Vec<String>, Vec<String>) =
            expected.into_iter().partition(|k| k.parse::<u32>().is_ok());
        indices.sort_by_key(|k| k.parse::<u32>().unwrap_or(0));
        let expected: Vec<String> = indices.into_iter().chain(names).collect();

        let seen = own_keys(&mut ctx, thr, 0, EnumFlags::OWN_ONLY | EnumFlags::SORT_ARRAY_INDICES);
        prop_assert_eq!(seen, expected);
    }
}

/// Enumerate the object at `idx`, collecting key strings
fn own_keys(ctx: &mut Context, thr: ObjRef, idx: isize, flags: EnumFlags) -> Vec<String> {
    ctx.enumerator_create(thr, idx, flags).unwrap();
    let mut seen = Vec::new();
    while ctx.enumerator_next(thr, -1, false).unwrap() {
        let key = ctx.get(thr, -1).unwrap().as_string().unwrap();
        seen.push(ctx.string_display(key));
        ctx.pop(thr).unwrap();
    }
    ctx.pop(thr).unwrap();
    seen
}

/// Getter returning `this.x * 2`
fn double_x(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    ctx.push_this(thr)?;
    ctx.get_prop_str(thr, -1, "x")?;
    let x = ctx.get(thr, -1)?.as_number().unwrap_or(f64::NAN);
    ctx.push(thr, Value::number(x * 2.0))?;
    Ok(1)
}

/// Setter storing its argument in `this.x`
fn store_x(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    ctx.push_this(thr)?;
    ctx.dup(thr, 0)?;
    ctx.put_prop_str(thr, -2, "x", true)?;
    Ok(0)
}

#[test]
fn test_inherited_accessor_sees_receiver() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    // proto.double: accessor
    ctx.push_object(thr).unwrap();
    ctx.push_string(thr, "double").unwrap();
    ctx.push_native_function(thr, double_x, Some(0), 0).unwrap();
    ctx.push_native_function(thr, store_x, Some(1), 0).unwrap();
    assert!(ctx.define_accessor(thr, 0, PropFlags::CONFIGURABLE, true).unwrap());

    // child inherits from proto
    ctx.push_object(thr).unwrap();
    ctx.dup(thr, 0).unwrap();
    ctx.set_prototype(thr, 1).unwrap();

    ctx.push(thr, Value::number(21.0)).unwrap();
    ctx.put_prop_str(thr, 1, "double", true).unwrap();
    ctx.get_prop_str(thr, 1, "x").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(21.0));
    ctx.pop(thr).unwrap();
    ctx.get_prop_str(thr, 1, "double").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(42.0));
    ctx.pop(thr).unwrap();

    // The setter wrote to the child, not the prototype
    assert!(!ctx.has_prop_str(thr, 0, "x").unwrap());

    ctx.push_string(thr, "double").unwrap();
    let flags = ctx.get_own_prop(thr, 0).unwrap().unwrap();
    assert!(flags.is_accessor());
    assert!(ctx.is_callable(ctx.get(thr, -2).unwrap()));
    assert!(ctx.is_callable(ctx.get(thr, -1).unwrap()));
}

#[test]
fn test_prototype_cycle_fails_closed() {
    let mut ctx = Context::with_config(HeapConfig::default().with_proto_sanity(64)).unwrap();
    let thr = ctx.heap_thread();
    let before = ctx.stats().objects;

    // [a b] with a.proto = b and b.proto = a
    let a = ctx.push_object(thr).unwrap();
    ctx.push_object(thr).unwrap();
    ctx.dup(thr, 0).unwrap();
    ctx.set_prototype(thr, 1).unwrap();
    ctx.dup(thr, 1).unwrap();
    ctx.set_prototype(thr, 0).unwrap();
    ctx.get_prototype(thr, 1).unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::Object(a));
    ctx.set_top(thr, 2).unwrap();

    assert!(matches!(ctx.get_prop_str(thr, 0, "missing"), Err(Error::Range(_))));
    ctx.set_top(thr, 2).unwrap();
    assert!(matches!(ctx.has_prop_str(thr, 1, "missing"), Err(Error::Range(_))));
    ctx.set_top(thr, 2).unwrap();
    assert!(matches!(ctx.enumerator_create(thr, 0, EnumFlags::NONE), Err(Error::Range(_))));
    ctx.set_top(thr, 2).unwrap();

    // The function's prototype object is not on the cycle
    ctx.push_native_function(thr, double_x, Some(0), 0).unwrap();
    ctx.push_object(thr).unwrap();
    ctx.put_prop_str(thr, 2, "prototype", true).unwrap();
    assert!(matches!(ctx.instance_of(thr, 0, 2), Err(Error::Range(_))));

    ctx.set_top(thr, 0).unwrap();
    ctx.collect(GcFlags::NONE);
    assert_eq!(ctx.stats().objects, before);
}

#[test]
fn test_frozen_style_object() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    ctx.push_object(thr).unwrap();
    ctx.push(thr, Value::number(1.0)).unwrap();
    ctx.define_prop_str(thr, 0, "fixed", PropFlags::ENUMERABLE).unwrap();
    ctx.prevent_extensions(thr, 0).unwrap();

    ctx.push(thr, Value::number(2.0)).unwrap();
    assert!(!ctx.put_prop_str(thr, 0, "fixed", false).unwrap());
    ctx.push(thr, Value::number(2.0)).unwrap();
    assert!(matches!(ctx.put_prop_str(thr, 0, "fixed", true), Err(Error::Type(_))));
    ctx.push(thr, Value::number(3.0)).unwrap();
    assert!(!ctx.put_prop_str(thr, 0, "fresh", false).unwrap());
    assert!(!ctx.del_prop_str(thr, 0, "fixed", false).unwrap());

    ctx.get_prop_str(thr, 0, "fixed").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(1.0));
}

#[test]
fn test_array_length() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    let arr = ctx.push_array(thr).unwrap();
    ctx.push(thr, Value::Bool(true)).unwrap();
    ctx.put_prop_index(thr, 0, 5, true).unwrap();
    assert_eq!(ctx.array_length(arr).unwrap(), 6);

    ctx.push(thr, Value::number(2.0)).unwrap();
    ctx.put_prop_str(thr, 0, "length", true).unwrap();
    assert_eq!(ctx.array_length(arr).unwrap(), 2);
    assert!(!ctx.has_prop_index(thr, 0, 5).unwrap());

    ctx.push(thr, Value::number(1.5)).unwrap();
    assert!(matches!(ctx.put_prop_str(thr, 0, "length", true), Err(Error::Range(_))));
}

/// `get` trap answering every key with 99
fn trap_get(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    ctx.push(thr, Value::number(99.0))?;
    Ok(1)
}

/// `has` trap hiding keys starting with `_`
fn trap_has(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    let key = ctx.get(thr, 1)?.as_string();
    let hidden = match key {
        Some(s) => ctx.string_bytes(s)?.starts_with(b"_"),
        None => false,
    };
    ctx.push(thr, Value::Bool(!hidden))?;
    Ok(1)
}

#[test]
fn test_proxy_traps_and_forwarding() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    // [target handler]
    let target = ctx.push_object(thr).unwrap();
    ctx.push_object(thr).unwrap();
    ctx.push_native_function(thr, trap_get, Some(3), 0).unwrap();
    ctx.put_prop_str(thr, 1, "get", true).unwrap();
    ctx.push_native_function(thr, trap_has, Some(3), 0).unwrap();
    ctx.put_prop_str(thr, 1, "has", true).unwrap();
    ctx.push_proxy(thr).unwrap();

    ctx.get_prop_str(thr, 0, "anything").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(99.0));
    ctx.pop(thr).unwrap();
    assert!(ctx.has_prop_str(thr, 0, "visible").unwrap());
    assert!(!ctx.has_prop_str(thr, 0, "_secret").unwrap());

    // No set trap: the write lands on the target
    ctx.push(thr, Value::number(5.0)).unwrap();
    assert!(ctx.put_prop_str(thr, 0, "y", true).unwrap());
    ctx.push(thr, Value::Object(target)).unwrap();
    ctx.get_prop_str(thr, -1, "y").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::number(5.0));
    ctx.pop_n(thr, 2).unwrap();

    // Enumeration walks the target
    assert_eq!(own_keys(&mut ctx, thr, 0, EnumFlags::OWN_ONLY), ["y"]);
}

#[test]
fn test_keys_must_be_primitive() {
    let mut ctx = Context::new().unwrap();
    let thr = ctx.heap_thread();
    ctx.push_object(thr).unwrap();
    ctx.push_object(thr).unwrap();
    assert!(matches!(ctx.get_prop(thr, 0), Err(Error::Type(_))));

    // Numbers and booleans coerce to their string form
    ctx.set_top(thr, 1).unwrap();
    ctx.push(thr, Value::number(3.0)).unwrap();
    ctx.push(thr, Value::Bool(true)).unwrap();
    ctx.put_prop(thr, 0, true).unwrap();
    ctx.push(thr, Value::Bool(true)).unwrap();
    ctx.push(thr, Value::Null).unwrap();
    ctx.put_prop(thr, 0, true).unwrap();
    ctx.get_prop_str(thr, 0, "3").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::Bool(true));
    ctx.get_prop_str(thr, 0, "true").unwrap();
    assert_eq!(ctx.get(thr, -1).unwrap(), Value::Null);
}
