use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tinyrt::{Context, GcFlags, ObjRef, Result, Value};

fn bench_intern(c: &mut Criterion) {
    let keys: Vec<String> = (0..1000).map(|i| format!("key{i}")).collect();

    c.bench_function("intern 1k fresh", |b| {
        b.iter(|| {
            let mut ctx = Context::new().unwrap();
            for k in &keys {
                let s = ctx.intern(k).unwrap();
                black_box(s);
            }
        })
    });

    c.bench_function("intern 1k hits", |b| {
        let mut ctx = Context::new().unwrap();
        let held: Vec<_> = keys.iter().map(|k| ctx.intern(k).unwrap()).collect();
        b.iter(|| {
            for k in &keys {
                let s = ctx.intern(k).unwrap();
                ctx.release(black_box(s));
            }
        });
        for s in held {
            ctx.release(s);
        }
    });
}

fn bench_properties(c: &mut Criterion) {
    c.bench_function("put/get 1k named", |b| {
        let keys: Vec<String> = (0..1000).map(|i| format!("p{i}")).collect();
        b.iter(|| {
            let mut ctx = Context::new().unwrap();
            let thr = ctx.heap_thread();
            ctx.push_object(thr).unwrap();
            for (i, k) in keys.iter().enumerate() {
                ctx.push(thr, Value::number(i as f64)).unwrap();
                ctx.put_prop_str(thr, -2, k, true).unwrap();
            }
            for k in &keys {
                ctx.get_prop_str(thr, -1, k).unwrap();
                ctx.pop(thr).unwrap();
            }
        })
    });

    c.bench_function("array append 10k", |b| {
        b.iter(|| {
            let mut ctx = Context::new().unwrap();
            let thr = ctx.heap_thread();
            let arr = ctx.push_array(thr).unwrap();
            for i in 0..10_000 {
                ctx.push(thr, Value::number(i as f64)).unwrap();
                ctx.array_append(thr, -2).unwrap();
            }
            black_box(ctx.array_length(arr).unwrap())
        })
    });
}

fn bench_gc(c: &mut Criterion) {
    c.bench_function("collect 1k cycles", |b| {
        b.iter(|| {
            let mut ctx = Context::new().unwrap();
            let thr = ctx.heap_thread();
            for _ in 0..1000 {
                ctx.push_object(thr).unwrap();
                ctx.push_object(thr).unwrap();
                ctx.dup(thr, -2).unwrap();
                ctx.put_prop_str(thr, -2, "peer", true).unwrap();
                ctx.put_prop_str(thr, -2, "peer", true).unwrap();
                ctx.pop(thr).unwrap();
            }
            black_box(ctx.collect(GcFlags::NONE))
        })
    });

    c.bench_function("refzero chain 10k", |b| {
        b.iter(|| {
            let mut ctx = Context::new().unwrap();
            let thr = ctx.heap_thread();
            ctx.push_object(thr).unwrap();
            for _ in 0..10_000 {
                ctx.push_object(thr).unwrap();
                ctx.insert(thr, -2).unwrap();
                ctx.put_prop_str(thr, -2, "next", true).unwrap();
            }
            ctx.pop(thr).unwrap();
            black_box(ctx.stats().refzero_frees)
        })
    });
}

fn add_one(ctx: &mut Context, thr: ObjRef) -> Result<usize> {
    let n = ctx.get(thr, 0)?.as_number().unwrap_or(0.0);
    ctx.push(thr, Value::number(n + 1.0))?;
    Ok(1)
}

fn bench_calls(c: &mut Criterion) {
    c.bench_function("native call 10k", |b| {
        let mut ctx = Context::new().unwrap();
        let thr = ctx.heap_thread();
        b.iter(|| {
            ctx.push(thr, Value::number(0.0)).unwrap();
            for _ in 0..10_000 {
                ctx.push_lightfunc(thr, add_one, Some(1), 0).unwrap();
                ctx.push(thr, Value::Undefined).unwrap();
                ctx.dup(thr, -3).unwrap();
                ctx.call(thr, 1).unwrap();
                ctx.replace(thr, -2).unwrap();
            }
            black_box(ctx.get(thr, -1).unwrap());
            ctx.pop(thr).unwrap();
        })
    });
}

criterion_group!(benches, bench_intern, bench_properties, bench_gc, bench_calls);
criterion_main!(benches);
