//! Shared fixtures: a toy bytecode executor and an assembler for it.
//!
//! The instruction set is just wide enough to exercise the call, catch and
//! coroutine protocol from the outside. Operands are little-endian.

#![allow(dead_code)]

use std::rc::Rc;

use tinyrt::{
    CatchFlags, Catcher, Completion, Constant, Context, Entry, Error, Executor, FunctionTemplate, ObjRef,
    Result, Value,
};

pub mod op {
    /// k16: push constant k
    pub const PUSH_CONST: u8 = 0;
    /// r8: push register r
    pub const PUSH_REG: u8 = 1;
    /// r8: pop into register r
    pub const STORE_REG: u8 = 2;
    pub const PUSH_UNDEF: u8 = 3;
    pub const PUSH_THIS: u8 = 4;
    pub const POP: u8 = 5;
    /// [a b] -> [a + b]
    pub const ADD: u8 = 6;
    /// n8: [func this args] -> [retval]
    pub const CALL: u8 = 7;
    /// n8
    pub const TAIL_CALL: u8 = 8;
    pub const RETURN: u8 = 9;
    /// e8: yield the top value, thrown into the resumer when e != 0
    pub const YIELD: u8 = 10;
    pub const THROW: u8 = 11;
    /// pc16 r8: catch at pc, caught value into register r
    pub const TRY: u8 = 12;
    pub const END_TRY: u8 = 13;
    /// pc16
    pub const JUMP: u8 = 14;
    /// k16: push the variable named by string constant k
    pub const GET_VAR: u8 = 15;
    /// i16: push inner function i
    pub const PUSH_FUNC: u8 = 16;
    /// push the call stack depth
    pub const DEPTH: u8 = 17;
    /// k16: [obj value] -> [], obj[k] = value
    pub const PUT_PROP: u8 = 18;
}

enum Flow {
    Next,
    Return,
    Yield(bool),
}

/// Executor for the toy instruction set
pub struct TestExecutor;

impl Executor for TestExecutor {
    fn execute(&self, ctx: &mut Context, thr: ObjRef, entry: Entry) -> Result<Completion> {
        let (entry_depth, catch_base) = match entry {
            Entry::Call => {
                let depth = ctx.callstack_depth(thr)?;
                (depth, depth - 1)
            }
            Entry::Resume => (1, 0),
        };
        loop {
            match step(ctx, thr) {
                Ok(Flow::Next) => {}
                Ok(Flow::Return) => {
                    ctx.script_return(thr)?;
                    if ctx.callstack_depth(thr)? < entry_depth {
                        return Ok(Completion::Return);
                    }
                }
                Ok(Flow::Yield(is_error)) => return Ok(Completion::Yield { is_error }),
                Err(e) => {
                    ctx.handle_catch(thr, e, catch_base)?;
                }
            }
        }
    }
}

fn read_u16(code: &[u8], at: usize) -> Result<u16> {
    match code.get(at..at + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(Error::internal("truncated operand")),
    }
}

fn read_u8(code: &[u8], at: usize) -> Result<u8> {
    code.get(at).copied().ok_or_else(|| Error::internal("truncated operand"))
}

fn constant_key(ctx: &Context, func: ObjRef, k: u16) -> Result<tinyrt::StrRef> {
    ctx.function_constant(func, usize::from(k))?
        .as_string()
        .ok_or_else(|| Error::internal("constant is not a string"))
}

fn step(ctx: &mut Context, thr: ObjRef) -> Result<Flow> {
    ctx.check_interrupt()?;
    let act = ctx.activation(thr)?;
    let func = act
        .func
        .as_object()
        .ok_or_else(|| Error::internal("activation without a compiled function"))?;
    let code = ctx.function_bytecode(func)?;
    let pc = act.pc as usize;
    let Some(&opcode) = code.get(pc) else {
        // Falling off the end returns undefined
        ctx.push(thr, Value::Undefined)?;
        return Ok(Flow::Return);
    };
    let width = match opcode {
        op::PUSH_CONST | op::GET_VAR | op::PUSH_FUNC | op::JUMP | op::PUT_PROP => 2,
        op::PUSH_REG | op::STORE_REG | op::CALL | op::TAIL_CALL | op::YIELD => 1,
        op::TRY => 3,
        _ => 0,
    };
    let next = pc + 1 + width;
    ctx.set_pc(thr, next as u32)?;

    match opcode {
        op::PUSH_CONST => {
            let k = read_u16(&code, pc + 1)?;
            let v = ctx.function_constant(func, usize::from(k))?;
            ctx.push(thr, v)?;
        }
        op::PUSH_REG => {
            let r = read_u8(&code, pc + 1)?;
            ctx.dup(thr, isize::from(r))?;
        }
        op::STORE_REG => {
            let r = read_u8(&code, pc + 1)?;
            let v = ctx.get(thr, -1)?;
            ctx.set(thr, isize::from(r), v)?;
            ctx.pop(thr)?;
        }
        op::PUSH_UNDEF => ctx.push(thr, Value::Undefined)?,
        op::PUSH_THIS => ctx.push_this(thr)?,
        op::POP => ctx.pop(thr)?,
        op::ADD => {
            let a = ctx.get(thr, -2)?.as_number();
            let b = ctx.get(thr, -1)?.as_number();
            let (Some(a), Some(b)) = (a, b) else {
                return Err(Error::type_error("operands must be numbers"));
            };
            ctx.pop_n(thr, 2)?;
            ctx.push(thr, Value::number(a + b))?;
        }
        op::CALL | op::TAIL_CALL => {
            let n = read_u8(&code, pc + 1)?;
            ctx.setup_script_call(thr, usize::from(n), opcode == op::TAIL_CALL)?;
        }
        op::RETURN => return Ok(Flow::Return),
        op::YIELD => {
            let is_error = read_u8(&code, pc + 1)? != 0;
            ctx.check_yield(thr)?;
            return Ok(Flow::Yield(is_error));
        }
        op::THROW => return Err(ctx.throw_top(thr)),
        op::TRY => {
            let target = read_u16(&code, pc + 1)?;
            let r = read_u8(&code, pc + 3)?;
            let catcher = Catcher::try_catch(
                CatchFlags::CATCH_ENABLED,
                u32::from(target),
                act.idx_bottom + usize::from(r),
                None,
            );
            ctx.push_catcher(thr, catcher)?;
        }
        op::END_TRY => ctx.pop_catcher(thr)?,
        op::JUMP => {
            let target = read_u16(&code, pc + 1)?;
            ctx.set_pc(thr, u32::from(target))?;
        }
        op::GET_VAR => {
            let name = constant_key(ctx, func, read_u16(&code, pc + 1)?)?;
            ctx.get_var(thr, act.lex_env, name, true)?;
        }
        op::PUSH_FUNC => {
            let i = read_u16(&code, pc + 1)?;
            let inner = ctx.function_inner(func, usize::from(i))?;
            ctx.push(thr, Value::Object(inner))?;
        }
        op::DEPTH => {
            let depth = ctx.callstack_depth(thr)?;
            ctx.push(thr, Value::number(depth as f64))?;
        }
        op::PUT_PROP => {
            let key = constant_key(ctx, func, read_u16(&code, pc + 1)?)?;
            ctx.push(thr, Value::String(key))?;
            ctx.swap(thr, -1, -2)?;
            ctx.put_prop(thr, -3, true)?;
            ctx.pop(thr)?;
        }
        other => return Err(Error::internal(format!("bad opcode {other}"))),
    }
    Ok(Flow::Next)
}

/// Forward-jump placeholder returned by the branching emitters
#[derive(Debug, Clone, Copy)]
pub struct Label(u32);

/// Builds a `FunctionTemplate` for the toy instruction set
pub struct Asm {
    tpl: FunctionTemplate,
}

impl Asm {
    pub fn new(nargs: u16, nregs: u16) -> Self {
        Asm {
            tpl: FunctionTemplate::new(nargs, nregs),
        }
    }

    pub fn strict(mut self) -> Self {
        self.tpl.strict = true;
        self
    }

    /// Attribute the next instruction to source line `line`
    pub fn line(&mut self, line: u32) -> &mut Self {
        let pc = self.tpl.current_offset();
        self.tpl.add_line_number(pc, line);
        self
    }

    fn op(&mut self, opcode: u8) -> &mut Self {
        self.tpl.emit_u8(opcode);
        self
    }

    fn op_u8(&mut self, opcode: u8, arg: u8) -> &mut Self {
        self.tpl.emit_u8(opcode);
        self.tpl.emit_u8(arg);
        self
    }

    fn op_u16(&mut self, opcode: u8, arg: u16) -> &mut Self {
        self.tpl.emit_u8(opcode);
        self.tpl.emit_u16(arg);
        self
    }

    pub fn num(&mut self, n: f64) -> &mut Self {
        let k = self.tpl.add_constant(Constant::Number(n));
        self.op_u16(op::PUSH_CONST, k)
    }

    pub fn reg(&mut self, r: u8) -> &mut Self {
        self.op_u8(op::PUSH_REG, r)
    }

    pub fn store(&mut self, r: u8) -> &mut Self {
        self.op_u8(op::STORE_REG, r)
    }

    pub fn undef(&mut self) -> &mut Self {
        self.op(op::PUSH_UNDEF)
    }

    pub fn this(&mut self) -> &mut Self {
        self.op(op::PUSH_THIS)
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(op::POP)
    }

    pub fn add(&mut self) -> &mut Self {
        self.op(op::ADD)
    }

    pub fn call(&mut self, nargs: u8) -> &mut Self {
        self.op_u8(op::CALL, nargs)
    }

    pub fn tail_call(&mut self, nargs: u8) -> &mut Self {
        self.op_u8(op::TAIL_CALL, nargs)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(op::RETURN)
    }

    pub fn yield_value(&mut self) -> &mut Self {
        self.op_u8(op::YIELD, 0)
    }

    pub fn yield_error(&mut self) -> &mut Self {
        self.op_u8(op::YIELD, 1)
    }

    pub fn throw(&mut self) -> &mut Self {
        self.op(op::THROW)
    }

    /// Open a try block catching into register `r`; bind the returned label
    /// at the catch entry
    pub fn try_catch(&mut self, r: u8) -> Label {
        self.tpl.emit_u8(op::TRY);
        let at = self.tpl.current_offset();
        self.tpl.emit_u16(0);
        self.tpl.emit_u8(r);
        Label(at)
    }

    pub fn end_try(&mut self) -> &mut Self {
        self.op(op::END_TRY)
    }

    pub fn jump(&mut self) -> Label {
        self.tpl.emit_u8(op::JUMP);
        let at = self.tpl.current_offset();
        self.tpl.emit_u16(0);
        Label(at)
    }

    /// Loop back to `pc`
    pub fn jump_to(&mut self, pc: u16) -> &mut Self {
        self.op_u16(op::JUMP, pc)
    }

    /// Point `label` at the next instruction
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let here = self.tpl.current_offset() as u16;
        self.tpl.patch_u16(label.0, here);
        self
    }

    pub fn here(&self) -> u16 {
        self.tpl.current_offset() as u16
    }

    pub fn get_var(&mut self, name: &str) -> &mut Self {
        let k = self.tpl.add_constant(Constant::String(name.to_string()));
        self.op_u16(op::GET_VAR, k)
    }

    pub fn put_prop(&mut self, name: &str) -> &mut Self {
        let k = self.tpl.add_constant(Constant::String(name.to_string()));
        self.op_u16(op::PUT_PROP, k)
    }

    /// Add an inner function and emit a push of it
    pub fn func(&mut self, inner: FunctionTemplate) -> &mut Self {
        let i = self.tpl.add_inner(inner);
        self.op_u16(op::PUSH_FUNC, i)
    }

    pub fn depth(&mut self) -> &mut Self {
        self.op(op::DEPTH)
    }

    pub fn finish(&mut self) -> FunctionTemplate {
        std::mem::take(&mut self.tpl)
    }
}

/// A context with the toy executor installed
pub fn context() -> Context {
    let mut ctx = Context::new().unwrap();
    ctx.set_executor(Rc::new(TestExecutor));
    ctx
}

/// Define a global binding holding a native function
pub fn define_native(ctx: &mut Context, name: &str, f: tinyrt::NativeFn, nargs: Option<u16>) {
    let thr = ctx.heap_thread();
    let global = ctx.global();
    ctx.push(thr, Value::Object(global)).unwrap();
    ctx.push_native_function(thr, f, nargs, 0).unwrap();
    ctx.put_prop_str(thr, -2, name, true).unwrap();
    ctx.pop(thr).unwrap();
}

/// Call `tpl` from the host with `args`, leaving the result on top
pub fn run(ctx: &mut Context, tpl: &FunctionTemplate, args: &[Value]) -> Result<Value> {
    let thr = ctx.heap_thread();
    ctx.push_compiled_function(thr, tpl, None)?;
    ctx.push(thr, Value::Undefined)?;
    for &a in args {
        ctx.push(thr, a)?;
    }
    ctx.call(thr, args.len())?;
    ctx.get(thr, -1)
}
