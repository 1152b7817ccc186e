// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The fetch-decode-execute loop.
//!
//! Grounded in the original interpreter's `vm.go` and `vm_numeric.go`:
//! arithmetic and comparison opcodes pop their operands, compute, and push a
//! result, one at a time, off a single shared operand stack. Structured
//! control flow (`block`/`loop`/`if`/`br`/`br_table`/`return`) is grounded in
//! `vm_control.go`, reworked around this crate's flat, pre-scanned
//! [`super::cursor::ExprCursor`] rather than the original's recursive
//! tree-walking interpreter.
//!
//! `br`, `br_if`, `br_table`, and `return` all bottom out in [`branch`]: pop
//! frames down to the target, rewind the operand stack to the target's base
//! pointer plus its branch arity, then either jump (block/loop exit or loop
//! restart) or pop a call frame and resume the caller (or finish the
//! top-level invocation).

use alloc::vec::Vec;

use crate::instance::{FuncInst, Instance};
use crate::interp::cursor::{ExprCursor, Pc};
use crate::interp::stack::{CallerPos, ControlFrame, ControlStack, FrameKind, ValueStack};
use crate::interp::value::Slot;
use crate::interp::{Trap, Value};
use crate::types::Opcode;
use crate::Allocator;

/// What a structured-control instruction did to the fetch loop's program
/// counter.
enum Flow {
    /// Keep executing at the cursor's current position.
    Continue,
    /// Resume execution of the same code body at the given position.
    Jump(Pc),
    /// The top-level invocation has produced its final results.
    Finished(Vec<Slot>),
}

/// Invokes the function at `func_addr` in `instance` with the given
/// arguments, returning its results or the trap that aborted it.
///
/// Calls into another instance (an import) or into a native function recurse
/// as ordinary Rust calls, bounded by the module graph's actual nesting
/// depth; calls within the same instance instead push a new frame onto the
/// invocation's own control stack, so that deeply recursive same-instance
/// calls don't consume Rust stack.
pub(crate) fn invoke<A: Allocator>(
    instance: &Instance<A>,
    func_addr: u32,
    args: &[Value],
) -> Result<Vec<Value>, Trap> {
    match instance.func(func_addr) {
        FuncInst::Local { type_idx, code_idx } => run_local(instance, *type_idx, *code_idx, args),
        FuncInst::Imported { instance: target, index, .. } => invoke(target, *index, args),
        FuncInst::Host(native) => native.call(args).map_err(Trap::Host),
    }
}

// Sets up a fresh pair of stacks for one top-level, same-instance
// invocation, seeds the operand stack with the function's parameters
// followed by its zeroed remaining locals, and runs the fetch loop to
// completion.
fn run_local<A: Allocator>(
    instance: &Instance<A>,
    type_idx: crate::types::TypeIdx,
    code_idx: u32,
    args: &[Value],
) -> Result<Vec<Value>, Trap> {
    let result_types: Vec<crate::types::ValType> =
        instance.function_type(type_idx).results.iter().copied().collect();

    let mut values = ValueStack::new();
    for arg in args {
        values.push(Slot::from_value(*arg));
    }
    for local in instance.locals_of(code_idx) {
        values.push(local_default_slot(*local));
    }

    let mut controls = ControlStack::new();
    controls.push(ControlFrame {
        kind: FrameKind::Call,
        bp: 0,
        branch_arity: result_types.len() as u32,
        label_pc: 0,
        caller: None,
    });

    let mut cursor = ExprCursor::new(instance.code_of(code_idx));
    let slots = run_loop(instance, code_idx, &mut cursor, &mut values, &mut controls)?;
    Ok(slots
        .into_iter()
        .zip(result_types.iter().copied())
        .map(|(slot, ty)| slot.to_value(ty))
        .collect())
}

fn local_default_slot(local: crate::types::Local) -> Slot {
    use crate::types::Local;
    match local {
        Local::I32(v) => Slot::from_i32(v),
        Local::I64(v) => Slot::from_i64(v),
        Local::F32(v) => Slot::from_f32(v),
        Local::F64(v) => Slot::from_f64(v),
        Local::FuncRef(_) => Slot::from_funcref(None),
    }
}

/// Runs the fetch-decode-execute loop against a shared pair of stacks until
/// the outermost `Call` frame returns, switching `code_idx`/cursor whenever a
/// same-instance call pushes or pops a frame.
fn run_loop<'m, A: Allocator>(
    instance: &'m Instance<A>,
    mut code_idx: u32,
    cursor: &mut ExprCursor<'m>,
    values: &mut ValueStack,
    controls: &mut ControlStack,
) -> Result<Vec<Slot>, Trap> {
    loop {
        let op = cursor.read_opcode();
        #[cfg(all(feature = "trace-opcodes", debug_assertions))]
        tracing::trace!(?op, pc = cursor.pc(), "executing opcode");
        match dispatch(instance, &mut code_idx, op, cursor, values, controls)? {
            Flow::Continue => {}
            Flow::Jump(pc) => cursor.seek(pc),
            Flow::Finished(results) => return Ok(results),
        }
    }
}

// Executes exactly one instruction, given its already-consumed opcode.
// Returns how the fetch loop's cursor should move next. `code_idx` is
// updated in place by same-instance calls and returns, since the caller's
// `cursor` must be rebuilt against a different function's code body.
fn dispatch<'m, A: Allocator>(
    instance: &'m Instance<A>,
    code_idx: &mut u32,
    op: Opcode,
    cursor: &mut ExprCursor<'m>,
    values: &mut ValueStack,
    controls: &mut ControlStack,
) -> Result<Flow, Trap> {
    match op {
        Opcode::Unreachable => return Err(Trap::UnreachableExecuted),
        Opcode::Nop => {}

        Opcode::Block | Opcode::Loop => {
            let block_ty = cursor.read_block_type();
            let (params, results) = instance.block_arity(block_ty);
            let bounds = cursor.scan_block_bounds();
            let bp = values.len() - params as usize;
            let (branch_arity, label_pc) = if op == Opcode::Loop {
                (params, cursor.pc())
            } else {
                (results, bounds.end_pc)
            };
            controls.push(ControlFrame {
                kind: if op == Opcode::Loop { FrameKind::Loop } else { FrameKind::Block },
                bp,
                branch_arity,
                label_pc,
                caller: None,
            });
        }

        Opcode::If => {
            let block_ty = cursor.read_block_type();
            let (params, results) = instance.block_arity(block_ty);
            let bounds = cursor.scan_block_bounds();
            let cond = values.pop().is_truthy();
            let bp = values.len() - params as usize;
            if !cond && bounds.else_pc.is_none() {
                // No `else` clause and the branch isn't taken: the jump lands
                // past the matching `end`, so no frame should be pushed —
                // there's nothing left to pop it.
                return Ok(Flow::Jump(bounds.end_pc));
            }
            controls.push(ControlFrame {
                kind: FrameKind::If,
                bp,
                branch_arity: results,
                label_pc: bounds.end_pc,
                caller: None,
            });
            if !cond {
                return Ok(Flow::Jump(bounds.else_pc.unwrap_or(bounds.end_pc)));
            }
        }

        Opcode::Else => {
            let frame = controls.pop();
            values.rewind_to(frame.bp, frame.branch_arity as usize);
            return Ok(Flow::Jump(frame.label_pc));
        }

        Opcode::End => {
            let frame = controls.pop();
            values.rewind_to(frame.bp, frame.branch_arity as usize);
            if let FrameKind::Call = frame.kind {
                return Ok(resume_or_finish(instance, code_idx, cursor, values, frame));
            }
        }

        Opcode::Br => {
            let depth = cursor.read_u32();
            return Ok(branch(depth, instance, code_idx, cursor, values, controls));
        }
        Opcode::BrIf => {
            let depth = cursor.read_u32();
            if values.pop().is_truthy() {
                return Ok(branch(depth, instance, code_idx, cursor, values, controls));
            }
        }
        Opcode::BrTable => {
            let index = values.pop().to_u32();
            let label = cursor.read_br_table_target(index);
            return Ok(branch(*label, instance, code_idx, cursor, values, controls));
        }
        Opcode::Return => {
            let depth = controls.depth_to_nearest_call();
            return Ok(branch(depth, instance, code_idx, cursor, values, controls));
        }

        Opcode::Call => {
            let func_addr = cursor.read_u32();
            dispatch_call(instance, func_addr, code_idx, cursor, values, controls)?;
        }
        Opcode::CallIndirect => {
            let operands = cursor.read_call_indirect();
            let table_index = values.pop().to_u32();
            let func_addr = instance
                .table_func(*operands.table, table_index)?
                .ok_or(Trap::UninitializedElement)?;
            let declared = instance.function_type(operands.ty);
            let actual = instance.func_signature(func_addr);
            if &declared.parameters[..] != actual.parameters || &declared.results[..] != actual.results {
                return Err(Trap::IndirectCallTypeMismatch);
            }
            dispatch_call(instance, func_addr, code_idx, cursor, values, controls)?;
        }

        Opcode::Drop => {
            values.pop();
        }
        Opcode::Select | Opcode::SelectT => {
            if op == Opcode::SelectT {
                cursor.skip_val_type_vec();
            }
            let cond = values.pop().is_truthy();
            let b = values.pop();
            let a = values.pop();
            values.push(if cond { a } else { b });
        }

        Opcode::LocalGet => {
            let idx = cursor.read_u32();
            let frame = controls.call_frame();
            values.push(values.get(frame.bp + idx as usize));
        }
        Opcode::LocalSet => {
            let idx = cursor.read_u32();
            let frame = controls.call_frame();
            let slot = values.pop();
            values.set(frame.bp + idx as usize, slot);
        }
        Opcode::LocalTee => {
            let idx = cursor.read_u32();
            let frame = controls.call_frame();
            let slot = values.get(values.len() - 1);
            values.set(frame.bp + idx as usize, slot);
        }
        Opcode::GlobalGet => {
            let idx = cursor.read_u32();
            values.push(instance.global_get(idx));
        }
        Opcode::GlobalSet => {
            let idx = cursor.read_u32();
            let slot = values.pop();
            instance.global_set(idx, slot)?;
        }

        Opcode::TableGet | Opcode::TableSet | Opcode::RefNull | Opcode::RefIsNull | Opcode::RefFunc => {
            return Err(Trap::Unsupported(op));
        }

        Opcode::MemorySize => {
            values.push(Slot::from_i32(instance.memory_size_pages(0) as i32));
        }
        Opcode::MemoryGrow => {
            let delta = values.pop().to_i32() as u32;
            let result = instance.memory_grow(0, delta).map_or(-1, |v| v as i32);
            values.push(Slot::from_i32(result));
        }

        Opcode::BulkPrefix => return exec_bulk(cursor, values),
        Opcode::VectorPrefix => unreachable!("vector instructions never successfully decode"),

        Opcode::F32Load
        | Opcode::F64Load
        | Opcode::I32Load
        | Opcode::I32Load8S
        | Opcode::I32Load8U
        | Opcode::I32Load16S
        | Opcode::I32Load16U
        | Opcode::I64Load
        | Opcode::I64Load8S
        | Opcode::I64Load8U
        | Opcode::I64Load16S
        | Opcode::I64Load16U
        | Opcode::I64Load32S
        | Opcode::I64Load32U => exec_load(instance, op, cursor, values)?,

        Opcode::F32Store
        | Opcode::F64Store
        | Opcode::I32Store
        | Opcode::I32Store8
        | Opcode::I32Store16
        | Opcode::I64Store
        | Opcode::I64Store8
        | Opcode::I64Store16
        | Opcode::I64Store32 => exec_store(instance, op, cursor, values)?,

        Opcode::I32Const => values.push(Slot::from_i32(cursor.read_i32())),
        Opcode::I64Const => values.push(Slot::from_i64(cursor.read_i64())),
        Opcode::F32Const => values.push(Slot::from_f32(cursor.read_f32())),
        Opcode::F64Const => values.push(Slot::from_f64(cursor.read_f64())),

        _ => exec_numeric(op, values)?,
    }
    Ok(Flow::Continue)
}

fn resume_or_finish<'m, A: Allocator>(
    instance: &'m Instance<A>,
    code_idx: &mut u32,
    cursor: &mut ExprCursor<'m>,
    values: &mut ValueStack,
    frame: ControlFrame,
) -> Flow {
    match frame.caller {
        Some(caller) => {
            *code_idx = caller.code_idx;
            cursor.replace_with(instance.code_of(*code_idx));
            cursor.seek(caller.pc);
            Flow::Continue
        }
        None => Flow::Finished(collect_top(values, frame.branch_arity)),
    }
}

fn collect_top(values: &mut ValueStack, arity: u32) -> Vec<Slot> {
    let len = values.len();
    (0..arity as usize).map(|i| values.get(len - arity as usize + i)).collect()
}

// `br`/`br_if`/`br_table`/`return` all reduce to this: pop `depth + 1`
// control frames, rewind the operand stack to the target frame's base
// pointer plus its branch arity, then either restart a loop, jump past a
// block/if, or pop a call frame (resuming the caller, or finishing the
// top-level invocation).
fn branch<'m, A: Allocator>(
    depth: u32,
    instance: &'m Instance<A>,
    code_idx: &mut u32,
    cursor: &mut ExprCursor<'m>,
    values: &mut ValueStack,
    controls: &mut ControlStack,
) -> Flow {
    for _ in 0..depth {
        controls.pop();
    }
    let target = controls.top();
    match target.kind {
        FrameKind::Loop => {
            values.rewind_to(target.bp, target.branch_arity as usize);
            Flow::Jump(target.label_pc)
        }
        FrameKind::Block | FrameKind::If => {
            controls.pop();
            values.rewind_to(target.bp, target.branch_arity as usize);
            Flow::Jump(target.label_pc)
        }
        FrameKind::Call => {
            controls.pop();
            values.rewind_to(target.bp, target.branch_arity as usize);
            resume_or_finish(instance, code_idx, cursor, values, target)
        }
    }
}

// Resolves and invokes `func_addr`, either by pushing a new `Call` frame
// onto the shared stacks (a same-instance call) or by recursing through
// `invoke` (a cross-instance import or a host function).
fn dispatch_call<'m, A: Allocator>(
    instance: &'m Instance<A>,
    func_addr: u32,
    code_idx: &mut u32,
    cursor: &mut ExprCursor<'m>,
    values: &mut ValueStack,
    controls: &mut ControlStack,
) -> Result<(), Trap> {
    match instance.func(func_addr) {
        FuncInst::Local { type_idx, code_idx: target_code_idx } => {
            let func_ty = instance.function_type(*type_idx);
            let params = func_ty.parameters.len() as u32;
            let results = func_ty.results.len() as u32;
            let target_code_idx = *target_code_idx;
            let bp = values.len() - params as usize;
            for local in instance.locals_of(target_code_idx) {
                values.push(local_default_slot(*local));
            }
            controls.push(ControlFrame {
                kind: FrameKind::Call,
                bp,
                branch_arity: results,
                label_pc: 0,
                caller: Some(CallerPos { code_idx: *code_idx, pc: cursor.pc() }),
            });
            *code_idx = target_code_idx;
            cursor.replace_with(instance.code_of(*code_idx));
            cursor.seek(0);
        }
        FuncInst::Imported { .. } | FuncInst::Host(_) => {
            let signature = instance.func_signature(func_addr);
            let params = signature.parameters;
            let args = values.pop_typed_args(params);
            let results = invoke(instance, func_addr, &args)?;
            values.push_results(&results);
        }
    }
    Ok(())
}

fn exec_load<A: Allocator>(
    instance: &Instance<A>,
    op: Opcode,
    cursor: &mut ExprCursor<'_>,
    values: &mut ValueStack,
) -> Result<(), Trap> {
    let mem_arg = cursor.read_mem_arg();
    let base = values.pop().to_u32();
    let addr = (base as u64).checked_add(mem_arg.offset as u64).ok_or(Trap::MemoryOutOfBounds)?;
    macro_rules! load {
        ($ty:ty, $wrap:expr) => {{
            let mut buf = [0u8; size_of::<$ty>()];
            instance.memory_read(0, addr, &mut buf)?;
            $wrap(<$ty>::from_le_bytes(buf))
        }};
    }
    let slot = match op {
        Opcode::I32Load => load!(i32, Slot::from_i32),
        Opcode::I64Load => load!(i64, Slot::from_i64),
        Opcode::F32Load => load!(f32, Slot::from_f32),
        Opcode::F64Load => load!(f64, Slot::from_f64),
        Opcode::I32Load8S => load!(i8, |v: i8| Slot::from_i32(v as i32)),
        Opcode::I32Load8U => load!(u8, |v: u8| Slot::from_i32(v as i32)),
        Opcode::I32Load16S => load!(i16, |v: i16| Slot::from_i32(v as i32)),
        Opcode::I32Load16U => load!(u16, |v: u16| Slot::from_i32(v as i32)),
        Opcode::I64Load8S => load!(i8, |v: i8| Slot::from_i64(v as i64)),
        Opcode::I64Load8U => load!(u8, |v: u8| Slot::from_i64(v as i64)),
        Opcode::I64Load16S => load!(i16, |v: i16| Slot::from_i64(v as i64)),
        Opcode::I64Load16U => load!(u16, |v: u16| Slot::from_i64(v as i64)),
        Opcode::I64Load32S => load!(i32, |v: i32| Slot::from_i64(v as i64)),
        Opcode::I64Load32U => load!(u32, |v: u32| Slot::from_i64(v as i64)),
        _ => unreachable!(),
    };
    values.push(slot);
    Ok(())
}

fn exec_store<A: Allocator>(
    instance: &Instance<A>,
    op: Opcode,
    cursor: &mut ExprCursor<'_>,
    values: &mut ValueStack,
) -> Result<(), Trap> {
    let mem_arg = cursor.read_mem_arg();
    let slot = values.pop();
    let base = values.pop().to_u32();
    let addr = (base as u64).checked_add(mem_arg.offset as u64).ok_or(Trap::MemoryOutOfBounds)?;
    match op {
        Opcode::I32Store => instance.memory_write(0, addr, &slot.to_i32().to_le_bytes()),
        Opcode::I64Store => instance.memory_write(0, addr, &slot.to_i64().to_le_bytes()),
        Opcode::F32Store => instance.memory_write(0, addr, &slot.to_f32().to_le_bytes()),
        Opcode::F64Store => instance.memory_write(0, addr, &slot.to_f64().to_le_bytes()),
        Opcode::I32Store8 => instance.memory_write(0, addr, &(slot.to_i32() as u8).to_le_bytes()),
        Opcode::I32Store16 => instance.memory_write(0, addr, &(slot.to_i32() as u16).to_le_bytes()),
        Opcode::I64Store8 => instance.memory_write(0, addr, &(slot.to_i64() as u8).to_le_bytes()),
        Opcode::I64Store16 => instance.memory_write(0, addr, &(slot.to_i64() as u16).to_le_bytes()),
        Opcode::I64Store32 => instance.memory_write(0, addr, &(slot.to_i64() as u32).to_le_bytes()),
        _ => unreachable!(),
    }
}

fn exec_bulk(cursor: &mut ExprCursor<'_>, values: &mut ValueStack) -> Result<Flow, Trap> {
    use crate::types::BulkOpcode;

    let bulk_op = cursor.read_bulk_opcode();
    match bulk_op {
        BulkOpcode::I32TruncSatF32S => {
            let v = values.pop().to_f32();
            values.push(Slot::from_i32(trunc_sat_f32_s32(v)));
        }
        BulkOpcode::I32TruncSatF32U => {
            let v = values.pop().to_f32();
            values.push(Slot::from_i32(trunc_sat_f32_u32(v) as i32));
        }
        BulkOpcode::I32TruncSatF64S => {
            let v = values.pop().to_f64();
            values.push(Slot::from_i32(trunc_sat_f64_s32(v)));
        }
        BulkOpcode::I32TruncSatF64U => {
            let v = values.pop().to_f64();
            values.push(Slot::from_i32(trunc_sat_f64_u32(v) as i32));
        }
        BulkOpcode::I64TruncSatF32S => {
            let v = values.pop().to_f32();
            values.push(Slot::from_i64(trunc_sat_f32_s64(v)));
        }
        BulkOpcode::I64TruncSatF32U => {
            let v = values.pop().to_f32();
            values.push(Slot::from_i64(trunc_sat_f32_u64(v) as i64));
        }
        BulkOpcode::I64TruncSatF64S => {
            let v = values.pop().to_f64();
            values.push(Slot::from_i64(trunc_sat_f64_s64(v)));
        }
        BulkOpcode::I64TruncSatF64U => {
            let v = values.pop().to_f64();
            values.push(Slot::from_i64(trunc_sat_f64_u64(v) as i64));
        }
        _ => return Err(Trap::Unsupported(Opcode::BulkPrefix)),
    }
    Ok(Flow::Continue)
}

fn trunc_sat_f32_s32(v: f32) -> i32 {
    if v.is_nan() { 0 } else { v.clamp(i32::MIN as f32, i32::MAX as f32) as i32 }
}
fn trunc_sat_f32_u32(v: f32) -> u32 {
    if v.is_nan() || v < 0.0 { 0 } else { v.clamp(0.0, u32::MAX as f32) as u32 }
}
fn trunc_sat_f64_s32(v: f64) -> i32 {
    if v.is_nan() { 0 } else { v.clamp(i32::MIN as f64, i32::MAX as f64) as i32 }
}
fn trunc_sat_f64_u32(v: f64) -> u32 {
    if v.is_nan() || v < 0.0 { 0 } else { v.clamp(0.0, u32::MAX as f64) as u32 }
}
fn trunc_sat_f32_s64(v: f32) -> i64 {
    if v.is_nan() { 0 } else { v.clamp(i64::MIN as f32, i64::MAX as f32) as i64 }
}
fn trunc_sat_f32_u64(v: f32) -> u64 {
    if v.is_nan() || v < 0.0 { 0 } else { v.clamp(0.0, u64::MAX as f32) as u64 }
}
fn trunc_sat_f64_s64(v: f64) -> i64 {
    if v.is_nan() { 0 } else { v.clamp(i64::MIN as f64, i64::MAX as f64) as i64 }
}
fn trunc_sat_f64_u64(v: f64) -> u64 {
    if v.is_nan() || v < 0.0 { 0 } else { v.clamp(0.0, u64::MAX as f64) as u64 }
}

// Every remaining opcode that reaches here is a plain numeric instruction:
// pop its operands, compute, push the result. Grouped by type rather than by
// opcode value, mirroring the original interpreter's `vm_numeric.go` layout.
fn exec_numeric(op: Opcode, values: &mut ValueStack) -> Result<(), Trap> {
    macro_rules! binop_i32 {
        ($f:expr) => {{ let b = values.pop().to_i32(); let a = values.pop().to_i32(); values.push(Slot::from_i32($f(a, b))); }};
    }
    macro_rules! binop_u32 {
        ($f:expr) => {{ let b = values.pop().to_u32(); let a = values.pop().to_u32(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! cmp_i32 {
        ($f:expr) => {{ let b = values.pop().to_i32(); let a = values.pop().to_i32(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! cmp_u32 {
        ($f:expr) => {{ let b = values.pop().to_u32(); let a = values.pop().to_u32(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! binop_i64 {
        ($f:expr) => {{ let b = values.pop().to_i64(); let a = values.pop().to_i64(); values.push(Slot::from_i64($f(a, b))); }};
    }
    macro_rules! binop_u64 {
        ($f:expr) => {{ let b = values.pop().to_u64(); let a = values.pop().to_u64(); values.push(Slot::from_i64($f(a, b) as i64)); }};
    }
    macro_rules! cmp_i64 {
        ($f:expr) => {{ let b = values.pop().to_i64(); let a = values.pop().to_i64(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! cmp_u64 {
        ($f:expr) => {{ let b = values.pop().to_u64(); let a = values.pop().to_u64(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! binop_f32 {
        ($f:expr) => {{ let b = values.pop().to_f32(); let a = values.pop().to_f32(); values.push(Slot::from_f32($f(a, b))); }};
    }
    macro_rules! cmp_f32 {
        ($f:expr) => {{ let b = values.pop().to_f32(); let a = values.pop().to_f32(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! binop_f64 {
        ($f:expr) => {{ let b = values.pop().to_f64(); let a = values.pop().to_f64(); values.push(Slot::from_f64($f(a, b))); }};
    }
    macro_rules! cmp_f64 {
        ($f:expr) => {{ let b = values.pop().to_f64(); let a = values.pop().to_f64(); values.push(Slot::from_i32($f(a, b) as i32)); }};
    }
    macro_rules! unop_f32 {
        ($f:expr) => {{ let a = values.pop().to_f32(); values.push(Slot::from_f32($f(a))); }};
    }
    macro_rules! unop_f64 {
        ($f:expr) => {{ let a = values.pop().to_f64(); values.push(Slot::from_f64($f(a))); }};
    }

    match op {
        Opcode::I32Eqz => { let a = values.pop().to_i32(); values.push(Slot::from_i32((a == 0) as i32)); }
        Opcode::I32Eq => cmp_i32!(|a, b| a == b),
        Opcode::I32Ne => cmp_i32!(|a, b| a != b),
        Opcode::I32LtS => cmp_i32!(|a, b| a < b),
        Opcode::I32LtU => cmp_u32!(|a, b| a < b),
        Opcode::I32GtS => cmp_i32!(|a, b| a > b),
        Opcode::I32GtU => cmp_u32!(|a, b| a > b),
        Opcode::I32LeS => cmp_i32!(|a, b| a <= b),
        Opcode::I32LeU => cmp_u32!(|a, b| a <= b),
        Opcode::I32GeS => cmp_i32!(|a, b| a >= b),
        Opcode::I32GeU => cmp_u32!(|a, b| a >= b),

        Opcode::I32Clz => { let a = values.pop().to_i32(); values.push(Slot::from_i32(a.leading_zeros() as i32)); }
        Opcode::I32Ctz => { let a = values.pop().to_i32(); values.push(Slot::from_i32(a.trailing_zeros() as i32)); }
        Opcode::I32Popcnt => { let a = values.pop().to_i32(); values.push(Slot::from_i32(a.count_ones() as i32)); }
        Opcode::I32Add => binop_i32!(|a: i32, b: i32| a.wrapping_add(b)),
        Opcode::I32Sub => binop_i32!(|a: i32, b: i32| a.wrapping_sub(b)),
        Opcode::I32Mul => binop_i32!(|a: i32, b: i32| a.wrapping_mul(b)),
        Opcode::I32DivS => {
            let b = values.pop().to_i32();
            let a = values.pop().to_i32();
            if b == 0 { return Err(Trap::DivisionByZero); }
            if a == i32::MIN && b == -1 { return Err(Trap::IntegerOverflow); }
            values.push(Slot::from_i32(a / b));
        }
        Opcode::I32DivU => {
            let b = values.pop().to_u32();
            let a = values.pop().to_u32();
            if b == 0 { return Err(Trap::DivisionByZero); }
            values.push(Slot::from_i32((a / b) as i32));
        }
        Opcode::I32RemS => {
            let b = values.pop().to_i32();
            let a = values.pop().to_i32();
            if b == 0 { return Err(Trap::DivisionByZero); }
            values.push(Slot::from_i32(a.wrapping_rem(b)));
        }
        Opcode::I32RemU => {
            let b = values.pop().to_u32();
            let a = values.pop().to_u32();
            if b == 0 { return Err(Trap::DivisionByZero); }
            values.push(Slot::from_i32((a % b) as i32));
        }
        Opcode::I32And => binop_i32!(|a: i32, b: i32| a & b),
        Opcode::I32Or => binop_i32!(|a: i32, b: i32| a | b),
        Opcode::I32Xor => binop_i32!(|a: i32, b: i32| a ^ b),
        Opcode::I32Shl => binop_u32!(|a: u32, b: u32| a.wrapping_shl(b)),
        Opcode::I32ShrS => binop_i32!(|a: i32, b: i32| a.wrapping_shr(b as u32)),
        Opcode::I32ShrU => binop_u32!(|a: u32, b: u32| a.wrapping_shr(b)),
        Opcode::I32Rotl => binop_u32!(|a: u32, b: u32| a.rotate_left(b)),
        Opcode::I32Rotr => binop_u32!(|a: u32, b: u32| a.rotate_right(b)),
        Opcode::I32Extend8S => { let a = values.pop().to_i32(); values.push(Slot::from_i32((a as i8) as i32)); }
        Opcode::I32Extend16S => { let a = values.pop().to_i32(); values.push(Slot::from_i32((a as i16) as i32)); }

        Opcode::I64Eqz => { let a = values.pop().to_i64(); values.push(Slot::from_i32((a == 0) as i32)); }
        Opcode::I64Eq => cmp_i64!(|a, b| a == b),
        Opcode::I64Ne => cmp_i64!(|a, b| a != b),
        Opcode::I64LtS => cmp_i64!(|a, b| a < b),
        Opcode::I64LtU => cmp_u64!(|a, b| a < b),
        Opcode::I64GtS => cmp_i64!(|a, b| a > b),
        Opcode::I64GtU => cmp_u64!(|a, b| a > b),
        Opcode::I64LeS => cmp_i64!(|a, b| a <= b),
        Opcode::I64LeU => cmp_u64!(|a, b| a <= b),
        Opcode::I64GeS => cmp_i64!(|a, b| a >= b),
        Opcode::I64GeU => cmp_u64!(|a, b| a >= b),

        Opcode::I64Clz => { let a = values.pop().to_i64(); values.push(Slot::from_i64(a.leading_zeros() as i64)); }
        Opcode::I64Ctz => { let a = values.pop().to_i64(); values.push(Slot::from_i64(a.trailing_zeros() as i64)); }
        Opcode::I64Popcnt => { let a = values.pop().to_i64(); values.push(Slot::from_i64(a.count_ones() as i64)); }
        Opcode::I64Add => binop_i64!(|a: i64, b: i64| a.wrapping_add(b)),
        Opcode::I64Sub => binop_i64!(|a: i64, b: i64| a.wrapping_sub(b)),
        Opcode::I64Mul => binop_i64!(|a: i64, b: i64| a.wrapping_mul(b)),
        Opcode::I64DivS => {
            let b = values.pop().to_i64();
            let a = values.pop().to_i64();
            if b == 0 { return Err(Trap::DivisionByZero); }
            if a == i64::MIN && b == -1 { return Err(Trap::IntegerOverflow); }
            values.push(Slot::from_i64(a / b));
        }
        Opcode::I64DivU => {
            let b = values.pop().to_u64();
            let a = values.pop().to_u64();
            if b == 0 { return Err(Trap::DivisionByZero); }
            values.push(Slot::from_i64((a / b) as i64));
        }
        Opcode::I64RemS => {
            let b = values.pop().to_i64();
            let a = values.pop().to_i64();
            if b == 0 { return Err(Trap::DivisionByZero); }
            values.push(Slot::from_i64(a.wrapping_rem(b)));
        }
        Opcode::I64RemU => {
            let b = values.pop().to_u64();
            let a = values.pop().to_u64();
            if b == 0 { return Err(Trap::DivisionByZero); }
            values.push(Slot::from_i64((a % b) as i64));
        }
        Opcode::I64And => binop_i64!(|a: i64, b: i64| a & b),
        Opcode::I64Or => binop_i64!(|a: i64, b: i64| a | b),
        Opcode::I64Xor => binop_i64!(|a: i64, b: i64| a ^ b),
        Opcode::I64Shl => binop_u64!(|a: u64, b: u64| a.wrapping_shl(b as u32)),
        Opcode::I64ShrS => binop_i64!(|a: i64, b: i64| a.wrapping_shr(b as u32)),
        Opcode::I64ShrU => binop_u64!(|a: u64, b: u64| a.wrapping_shr(b as u32)),
        Opcode::I64Rotl => binop_u64!(|a: u64, b: u64| a.rotate_left(b as u32)),
        Opcode::I64Rotr => binop_u64!(|a: u64, b: u64| a.rotate_right(b as u32)),
        Opcode::I64Extend8S => { let a = values.pop().to_i64(); values.push(Slot::from_i64((a as i8) as i64)); }
        Opcode::I64Extend16S => { let a = values.pop().to_i64(); values.push(Slot::from_i64((a as i16) as i64)); }
        Opcode::I64Extend32S => { let a = values.pop().to_i64(); values.push(Slot::from_i64((a as i32) as i64)); }

        Opcode::F32Eq => cmp_f32!(|a, b| a == b),
        Opcode::F32Ne => cmp_f32!(|a, b| a != b),
        Opcode::F32Lt => cmp_f32!(|a, b| a < b),
        Opcode::F32Gt => cmp_f32!(|a, b| a > b),
        Opcode::F32Le => cmp_f32!(|a, b| a <= b),
        Opcode::F32Ge => cmp_f32!(|a, b| a >= b),
        Opcode::F32Abs => unop_f32!(f32::abs),
        Opcode::F32Neg => unop_f32!(|a: f32| -a),
        Opcode::F32Ceil => unop_f32!(f32::ceil),
        Opcode::F32Floor => unop_f32!(f32::floor),
        Opcode::F32Trunc => unop_f32!(f32::trunc),
        Opcode::F32Nearest => unop_f32!(round_ties_even_f32),
        Opcode::F32Sqrt => unop_f32!(f32::sqrt),
        Opcode::F32Add => binop_f32!(|a: f32, b: f32| a + b),
        Opcode::F32Sub => binop_f32!(|a: f32, b: f32| a - b),
        Opcode::F32Mul => binop_f32!(|a: f32, b: f32| a * b),
        Opcode::F32Div => binop_f32!(|a: f32, b: f32| a / b),
        Opcode::F32Min => binop_f32!(wasm_min_f32),
        Opcode::F32Max => binop_f32!(wasm_max_f32),
        Opcode::F32Copysign => binop_f32!(f32::copysign),

        Opcode::F64Eq => cmp_f64!(|a, b| a == b),
        Opcode::F64Ne => cmp_f64!(|a, b| a != b),
        Opcode::F64Lt => cmp_f64!(|a, b| a < b),
        Opcode::F64Gt => cmp_f64!(|a, b| a > b),
        Opcode::F64Le => cmp_f64!(|a, b| a <= b),
        Opcode::F64Ge => cmp_f64!(|a, b| a >= b),
        Opcode::F64Abs => unop_f64!(f64::abs),
        Opcode::F64Neg => unop_f64!(|a: f64| -a),
        Opcode::F64Ceil => unop_f64!(f64::ceil),
        Opcode::F64Floor => unop_f64!(f64::floor),
        Opcode::F64Trunc => unop_f64!(f64::trunc),
        Opcode::F64Nearest => unop_f64!(round_ties_even_f64),
        Opcode::F64Sqrt => unop_f64!(f64::sqrt),
        Opcode::F64Add => binop_f64!(|a: f64, b: f64| a + b),
        Opcode::F64Sub => binop_f64!(|a: f64, b: f64| a - b),
        Opcode::F64Mul => binop_f64!(|a: f64, b: f64| a * b),
        Opcode::F64Div => binop_f64!(|a: f64, b: f64| a / b),
        Opcode::F64Min => binop_f64!(wasm_min_f64),
        Opcode::F64Max => binop_f64!(wasm_max_f64),
        Opcode::F64Copysign => binop_f64!(f64::copysign),

        Opcode::I32WrapI64 => { let a = values.pop().to_i64(); values.push(Slot::from_i32(a as i32)); }
        Opcode::I64ExtendI32S => { let a = values.pop().to_i32(); values.push(Slot::from_i64(a as i64)); }
        Opcode::I64ExtendI32U => { let a = values.pop().to_u32(); values.push(Slot::from_i64(a as i64)); }
        Opcode::I32TruncF32S => { let a = values.pop().to_f32(); values.push(Slot::from_i32(checked_trunc(a, i32::MIN as f32, i32::MAX as f32)? as i32)); }
        Opcode::I32TruncF32U => { let a = values.pop().to_f32(); values.push(Slot::from_i32(checked_trunc(a, 0.0, u32::MAX as f32)? as u32 as i32)); }
        Opcode::I32TruncF64S => { let a = values.pop().to_f64(); values.push(Slot::from_i32(checked_trunc(a, i32::MIN as f64, i32::MAX as f64)? as i32)); }
        Opcode::I32TruncF64U => { let a = values.pop().to_f64(); values.push(Slot::from_i32(checked_trunc(a, 0.0, u32::MAX as f64)? as u32 as i32)); }
        Opcode::I64TruncF32S => { let a = values.pop().to_f32(); values.push(Slot::from_i64(checked_trunc(a, i64::MIN as f32, i64::MAX as f32)? as i64)); }
        Opcode::I64TruncF32U => { let a = values.pop().to_f32(); values.push(Slot::from_i64(checked_trunc(a, 0.0, u64::MAX as f32)? as u64 as i64)); }
        Opcode::I64TruncF64S => { let a = values.pop().to_f64(); values.push(Slot::from_i64(checked_trunc(a, i64::MIN as f64, i64::MAX as f64)? as i64)); }
        Opcode::I64TruncF64U => { let a = values.pop().to_f64(); values.push(Slot::from_i64(checked_trunc(a, 0.0, u64::MAX as f64)? as u64 as i64)); }
        Opcode::F32ConvertI32S => { let a = values.pop().to_i32(); values.push(Slot::from_f32(a as f32)); }
        Opcode::F32ConvertI32U => { let a = values.pop().to_u32(); values.push(Slot::from_f32(a as f32)); }
        Opcode::F32ConvertI64S => { let a = values.pop().to_i64(); values.push(Slot::from_f32(a as f32)); }
        Opcode::F32ConvertI64U => { let a = values.pop().to_u64(); values.push(Slot::from_f32(a as f32)); }
        Opcode::F32DemoteF64 => { let a = values.pop().to_f64(); values.push(Slot::from_f32(a as f32)); }
        Opcode::F64ConvertI32S => { let a = values.pop().to_i32(); values.push(Slot::from_f64(a as f64)); }
        Opcode::F64ConvertI32U => { let a = values.pop().to_u32(); values.push(Slot::from_f64(a as f64)); }
        Opcode::F64ConvertI64S => { let a = values.pop().to_i64(); values.push(Slot::from_f64(a as f64)); }
        Opcode::F64ConvertI64U => { let a = values.pop().to_u64(); values.push(Slot::from_f64(a as f64)); }
        Opcode::F64PromoteF32 => { let a = values.pop().to_f32(); values.push(Slot::from_f64(a as f64)); }
        Opcode::I32ReinterpretF32 => { let a = values.pop().to_f32(); values.push(Slot::from_i32(a.to_bits() as i32)); }
        Opcode::I64ReinterpretF64 => { let a = values.pop().to_f64(); values.push(Slot::from_i64(a.to_bits() as i64)); }
        Opcode::F32ReinterpretI32 => { let a = values.pop().to_i32(); values.push(Slot::from_f32(f32::from_bits(a as u32))); }
        Opcode::F64ReinterpretI64 => { let a = values.pop().to_i64(); values.push(Slot::from_f64(f64::from_bits(a as u64))); }

        _ => unreachable!("opcode {op:?} handled elsewhere"),
    }
    Ok(())
}

fn checked_trunc<F>(v: F, min: F, max: F) -> Result<F, Trap>
where
    F: PartialOrd + Copy,
{
    // `v != v` catches NaN without requiring a dedicated float trait bound.
    if v != v || v < min || v > max {
        return Err(Trap::InvalidConversion);
    }
    Ok(v)
}

fn wasm_min_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 }
    } else {
        a.min(b)
    }
}
fn wasm_max_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 }
    } else {
        a.max(b)
    }
}
fn wasm_min_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 }
    } else {
        a.min(b)
    }
}
fn wasm_max_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 }
    } else {
        a.max(b)
    }
}
fn round_ties_even_f32(v: f32) -> f32 {
    let rounded = v.round();
    if (v - v.trunc()).abs() == 0.5 && (rounded as i64) % 2 != 0 { rounded - v.signum() } else { rounded }
}
fn round_ties_even_f64(v: f64) -> f64 {
    let rounded = v.round();
    if (v - v.trunc()).abs() == 0.5 && (rounded as i64) % 2 != 0 { rounded - v.signum() } else { rounded }
}
