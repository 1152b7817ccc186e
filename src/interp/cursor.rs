// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! A cursor over a decoded [`Expression`]'s packed byte buffer.
//!
//! `transcode_expression` (see `decode::expr`) re-encodes every instruction
//! operand at that operand's natural alignment, padding with zero bytes as
//! needed. `ExprCursor` is the symmetric reader: every `read_*` method here
//! advances to the same alignment the corresponding `write_to` call in
//! `decode::expr` would have written at, using the exact same
//! `align_of`/`size_of` computation, so the two stay in lockstep regardless
//! of the concrete layout the compiler picks for any given operand type.

use crate::Allocator;
use crate::types::{
    BlockType, BulkOpcode, CallIndirectOperands, Expression, LabelIdx, MemArg, Opcode, RefType,
    TableCopyOperands, TableInitOperands, ValType,
};

/// A position within a decoded expression's instruction stream.
pub(crate) type Pc = usize;

/// A read-only, copyable cursor over an [`Expression`]'s packed bytes.
#[derive(Clone, Copy)]
pub(crate) struct ExprCursor<'e> {
    data: &'e [u8],
    pos: Pc,
}

impl<'e> ExprCursor<'e> {
    pub(crate) fn new<A: Allocator>(expr: &'e Expression<A>) -> Self {
        Self {
            data: expr.as_ref(),
            pos: 0,
        }
    }

    pub(crate) fn pc(&self) -> Pc {
        self.pos
    }

    pub(crate) fn seek(&mut self, pc: Pc) {
        debug_assert!(pc <= self.data.len());
        self.pos = pc;
    }

    // Repoints this cursor at a different expression's bytes, starting from
    // position zero. Used when a call (or a return through one) switches
    // which function's code body the fetch loop is reading from.
    pub(crate) fn replace_with<A: Allocator>(&mut self, expr: &'e Expression<A>) {
        self.data = expr.as_ref();
        self.pos = 0;
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    // Reads a natively-aligned, packed value of type `T` at the current
    // position, advancing past it. Sound because `transcode_expression` only
    // ever writes a live `T` at this same alignment-derived offset, via the
    // identical `align_of::<T>()`/`size_of::<T>()` computation.
    fn read_pod<T: Copy>(&mut self) -> T {
        let aligned = self.pos.next_multiple_of(align_of::<T>());
        let end = aligned + size_of::<T>();
        debug_assert!(end <= self.data.len(), "read past end of expression");
        // Safety: see method comment above.
        let value = unsafe { self.data.as_ptr().add(aligned).cast::<T>().read() };
        self.pos = end;
        value
    }

    pub(crate) fn read_opcode(&mut self) -> Opcode {
        self.read_pod()
    }

    pub(crate) fn read_block_type(&mut self) -> BlockType {
        self.read_pod()
    }

    pub(crate) fn read_u32(&mut self) -> u32 {
        self.read_pod()
    }

    pub(crate) fn read_i32(&mut self) -> i32 {
        self.read_pod()
    }

    pub(crate) fn read_i64(&mut self) -> i64 {
        self.read_pod()
    }

    pub(crate) fn read_f32(&mut self) -> f32 {
        self.read_pod()
    }

    pub(crate) fn read_f64(&mut self) -> f64 {
        self.read_pod()
    }

    pub(crate) fn read_mem_arg(&mut self) -> MemArg {
        self.read_pod()
    }

    pub(crate) fn read_ref_type(&mut self) -> RefType {
        self.read_pod()
    }

    pub(crate) fn read_call_indirect(&mut self) -> CallIndirectOperands {
        self.read_pod()
    }

    pub(crate) fn read_table_copy(&mut self) -> TableCopyOperands {
        self.read_pod()
    }

    pub(crate) fn read_table_init(&mut self) -> TableInitOperands {
        self.read_pod()
    }

    pub(crate) fn read_bulk_opcode(&mut self) -> BulkOpcode {
        self.read_pod()
    }

    // Skips over a `vec(valtype)`, as written for `select_t`'s operand. The
    // runtime doesn't need the declared types themselves: a Slot carries no
    // type tag, so `select_t` behaves exactly like `select` at execution
    // time once its operand has been skipped.
    pub(crate) fn skip_val_type_vec(&mut self) {
        let len = self.read_u32();
        self.pos += (len as usize) * size_of::<ValType>();
    }

    // Reads the branch target for a `br_table`, given the dynamic index
    // popped off the operand stack. Mirrors BrTableOperands's encoding:
    // `vec(labelidx)` followed by the default `labelidx`.
    pub(crate) fn read_br_table_target(&mut self, index: u32) -> LabelIdx {
        let len = self.read_u32();
        let labels_start = self.pos;
        self.pos = labels_start + (len as usize) * size_of::<LabelIdx>();
        let default = self.read_pod::<LabelIdx>();
        if index < len {
            let offset = labels_start + (index as usize) * size_of::<LabelIdx>();
            let mut peek = Self {
                data: self.data,
                pos: offset,
            };
            peek.read_pod::<LabelIdx>()
        } else {
            default
        }
    }

    // Advances past exactly one instruction's opcode and operand, without
    // interpreting it, mirroring `transcode_expression`'s per-opcode operand
    // dispatch byte for byte. Used by `scan_block_bounds` to walk a block's
    // body without executing it.
    fn skip_one(&mut self) -> Opcode {
        let op = self.read_opcode();
        match op {
            Opcode::Block | Opcode::If | Opcode::Loop => {
                self.read_block_type();
            }
            Opcode::Br
            | Opcode::BrIf
            | Opcode::Call
            | Opcode::GlobalGet
            | Opcode::GlobalSet
            | Opcode::LocalGet
            | Opcode::LocalSet
            | Opcode::LocalTee
            | Opcode::RefFunc
            | Opcode::TableGet
            | Opcode::TableSet => {
                self.read_u32();
            }
            Opcode::BrTable => {
                let len = self.read_u32();
                self.pos += (len as usize) * size_of::<LabelIdx>();
                self.read_pod::<LabelIdx>();
            }
            Opcode::BulkPrefix => self.skip_bulk_op(),
            Opcode::CallIndirect => {
                self.read_call_indirect();
            }
            Opcode::F32Const => {
                self.read_f32();
            }
            Opcode::F32Load
            | Opcode::F32Store
            | Opcode::F64Load
            | Opcode::F64Store
            | Opcode::I32Load
            | Opcode::I32Load8S
            | Opcode::I32Load8U
            | Opcode::I32Load16S
            | Opcode::I32Load16U
            | Opcode::I32Store
            | Opcode::I32Store8
            | Opcode::I32Store16
            | Opcode::I64Load
            | Opcode::I64Load8S
            | Opcode::I64Load8U
            | Opcode::I64Load16S
            | Opcode::I64Load16U
            | Opcode::I64Load32S
            | Opcode::I64Load32U
            | Opcode::I64Store
            | Opcode::I64Store8
            | Opcode::I64Store16
            | Opcode::I64Store32 => {
                self.read_mem_arg();
            }
            Opcode::F64Const => {
                self.read_f64();
            }
            Opcode::I32Const => {
                self.read_i32();
            }
            Opcode::I64Const => {
                self.read_i64();
            }
            Opcode::MemoryGrow | Opcode::MemorySize => {
                // Zero operand bytes: the wire format's reserved byte is read
                // during decode but never written into the packed buffer.
            }
            Opcode::RefNull => {
                self.read_ref_type();
            }
            Opcode::SelectT => self.skip_val_type_vec(),
            Opcode::VectorPrefix => {
                unreachable!("vector instructions never successfully decode")
            }
            _ => {} // No operands.
        }
        op
    }

    fn skip_bulk_op(&mut self) {
        let bulk_op = self.read_bulk_opcode();
        match bulk_op {
            BulkOpcode::DataDrop
            | BulkOpcode::ElemDrop
            | BulkOpcode::TableFill
            | BulkOpcode::TableGrow
            | BulkOpcode::TableSize => {
                self.read_u32();
            }
            BulkOpcode::MemoryCopy | BulkOpcode::MemoryFill => {}
            BulkOpcode::MemoryInit => {
                self.read_u32();
            }
            BulkOpcode::TableCopy => {
                self.read_table_copy();
            }
            BulkOpcode::TableInit => {
                self.read_table_init();
            }
            _ => {} // No operands.
        }
    }

    // Scans forward from just after a `block`/`loop`/`if`'s `BlockType`
    // operand (i.e. `self` positioned at the first instruction of the body)
    // to find the offset of the matching `end`, and, for an `if`, the offset
    // of a matching top-level `else` if one is present before it. Computed
    // once at block-entry time and cached on the `ControlFrame`, so that
    // branches out of the block don't re-scan.
    pub(crate) fn scan_block_bounds(mut self) -> BlockBounds {
        let mut depth = 0u32;
        let mut else_pc = None;
        loop {
            let op = self.skip_one();
            match op {
                Opcode::Block | Opcode::If | Opcode::Loop => depth += 1,
                Opcode::Else if depth == 0 => else_pc = Some(self.pos),
                Opcode::End => {
                    if depth == 0 {
                        return BlockBounds {
                            else_pc,
                            end_pc: self.pos,
                        };
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }
}

/// The cached result of a [`ExprCursor::scan_block_bounds`] call: where a
/// block's body ends, and, for an `if`, where its `else` arm begins.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockBounds {
    pub(crate) else_pc: Option<Pc>,
    pub(crate) end_pc: Pc,
}
