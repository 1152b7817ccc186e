// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The runtime stacks an invocation executes against.
//!
//! Grounded in the original interpreter's `vm.go`: a single operand stack is
//! shared across every WebAssembly-level call frame nested within one
//! top-level invocation (a function's locals live at its call frame's base
//! pointer on this same stack, not in a separate array), alongside a control
//! stack of frames tracking the base pointer and branch target for every
//! open block, loop, if, and call. `br`, `br_if`, `br_table`, and `return`
//! all bottom out in the same "pop frames, rewind the operand stack, jump"
//! primitive (see `exec::branch`).
//!
//! Unlike the original's tree-shaped per-block instruction slices, this
//! implementation's expressions are flat, packed byte buffers (see
//! `decode::expr`). Rather than re-walking a block's body on every branch to
//! find where it ends, a block's bounds are scanned once, at the point the
//! `block`/`loop`/`if` is entered, and cached on its `ControlFrame`.

use alloc::vec::Vec;

use crate::interp::cursor::Pc;
use crate::interp::value::Slot;
use crate::types::ValType;
use crate::{Value, interp::value};

/// The shared operand stack for one top-level invocation.
#[derive(Debug, Default)]
pub(crate) struct ValueStack(Vec<Slot>);

impl ValueStack {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn push(&mut self, slot: Slot) {
        self.0.push(slot);
    }

    pub(crate) fn pop(&mut self) -> Slot {
        self.0.pop().expect("operand stack underflow")
    }

    pub(crate) fn get(&self, index: usize) -> Slot {
        self.0[index]
    }

    pub(crate) fn set(&mut self, index: usize, slot: Slot) {
        self.0[index] = slot;
    }

    // Shifts the top `arity` slots down to start at `bp`, truncating
    // everything above them. Used to unwind the stack across a branch,
    // block exit, or function return: the values a branch/return carries
    // with it end up exactly where the target frame's inputs began.
    pub(crate) fn rewind_to(&mut self, bp: usize, arity: usize) {
        let keep_from = self.0.len() - arity;
        for i in 0..arity {
            self.0[bp + i] = self.0[keep_from + i];
        }
        self.0.truncate(bp + arity);
    }

    pub(crate) fn pop_typed_args(&mut self, types: &[ValType]) -> Vec<Value> {
        let base = self.0.len() - types.len();
        let args = (0..types.len())
            .map(|i| self.0[base + i].to_value(types[i]))
            .collect();
        self.0.truncate(base);
        args
    }

    pub(crate) fn push_results(&mut self, results: &[Value]) {
        for value in results {
            self.0.push(value::Slot::from_value(*value));
        }
    }
}

/// What kind of structured construct a [`ControlFrame`] represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FrameKind {
    Block,
    Loop,
    If,
    Call,
}

/// Where to resume in the caller once a `Call` frame's function returns.
/// `None` for the outermost frame of a top-level invocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CallerPos {
    pub(crate) code_idx: u32,
    pub(crate) pc: Pc,
}

/// A single entry on the control stack, tracking one open block, loop, if, or
/// call frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ControlFrame {
    pub(crate) kind: FrameKind,

    /// Operand-stack index where this frame's inputs (parameters, for a call
    /// or loop; none, for a labelless block entry) begin.
    pub(crate) bp: usize,

    /// Number of operand-stack slots preserved when a branch targets this
    /// frame: a loop's declared parameter count (branching restarts it) or a
    /// block/if/call's declared result count (branching exits past it).
    pub(crate) branch_arity: u32,

    /// Where a branch targeting this frame resumes execution: a loop body's
    /// first instruction, or a block/if's matching `end`. Unused (and
    /// meaningless) for `Call` frames, which resume via `caller` instead.
    pub(crate) label_pc: Pc,

    /// Where to resume in the calling function once this frame's function
    /// returns. Only meaningful for `Call` frames.
    pub(crate) caller: Option<CallerPos>,
}

/// The control stack for one top-level invocation.
#[derive(Debug, Default)]
pub(crate) struct ControlStack(Vec<ControlFrame>);

impl ControlStack {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn push(&mut self, frame: ControlFrame) {
        self.0.push(frame);
    }

    pub(crate) fn pop(&mut self) -> ControlFrame {
        self.0.pop().expect("control stack underflow")
    }

    pub(crate) fn top(&self) -> ControlFrame {
        *self.0.last().expect("control stack is empty")
    }

    // Finds the nearest enclosing `Call` frame, whose base pointer is where
    // the currently-executing function's locals begin. `local.get` and
    // friends index relative to it rather than to the innermost block/loop/if
    // frame, which carries no locals of its own.
    pub(crate) fn call_frame(&self) -> ControlFrame {
        *self
            .0
            .iter()
            .rev()
            .find(|frame| frame.kind == FrameKind::Call)
            .expect("no enclosing call frame")
    }

    // Number of frames between the top of the stack and the nearest
    // enclosing `Call` frame, inclusive of any open blocks/loops/ifs but not
    // of the call frame itself. `return` branches this many levels so that
    // `branch()` lands on the current function's own call frame rather than
    // unwinding past it to whatever invoked it.
    pub(crate) fn depth_to_nearest_call(&self) -> u32 {
        self.0
            .iter()
            .rev()
            .position(|frame| frame.kind == FrameKind::Call)
            .expect("no enclosing call frame") as u32
    }
}
