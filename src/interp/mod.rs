// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The stack-machine interpreter: value representation, the per-invocation
//! operand/control stacks, the expression cursor, and the fetch-decode-
//! execute loop itself.
//!
//! Grounded throughout in the original interpreter's `vm*.go` files, adapted
//! to this crate's flattened, pre-decoded `Expression` byte buffers (see
//! `decode::expr`) rather than the original's tree-shaped instruction lists.

pub(crate) mod cursor;
pub(crate) mod exec;
mod stack;
mod value;

use core::fmt;

pub(crate) use value::Slot;
pub use value::Value;

use crate::native::HostError;
use crate::types::Opcode;

/// A runtime error raised by instruction execution.
///
/// Unlike [`crate::LoadError`] or [`crate::instance::LinkError`], a `Trap`
/// does not indicate a malformed or unlinkable module: it is raised by
/// otherwise-valid code encountering a runtime condition the WebAssembly
/// specification defines as a trap (e.g. division by zero, an out-of-bounds
/// memory access, an indirect call through a mismatched signature).
pub enum Trap {
    /// A float-to-integer conversion (`i32.trunc_f32_s` and friends) found no
    /// representable target value (`NaN`, or a value outside the target
    /// type's range).
    InvalidConversion,
    /// An integer division or remainder overflowed (`i32.min / -1`).
    IntegerOverflow,
    /// Integer division or remainder by zero.
    DivisionByZero,
    /// A memory access fell outside the linear memory's current bounds.
    MemoryOutOfBounds,
    /// A table access fell outside the table's current bounds.
    TableOutOfBounds,
    /// A `call_indirect` resolved to an empty table slot.
    UninitializedElement,
    /// A `call_indirect`'s resolved function signature did not match the
    /// instruction's declared type.
    IndirectCallTypeMismatch,
    /// A `global.set` targeted an immutable global.
    ImmutableGlobal,
    /// A value did not have the type the operation expected (surfaced at the
    /// public facade, e.g. `Instance::set_global`, since there is no
    /// expression type-checking pass to catch it earlier).
    TypeMismatch,
    /// An `unreachable` instruction executed.
    UnreachableExecuted,
    /// A recognized but unimplemented opcode was dispatched: any post-MVP
    /// reference-types or bulk-memory/table opcode other than the
    /// saturating truncation family, or any SIMD instruction.
    Unsupported(Opcode),
    /// A host (native) function returned an error.
    Host(HostError),
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::InvalidConversion => write!(f, "invalid conversion to integer"),
            Trap::IntegerOverflow => write!(f, "integer overflow"),
            Trap::DivisionByZero => write!(f, "integer division by zero"),
            Trap::MemoryOutOfBounds => write!(f, "out of bounds memory access"),
            Trap::TableOutOfBounds => write!(f, "out of bounds table access"),
            Trap::UninitializedElement => write!(f, "uninitialized element"),
            Trap::IndirectCallTypeMismatch => write!(f, "indirect call type mismatch"),
            Trap::ImmutableGlobal => write!(f, "cannot set an immutable global"),
            Trap::TypeMismatch => write!(f, "value type mismatch"),
            Trap::UnreachableExecuted => write!(f, "unreachable executed"),
            Trap::Unsupported(op) => write!(f, "unsupported opcode ({op:?})"),
            Trap::Host(err) => write!(f, "host function error: {err:?}"),
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Trap {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Trap::Host(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for Trap {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Trap::Host(err) => Some(err),
            _ => None,
        }
    }
}
