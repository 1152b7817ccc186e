// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The uniform value representation the operand stack is built from.
//!
//! Grounded in the original interpreter's `stack_operand.go`: every value on
//! the operand stack, regardless of its WebAssembly type, is stored as a
//! single 64-bit word. Floats are reinterpreted through their bit patterns
//! (`math.Float32bits`/`Float64bits` in the original) rather than stored as
//! floats directly, so the stack itself never needs to know what type a slot
//! holds; that's tracked separately by the type-checked code that pushed it.

use crate::types::ValType;

// A non-null funcref's index is stored in the low 32 bits; bit 32 marks the
// slot as non-null, so the all-zero encoding doubles as a null reference
// without needing a separate niche.
const FUNCREF_PRESENT: u64 = 1 << 32;

/// A single operand-stack slot: 64 bits wide, reinterpreted as whichever
/// WebAssembly type the instruction stream expects at that point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Slot(u64);

impl Slot {
    pub(crate) fn from_i32(value: i32) -> Self {
        Self(u64::from(value as u32))
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub(crate) fn from_f32(value: f32) -> Self {
        Self(u64::from(value.to_bits()))
    }

    pub(crate) fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    pub(crate) fn from_funcref(value: Option<u32>) -> Self {
        match value {
            Some(index) => Self(FUNCREF_PRESENT | u64::from(index)),
            None => Self(0),
        }
    }

    pub(crate) fn to_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub(crate) fn to_u32(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn to_i64(self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn to_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn to_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub(crate) fn to_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub(crate) fn to_funcref(self) -> Option<u32> {
        if self.0 & FUNCREF_PRESENT != 0 {
            Some(self.0 as u32)
        } else {
            None
        }
    }

    pub(crate) fn from_value(value: Value) -> Self {
        match value {
            Value::I32(v) => Self::from_i32(v),
            Value::I64(v) => Self::from_i64(v),
            Value::F32(v) => Self::from_f32(v),
            Value::F64(v) => Self::from_f64(v),
            Value::FuncRef(v) => Self::from_funcref(v),
        }
    }

    pub(crate) fn to_value(self, ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(self.to_i32()),
            ValType::I64 => Value::I64(self.to_i64()),
            ValType::F32 => Value::F32(self.to_f32()),
            ValType::F64 => Value::F64(self.to_f64()),
            ValType::FuncRef => Value::FuncRef(self.to_funcref()),
            ValType::Vec | ValType::ExternRef => {
                unreachable!("vectors and externrefs never reach the operand stack")
            }
        }
    }

    pub(crate) fn is_truthy(self) -> bool {
        self.to_i32() != 0
    }
}

/// A WebAssembly runtime value, typed and ready for a host to inspect.
///
/// This is the public, typed counterpart to the untyped [`Slot`] the VM
/// actually operates on; values cross the host/VM boundary (arguments,
/// results, globals) as `Value`, never as a bare `Slot`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Function reference, or `None` for a null reference.
    FuncRef(Option<u32>),
}

impl Value {
    /// The [`ValType`] this value belongs to.
    pub fn ty(self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::FuncRef(_) => ValType::FuncRef,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_integers() {
        assert_eq!(Slot::from_i32(-1).to_i32(), -1);
        assert_eq!(Slot::from_i32(i32::MIN).to_i32(), i32::MIN);
        assert_eq!(Slot::from_i64(-1).to_i64(), -1);
        assert_eq!(Slot::from_i64(i64::MIN).to_i64(), i64::MIN);
    }

    #[test]
    fn round_trips_floats_by_bit_pattern() {
        assert_eq!(Slot::from_f32(f32::NAN).to_f32().to_bits(), f32::NAN.to_bits());
        assert_eq!(Slot::from_f64(-0.0).to_f64().to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn null_funcref_is_the_zero_slot() {
        assert_eq!(Slot::from_funcref(None), Slot::default());
        assert_eq!(Slot::from_funcref(None).to_funcref(), None);
        assert_eq!(Slot::from_funcref(Some(7)).to_funcref(), Some(7));
    }

    #[test]
    fn value_round_trips_through_a_slot() {
        for value in [
            Value::I32(-5),
            Value::I64(9_000_000_000),
            Value::F32(1.5),
            Value::F64(2.5),
            Value::FuncRef(Some(3)),
        ] {
            assert_eq!(Slot::from_value(value).to_value(value.ty()), value);
        }
    }

    #[test]
    fn truthiness_follows_i32_nonzero() {
        assert!(Slot::from_i32(1).is_truthy());
        assert!(!Slot::from_i32(0).is_truthy());
    }
}
