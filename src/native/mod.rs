// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Host (native) function adapters.
//!
//! Grounded in the original interpreter's `native` package: a tiny module of
//! Go closures (`add_i32`, `print_char`, `print_int`) registered under
//! string names and presented to the linker as an ordinary [`Module`] whose
//! functions happen to be implemented in the host language rather than
//! decoded bytecode. This module is the idiomatic-Rust expression of the
//! same idea: a [`NativeModule`] builder accumulates named, typed handlers,
//! type-erased behind `Rc<dyn Fn(...)>` so the linker can treat a native
//! module and a decoded-and-linked [`crate::Instance`] identically — both
//! just produce a list of named, typed exports.

extern crate alloc;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::Value;
use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec as CVec;
use crate::types::{FunctionType, ResultType, ValType};

/// An opaque error returned by a host function, wrapped into
/// [`crate::Trap::Host`] when it crosses back into the VM.
#[derive(Debug)]
pub struct HostError(Box<str>);

impl HostError {
    /// Constructs a host error carrying the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into().into_boxed_str())
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HostError {}

#[cfg(not(feature = "std"))]
impl core::error::Error for HostError {}

type Handler = Rc<dyn Fn(&[Value]) -> Result<Vec<Value>, HostError>>;

pub(crate) struct NativeFunction {
    pub(crate) ty: FunctionType<Global>,
    pub(crate) handler: Handler,
}

impl NativeFunction {
    pub(crate) fn call(&self, args: &[Value]) -> Result<Vec<Value>, HostError> {
        (self.handler)(args)
    }
}

/// A host module: a named collection of functions implemented natively
/// rather than decoded from WebAssembly bytecode.
///
/// Registered into a [`crate::ModuleRegistry`] alongside ordinary linked
/// instances, a `NativeModule` is a valid import source for any module that
/// declares a matching import; the linker does not distinguish the two.
pub struct NativeModule {
    pub(crate) name: String,
    pub(crate) functions: Vec<(String, Rc<NativeFunction>)>,
}

impl NativeModule {
    /// Starts building an empty native module with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Registers a function under `name`, callable by any module importing
    /// it with the given parameter and result types.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        param_types: &[ValType],
        result_types: &[ValType],
        handler: impl Fn(&[Value]) -> Result<Vec<Value>, HostError> + 'static,
    ) -> &mut Self {
        let ty = FunctionType {
            parameters: CVec::from(param_types),
            results: ResultType::new(CVec::from(result_types)),
        };
        self.functions.push((
            name.into(),
            Rc::new(NativeFunction {
                ty,
                handler: Rc::new(handler),
            }),
        ));
        self
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&Rc<NativeFunction>> {
        self.functions
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, func)| func)
    }
}

/// The standard `env` host module: `add_i32`, `print_char`, and `print_int`,
/// matching the functions the original interpreter exposed for its own
/// manual and unit testing.
pub fn env() -> NativeModule {
    let mut module = NativeModule::new("env");

    module.register(
        "add_i32",
        &[ValType::I32, ValType::I32],
        &[ValType::I32],
        |args| match (args[0], args[1]) {
            (Value::I32(a), Value::I32(b)) => Ok(alloc::vec![Value::I32(a.wrapping_add(b))]),
            _ => Err(HostError::new("add_i32: expected two i32 arguments")),
        },
    );

    module.register("print_char", &[ValType::I32], &[], |args| match args[0] {
        Value::I32(code) => {
            if let Some(ch) = char::from_u32(code as u32) {
                #[cfg(feature = "std")]
                print!("{ch}");
                #[cfg(not(feature = "std"))]
                let _ = ch;
            }
            Ok(Vec::new())
        }
        _ => Err(HostError::new("print_char: expected an i32 argument")),
    });

    module.register("print_int", &[ValType::I32], &[], |args| match args[0] {
        Value::I32(value) => {
            #[cfg(feature = "std")]
            print!("{value}");
            #[cfg(not(feature = "std"))]
            let _ = value;
            Ok(Vec::new())
        }
        _ => Err(HostError::new("print_int: expected an i32 argument")),
    });

    module
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_i32_wraps_on_overflow() {
        let env = env();
        let add = env.lookup("add_i32").expect("add_i32 is registered");
        let result = add.call(&[Value::I32(i32::MAX), Value::I32(1)]).unwrap();
        assert_eq!(result, alloc::vec![Value::I32(i32::MIN)]);
    }

    #[test]
    fn add_i32_rejects_wrong_argument_types() {
        let env = env();
        let add = env.lookup("add_i32").expect("add_i32 is registered");
        assert!(add.call(&[Value::F32(1.0), Value::I32(1)]).is_err());
    }

    #[test]
    fn print_functions_accept_an_i32_and_return_nothing() {
        let env = env();
        let print_char = env.lookup("print_char").expect("print_char is registered");
        assert_eq!(print_char.call(&[Value::I32('!' as i32)]).unwrap(), Vec::new());

        let print_int = env.lookup("print_int").expect("print_int is registered");
        assert_eq!(print_int.call(&[Value::I32(42)]).unwrap(), Vec::new());
    }

    #[test]
    fn lookup_of_unknown_function_is_none() {
        assert!(env().lookup("does_not_exist").is_none());
    }
}
