// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Manual smoke-test binary: loads a module, links it against the standard
//! `env` native module, and invokes a single named export.
//!
//! Not part of `wastack`'s public contract — just a convenient way to point
//! the interpreter at a `.wasm` file by hand while developing.

use std::env as std_env;
use std::process::ExitCode;
use std::rc::Rc;

use wastack::core_compat::alloc::Global;
use wastack::native;
use wastack::{instance, load_module, ModuleRegistry};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = std_env::args().skip(1);
    let (Some(path), Some(export)) = (args.next(), args.next()) else {
        eprintln!("usage: wastack-demo <module.wasm> <export>");
        return ExitCode::FAILURE;
    };

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("failed to read {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let module = match load_module(&bytes, Global) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("failed to load {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut registry = ModuleRegistry::new();
    registry.register_native(native::env());

    let instance = match instance::instantiate(Rc::new(module), &registry) {
        Ok(instance) => instance,
        Err(err) => {
            eprintln!("failed to link {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    match instance.invoke(&export, &[]) {
        Ok(results) => {
            println!("{export} -> {results:?}");
            ExitCode::SUCCESS
        }
        Err(trap) => {
            eprintln!("{export} trapped: {trap}");
            ExitCode::FAILURE
        }
    }
}
