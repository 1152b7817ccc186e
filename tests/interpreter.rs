// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end tests driving the public API over hand-encoded binary
//! modules: decode, link, instantiate, invoke. Each module below is the
//! smallest valid encoding of the feature it exercises, built by hand
//! rather than through a text-format assembler (this crate has none).

use std::rc::Rc;

use wastack::core_compat::alloc::Global;
use wastack::instance;
use wastack::native;
use wastack::{load_module, ModuleRegistry, Value};

// `\0asm` + version 1.
const PREAMBLE: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

fn module_bytes(sections: &[&[u8]]) -> Vec<u8> {
    let mut bytes = PREAMBLE.to_vec();
    for section in sections {
        bytes.extend_from_slice(section);
    }
    bytes
}

#[test]
fn invoke_returns_a_constant() {
    // (func (export "main") (result i32) i32.const 42)
    let type_sec: &[u8] = &[0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f];
    let func_sec: &[u8] = &[0x03, 0x02, 0x01, 0x00];
    let export_sec: &[u8] = &[
        0x07, 0x08, 0x01, 0x04, b'm', b'a', b'i', b'n', 0x00, 0x00,
    ];
    let code_sec: &[u8] = &[0x0a, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2a, 0x0b];
    let bytes = module_bytes(&[type_sec, func_sec, export_sec, code_sec]);

    let module = load_module(&bytes, Global).expect("module decodes and validates");
    let registry = ModuleRegistry::new();
    let instance =
        instance::instantiate(Rc::new(module), &registry).expect("module has no imports to link");

    let results = instance.invoke("main", &[]).expect("main does not trap");
    assert_eq!(results, vec![Value::I32(42)]);
}

#[test]
fn invoke_calls_an_imported_native_function() {
    // (import "env" "add_i32" (func $add (param i32 i32) (result i32)))
    // (func (export "add_two") (param i32 i32) (result i32)
    //   local.get 0
    //   local.get 1
    //   call $add)
    let type_sec: &[u8] = &[0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f];
    let import_sec: &[u8] = &[
        0x02, 0x0f, 0x01, 0x03, b'e', b'n', b'v', 0x07, b'a', b'd', b'd', b'_', b'i', b'3', b'2',
        0x00, 0x00,
    ];
    let func_sec: &[u8] = &[0x03, 0x02, 0x01, 0x00];
    let export_sec: &[u8] = &[
        0x07, 0x0b, 0x01, 0x07, b'a', b'd', b'd', b'_', b't', b'w', b'o', 0x00, 0x01,
    ];
    let code_sec: &[u8] = &[
        0x0a, 0x0a, 0x01, 0x08, 0x00, 0x20, 0x00, 0x20, 0x01, 0x10, 0x00, 0x0b,
    ];
    let bytes = module_bytes(&[type_sec, import_sec, func_sec, export_sec, code_sec]);

    let module = load_module(&bytes, Global).expect("module decodes and validates");
    let mut registry = ModuleRegistry::new();
    registry.register_native(native::env());
    let instance =
        instance::instantiate(Rc::new(module), &registry).expect("add_i32 import resolves");

    let results = instance
        .invoke("add_two", &[Value::I32(17), Value::I32(25)])
        .expect("add_two does not trap");
    assert_eq!(results, vec![Value::I32(42)]);
}

#[test]
fn unresolved_import_fails_to_link() {
    let type_sec: &[u8] = &[0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f];
    let import_sec: &[u8] = &[
        0x02, 0x0f, 0x01, 0x03, b'e', b'n', b'v', 0x07, b'a', b'd', b'd', b'_', b'i', b'3', b'2',
        0x00, 0x00,
    ];
    let bytes = module_bytes(&[type_sec, import_sec]);

    let module = load_module(&bytes, Global).expect("module decodes and validates");
    let registry = ModuleRegistry::new();
    let err = instance::instantiate(Rc::new(module), &registry)
        .expect_err("env module was never registered");
    assert!(matches!(err, instance::LinkError::UnresolvedImport { .. }));
}

#[test]
fn store_and_load_round_trip_through_linear_memory() {
    // (memory 1)
    // (func (export "run") (result i32)
    //   i32.const 0
    //   i32.const 42
    //   i32.store
    //   i32.const 0
    //   i32.load)
    let type_sec: &[u8] = &[0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f];
    let func_sec: &[u8] = &[0x03, 0x02, 0x01, 0x00];
    let mem_sec: &[u8] = &[0x05, 0x03, 0x01, 0x00, 0x01];
    let export_sec: &[u8] = &[
        0x07, 0x07, 0x01, 0x03, b'r', b'u', b'n', 0x00, 0x00,
    ];
    let code_sec: &[u8] = &[
        0x0a, 0x10, 0x01, 0x0e, 0x00, 0x41, 0x00, 0x41, 0x2a, 0x36, 0x02, 0x00, 0x41, 0x00, 0x28,
        0x02, 0x00, 0x0b,
    ];
    let bytes = module_bytes(&[type_sec, func_sec, mem_sec, export_sec, code_sec]);

    let module = load_module(&bytes, Global).expect("module decodes and validates");
    let registry = ModuleRegistry::new();
    let instance =
        instance::instantiate(Rc::new(module), &registry).expect("module has no imports to link");

    let results = instance.invoke("run", &[]).expect("run does not trap");
    assert_eq!(results, vec![Value::I32(42)]);
}

#[test]
fn exported_global_is_readable_and_writable() {
    // (global (export "counter") (mut i32) (i32.const 7))
    let global_sec: &[u8] = &[0x06, 0x06, 0x01, 0x7f, 0x01, 0x41, 0x07, 0x0b];
    let export_sec: &[u8] = &[
        0x07, 0x0b, 0x01, 0x07, b'c', b'o', b'u', b'n', b't', b'e', b'r', 0x03, 0x00,
    ];
    let bytes = module_bytes(&[global_sec, export_sec]);

    let module = load_module(&bytes, Global).expect("module decodes and validates");
    let registry = ModuleRegistry::new();
    let instance =
        instance::instantiate(Rc::new(module), &registry).expect("module has no imports to link");

    assert_eq!(instance.get_global("counter"), Some(Value::I32(7)));

    instance
        .set_global("counter", Value::I32(100))
        .expect("counter is mutable");
    assert_eq!(instance.get_global("counter"), Some(Value::I32(100)));
}
