// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Instantiation and linking: turning a decoded, validated [`crate::Module`]
//! into a live [`Instance`] by resolving its imports against a
//! [`ModuleRegistry`], allocating its own tables, memories, and globals, and
//! running its element and data segments and start function.
//!
//! Grounded in the original interpreter's `instance` package
//! (`instance.go`/`instance_module.go`): instantiation walks the import
//! section first, binding each import to an already-linked instance or
//! native module drawn from a registry keyed by module name, then allocates
//! storage for the module's own tables/memories/globals before applying
//! element and data segments and, finally, invoking the start function if
//! present.
//!
//! Unlike the original, which gives every instance-local table, memory, and
//! global its own private slot, this crate wraps each one individually in
//! `Rc<RefCell<_>>`: an imported table/memory/global is a cloned `Rc`
//! pointing at the exporting instance's own cell, so that a write through
//! either instance's index is visible to both immediately, matching
//! WebAssembly's shared-identity import semantics.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use crate::interp::cursor::ExprCursor;
use crate::interp::{exec, Slot, Trap, Value};
use crate::native::{NativeFunction, NativeModule};
use crate::types::{
    BlockType, DataMode, ElementInit, ElementMode, Expression, ExportDescriptor, FuncIdx,
    FunctionType, GlobalTypeMutability, ImportDescriptor, MemType, Opcode, TableType, TypeIdx,
    ValType,
};
use crate::{Allocator, Module};

const ABSOLUTE_MAX_MEMORY_PAGES: u32 = 1 << 16;

/// Runtime state of one linear memory.
#[derive(Debug)]
pub(crate) struct MemoryInst {
    max_pages: Option<u32>,
    data: Vec<u8>,
}

impl MemoryInst {
    fn new(ty: MemType) -> Self {
        Self {
            max_pages: ty.max,
            data: alloc::vec![0u8; ty.min_size_bytes()],
        }
    }

    pub(crate) fn size_pages(&self) -> u32 {
        (self.data.len() / MemType::PAGE_SIZE) as u32
    }

    pub(crate) fn grow(&mut self, delta_pages: u32) -> Option<u32> {
        let current = self.size_pages();
        let target = current.checked_add(delta_pages)?;
        if target > ABSOLUTE_MAX_MEMORY_PAGES {
            return None;
        }
        if let Some(max) = self.max_pages {
            if target > max {
                return None;
            }
        }
        self.data.resize((target as usize) * MemType::PAGE_SIZE, 0);
        Some(current)
    }
}

/// Runtime state of one table.
#[derive(Debug)]
pub(crate) struct TableInst {
    max: Option<u32>,
    elems: Vec<Option<u32>>,
}

impl TableInst {
    fn new(ty: TableType) -> Self {
        Self {
            max: ty.max_elements(),
            elems: alloc::vec![None; ty.min_elements() as usize],
        }
    }
}

/// Runtime state of one global.
#[derive(Debug)]
pub(crate) struct GlobalInst {
    mutability: GlobalTypeMutability,
    value: Slot,
}

/// A resolved function in an instance's function index space: either a
/// module-local function (decoded bytecode), a function forwarded from
/// another instance (an import), or a native host function.
pub(crate) enum FuncInst<A: Allocator> {
    Local {
        type_idx: TypeIdx,
        code_idx: u32,
    },
    Imported {
        instance: Rc<Instance<A>>,
        index: u32,
        #[allow(dead_code)] // retained for symmetry/debugging; resolved eagerly at link time
        type_idx: TypeIdx,
    },
    Host(Rc<NativeFunction>),
}

/// A function's signature, erased of any particular allocator, for
/// comparing a `call_indirect`'s declared type against the type actually
/// found at the resolved table slot.
pub(crate) struct FuncSignature<'a> {
    pub(crate) parameters: &'a [ValType],
    pub(crate) results: &'a [ValType],
}

/// A linked, runnable WebAssembly module instance.
///
/// Produced by [`instantiate`]; every table, memory, and global an instance
/// exposes lives behind its own `Rc<RefCell<_>>` cell, so importing one of
/// them aliases the exporter's storage rather than copying it.
pub struct Instance<A: Allocator> {
    module: Rc<Module<A>>,
    funcs: Vec<FuncInst<A>>,
    tables: Vec<Rc<RefCell<TableInst>>>,
    memories: Vec<Rc<RefCell<MemoryInst>>>,
    globals: Vec<Rc<RefCell<GlobalInst>>>,
}

impl<A: Allocator> Instance<A> {
    pub(crate) fn func(&self, addr: u32) -> &FuncInst<A> {
        &self.funcs[addr as usize]
    }

    pub(crate) fn function_type(&self, idx: TypeIdx) -> &FunctionType<A> {
        &self.module.typesec[*idx as usize]
    }

    pub(crate) fn func_signature(&self, addr: u32) -> FuncSignature<'_> {
        match self.func(addr) {
            FuncInst::Local { type_idx, .. } => {
                let ty = self.function_type(*type_idx);
                FuncSignature { parameters: &ty.parameters[..], results: &ty.results[..] }
            }
            FuncInst::Imported { instance, index, .. } => instance.func_signature(*index),
            FuncInst::Host(native) => {
                FuncSignature { parameters: &native.ty.parameters[..], results: &native.ty.results[..] }
            }
        }
    }

    pub(crate) fn block_arity(&self, bt: BlockType) -> (u32, u32) {
        match bt {
            BlockType::Empty => (0, 0),
            BlockType::Result(_) => (0, 1),
            BlockType::TypeIndex(idx) => {
                let ty = self.function_type(idx);
                (ty.parameters.len() as u32, ty.results.len() as u32)
            }
        }
    }

    pub(crate) fn locals_of(&self, code_idx: u32) -> &[crate::types::Local] {
        &self.module.codesec[code_idx as usize].locals[..]
    }

    pub(crate) fn code_of(&self, code_idx: u32) -> &Expression<A> {
        &self.module.codesec[code_idx as usize].code
    }

    pub(crate) fn global_get(&self, idx: u32) -> Slot {
        self.globals[idx as usize].borrow().value
    }

    pub(crate) fn global_set(&self, idx: u32, slot: Slot) -> Result<(), Trap> {
        let mut global = self.globals[idx as usize].borrow_mut();
        if global.mutability != GlobalTypeMutability::Var {
            return Err(Trap::ImmutableGlobal);
        }
        global.value = slot;
        Ok(())
    }

    pub(crate) fn table_func(&self, table_idx: u32, index: u32) -> Result<Option<u32>, Trap> {
        let table = self.tables[table_idx as usize].borrow();
        table.elems.get(index as usize).copied().ok_or(Trap::TableOutOfBounds)
    }

    pub(crate) fn memory_size_pages(&self, mem_idx: u32) -> u32 {
        self.memories[mem_idx as usize].borrow().size_pages()
    }

    pub(crate) fn memory_grow(&self, mem_idx: u32, delta: u32) -> Option<u32> {
        let result = self.memories[mem_idx as usize].borrow_mut().grow(delta);
        match result {
            Some(previous) => tracing::debug!(mem_idx, delta, previous, "memory grown"),
            None => tracing::debug!(mem_idx, delta, "memory grow failed: would exceed limit"),
        }
        result
    }

    pub(crate) fn memory_read(&self, mem_idx: u32, addr: u64, buf: &mut [u8]) -> Result<(), Trap> {
        let mem = self.memories[mem_idx as usize].borrow();
        let start = usize::try_from(addr).map_err(|_| Trap::MemoryOutOfBounds)?;
        let end = start.checked_add(buf.len()).ok_or(Trap::MemoryOutOfBounds)?;
        let src = mem.data.get(start..end).ok_or(Trap::MemoryOutOfBounds)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn memory_write(&self, mem_idx: u32, addr: u64, bytes: &[u8]) -> Result<(), Trap> {
        let mut mem = self.memories[mem_idx as usize].borrow_mut();
        let start = usize::try_from(addr).map_err(|_| Trap::MemoryOutOfBounds)?;
        let end = start.checked_add(bytes.len()).ok_or(Trap::MemoryOutOfBounds)?;
        let dst = mem.data.get_mut(start..end).ok_or(Trap::MemoryOutOfBounds)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Looks up an export by name.
    pub fn get_export(&self, name: &str) -> Option<ExportRef> {
        self.module.exportsec.iter().find_map(|export| {
            let field: &str = export.field.as_ref();
            if field != name {
                return None;
            }
            Some(match export.descriptor {
                ExportDescriptor::Function(idx) => ExportRef::Function(*idx),
                ExportDescriptor::Table(idx) => ExportRef::Table(*idx),
                ExportDescriptor::Memory(idx) => ExportRef::Memory(*idx),
                ExportDescriptor::Global(idx) => ExportRef::Global(*idx),
            })
        })
    }

    /// Invokes the exported function `name` with `args`.
    #[tracing::instrument(level = "debug", skip(self, args))]
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let func_addr = match self.get_export(name) {
            Some(ExportRef::Function(idx)) => idx,
            _ => return Err(Trap::TypeMismatch),
        };
        exec::invoke(self, func_addr, args).inspect_err(|trap| {
            tracing::warn!(%trap, "function invocation trapped");
        })
    }

    /// Reads the current value of an exported global.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let idx = match self.get_export(name)? {
            ExportRef::Global(idx) => idx,
            _ => return None,
        };
        let global = self.globals[idx as usize].borrow();
        Some(global.value.to_value(self.global_value_type(idx)))
    }

    /// Sets the value of an exported mutable global.
    pub fn set_global(&self, name: &str, value: Value) -> Result<(), Trap> {
        let idx = match self.get_export(name) {
            Some(ExportRef::Global(idx)) => idx,
            _ => return Err(Trap::TypeMismatch),
        };
        if value.ty() != self.global_value_type(idx) {
            return Err(Trap::TypeMismatch);
        }
        self.global_set(idx, Slot::from_value(value))
    }

    // The global index space is imported globals (in import order) followed
    // by the module's own declarations, exactly like the function index
    // space; `idx` below is always such a unified index, never a bare
    // `globalsec` position.
    fn global_value_type(&self, idx: u32) -> ValType {
        let n_imported = self.imported_global_count();
        if (idx as usize) < n_imported {
            self.imported_global_type(idx)
        } else {
            self.module.globalsec[idx as usize - n_imported].ty.value
        }
    }

    fn imported_global_count(&self) -> usize {
        self.module
            .importsec
            .iter()
            .filter(|import| matches!(import.descriptor, ImportDescriptor::Global(_)))
            .count()
    }

    fn imported_global_type(&self, idx: u32) -> ValType {
        let mut count = 0u32;
        for import in self.module.importsec.iter() {
            if let ImportDescriptor::Global(ty) = import.descriptor {
                if count == idx {
                    return ty.value;
                }
                count += 1;
            }
        }
        unreachable!("global index out of range")
    }
}

/// What kind of entity an export (or import resolution) refers to, together
/// with its index in the owning instance's corresponding index space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExportRef {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

/// Something a module can be linked against: a previously instantiated
/// module, or a native module of host functions.
enum LinkTarget<A: Allocator> {
    Instance(Rc<Instance<A>>),
    Native(Rc<NativeModule>),
}

/// A set of named link targets an [`instantiate`] call resolves imports
/// against, mirroring the original interpreter's notion of a shared registry
/// of already-instantiated modules.
pub struct ModuleRegistry<A: Allocator> {
    modules: BTreeMap<String, LinkTarget<A>>,
}

impl<A: Allocator> ModuleRegistry<A> {
    pub fn new() -> Self {
        Self { modules: BTreeMap::new() }
    }

    /// Makes `instance`'s exports available to subsequent [`instantiate`]
    /// calls under `name`.
    pub fn register_instance(&mut self, name: impl Into<String>, instance: Rc<Instance<A>>) {
        self.modules.insert(name.into(), LinkTarget::Instance(instance));
    }

    /// Makes a native module's functions available under its own name.
    pub fn register_native(&mut self, native: NativeModule) {
        let name = native.name.clone();
        self.modules.insert(name, LinkTarget::Native(Rc::new(native)));
    }
}

impl<A: Allocator> Default for ModuleRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure to link a decoded module against a [`ModuleRegistry`].
pub enum LinkError {
    UnresolvedImport { module: String, field: String },
    KindMismatch { module: String, field: String },
    IncompatibleImport { module: String, field: String },
    SegmentOutOfBounds(Trap),
    StartTrapped(Trap),
}

impl fmt::Debug for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::UnresolvedImport { module, field } => {
                write!(f, "unresolved import {module}.{field}")
            }
            LinkError::KindMismatch { module, field } => {
                write!(f, "import {module}.{field} resolved to the wrong kind of entity")
            }
            LinkError::IncompatibleImport { module, field } => {
                write!(f, "import {module}.{field} is incompatible with its declared type")
            }
            LinkError::SegmentOutOfBounds(trap) => {
                write!(f, "active segment initialization out of bounds: {trap:?}")
            }
            LinkError::StartTrapped(trap) => write!(f, "start function trapped: {trap:?}"),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::StartTrapped(trap) | LinkError::SegmentOutOfBounds(trap) => Some(trap),
            _ => None,
        }
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            LinkError::StartTrapped(trap) | LinkError::SegmentOutOfBounds(trap) => Some(trap),
            _ => None,
        }
    }
}

/// Resolves `module`'s imports against `registry`, allocates its own
/// tables/memories/globals, applies its element and data segments, and (if
/// present) invokes its start function, producing a linked [`Instance`].
#[tracing::instrument(level = "debug", skip(module, registry))]
pub fn instantiate<A: Allocator>(
    module: Rc<Module<A>>,
    registry: &ModuleRegistry<A>,
) -> Result<Rc<Instance<A>>, LinkError> {
    let mut funcs = Vec::new();
    let mut tables: Vec<Rc<RefCell<TableInst>>> = Vec::new();
    let mut memories: Vec<Rc<RefCell<MemoryInst>>> = Vec::new();
    let mut globals: Vec<Rc<RefCell<GlobalInst>>> = Vec::new();

    for import in module.importsec.iter() {
        let module_name: &str = import.module.as_ref();
        let field_name: &str = import.field.as_ref();
        let err = |kind: fn(String, String) -> LinkError| {
            kind(String::from(module_name), String::from(field_name))
        };

        let target = registry
            .modules
            .get(module_name)
            .ok_or_else(|| err(|m, f| LinkError::UnresolvedImport { module: m, field: f }))?;

        match (import.descriptor, target) {
            (ImportDescriptor::Function(type_idx), LinkTarget::Instance(exporter)) => {
                let export = exporter
                    .get_export(field_name)
                    .ok_or_else(|| err(|m, f| LinkError::UnresolvedImport { module: m, field: f }))?;
                let ExportRef::Function(index) = export else {
                    return Err(err(|m, f| LinkError::KindMismatch { module: m, field: f }));
                };
                let declared = &module.typesec[*type_idx as usize];
                let actual = exporter.func_signature(index);
                if &declared.parameters[..] != actual.parameters || &declared.results[..] != actual.results {
                    return Err(err(|m, f| LinkError::IncompatibleImport { module: m, field: f }));
                }
                funcs.push(FuncInst::Imported { instance: Rc::clone(exporter), index, type_idx });
            }
            (ImportDescriptor::Function(_), LinkTarget::Native(native)) => {
                let handler = native
                    .lookup(field_name)
                    .ok_or_else(|| err(|m, f| LinkError::UnresolvedImport { module: m, field: f }))?;
                funcs.push(FuncInst::Host(Rc::clone(handler)));
            }
            (ImportDescriptor::Table(expected), LinkTarget::Instance(exporter)) => {
                let export = exporter
                    .get_export(field_name)
                    .ok_or_else(|| err(|m, f| LinkError::UnresolvedImport { module: m, field: f }))?;
                let ExportRef::Table(index) = export else {
                    return Err(err(|m, f| LinkError::KindMismatch { module: m, field: f }));
                };
                let cell = Rc::clone(&exporter.tables[index as usize]);
                if !limits_contained(expected.min_elements(), expected.max_elements(), &cell.borrow()) {
                    return Err(err(|m, f| LinkError::IncompatibleImport { module: m, field: f }));
                }
                tables.push(cell);
            }
            (ImportDescriptor::Memory(expected), LinkTarget::Instance(exporter)) => {
                let export = exporter
                    .get_export(field_name)
                    .ok_or_else(|| err(|m, f| LinkError::UnresolvedImport { module: m, field: f }))?;
                let ExportRef::Memory(index) = export else {
                    return Err(err(|m, f| LinkError::KindMismatch { module: m, field: f }));
                };
                let cell = Rc::clone(&exporter.memories[index as usize]);
                {
                    let mem = cell.borrow();
                    if mem.size_pages() < expected.min || !max_contained(expected.max, mem.max_pages) {
                        return Err(err(|m, f| LinkError::IncompatibleImport { module: m, field: f }));
                    }
                }
                memories.push(cell);
            }
            (ImportDescriptor::Global(expected), LinkTarget::Instance(exporter)) => {
                let export = exporter
                    .get_export(field_name)
                    .ok_or_else(|| err(|m, f| LinkError::UnresolvedImport { module: m, field: f }))?;
                let ExportRef::Global(index) = export else {
                    return Err(err(|m, f| LinkError::KindMismatch { module: m, field: f }));
                };
                let cell = Rc::clone(&exporter.globals[index as usize]);
                let actual_ty = exporter.global_value_type(index);
                if actual_ty != expected.value || cell.borrow().mutability != expected.mutability {
                    return Err(err(|m, f| LinkError::IncompatibleImport { module: m, field: f }));
                }
                globals.push(cell);
            }
            _ => return Err(err(|m, f| LinkError::KindMismatch { module: m, field: f })),
        }
    }

    for (local_idx, type_idx) in module.funcsec.iter().enumerate() {
        funcs.push(FuncInst::Local { type_idx: *type_idx, code_idx: local_idx as u32 });
    }

    for table_ty in module.tablesec.iter() {
        tables.push(Rc::new(RefCell::new(TableInst::new(*table_ty))));
    }
    for mem_ty in module.memsec.iter() {
        memories.push(Rc::new(RefCell::new(MemoryInst::new(*mem_ty))));
    }

    // Globals initialize in declaration order; a global's init expression may
    // reference only already-resolved imported globals (never a later
    // module-local one), which is exactly the slice of `globals` populated
    // so far at each step.
    for decl in module.globalsec.iter() {
        let value = eval_const_expr(&globals, &decl.init);
        globals.push(Rc::new(RefCell::new(GlobalInst { mutability: decl.ty.mutability, value })));
    }

    let instance = Rc::new(Instance { module: Rc::clone(&module), funcs, tables, memories, globals });

    apply_element_segments(&module, &instance)?;
    apply_data_segments(&module, &instance)?;

    if let Some(start) = &module.startsec {
        let func_idx: FuncIdx = **start;
        instance.invoke_by_index(*func_idx).map_err(LinkError::StartTrapped)?;
    }

    Ok(instance)
}

impl<A: Allocator> Instance<A> {
    // Invokes a function by its raw index rather than by export name; used
    // only for the start function, which isn't necessarily exported.
    fn invoke_by_index(&self, func_addr: u32) -> Result<Vec<Value>, Trap> {
        exec::invoke(self, func_addr, &[])
    }
}

fn limits_contained(min: u32, max: Option<u32>, actual: &TableInst) -> bool {
    (actual.elems.len() as u32) >= min && max_contained(max, actual.max)
}

fn max_contained(expected: Option<u32>, actual: Option<u32>) -> bool {
    match (expected, actual) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(expected), Some(actual)) => actual <= expected,
    }
}

fn apply_element_segments<A: Allocator>(
    module: &Module<A>,
    instance: &Rc<Instance<A>>,
) -> Result<(), LinkError> {
    for segment in module.elemsec.iter() {
        let indices: Vec<Option<u32>> = match &segment.init {
            ElementInit::FunctionIndices(idxs) => idxs.iter().map(|i| Some(**i)).collect(),
            ElementInit::Expressions(exprs) => exprs
                .iter()
                .map(|expr| eval_const_expr(&instance.globals, expr).to_funcref())
                .collect(),
        };
        if let ElementMode::Active(active) = &segment.mode {
            let offset = eval_const_expr(&instance.globals, &active.offset).to_i32() as u32;
            let mut table = instance.tables[*active.table as usize].borrow_mut();
            let start = offset as usize;
            let end = start
                .checked_add(indices.len())
                .filter(|&end| end <= table.elems.len())
                .ok_or(LinkError::SegmentOutOfBounds(Trap::TableOutOfBounds))?;
            table.elems[start..end].copy_from_slice(&indices);
        }
    }
    Ok(())
}

fn apply_data_segments<A: Allocator>(
    module: &Module<A>,
    instance: &Rc<Instance<A>>,
) -> Result<(), LinkError> {
    for segment in module.datasec.iter() {
        if let DataMode::Active(active) = &segment.mode {
            let offset = eval_const_expr(&instance.globals, &active.offset).to_i32() as u32;
            let mut mem = instance.memories[*active.memory as usize].borrow_mut();
            let start = offset as usize;
            let end = start
                .checked_add(segment.init.len())
                .filter(|&end| end <= mem.data.len())
                .ok_or(LinkError::SegmentOutOfBounds(Trap::MemoryOutOfBounds))?;
            mem.data[start..end].copy_from_slice(&segment.init);
        }
    }
    Ok(())
}

// A narrow evaluator for the constant expressions used during linking:
// global initializers and element/data segment offsets. Unlike the main
// fetch-decode-execute loop in `interp::exec`, this only ever sees
// `i32.const`/`i64.const`/`f32.const`/`f64.const`, `global.get` of an
// already-linked (necessarily imported) global, `ref.null`, and `ref.func` —
// the full grammar the WebAssembly spec allows inside a `constant
// expression`.
fn eval_const_expr<A: Allocator>(globals: &[Rc<RefCell<GlobalInst>>], expr: &Expression<A>) -> Slot {
    let mut cursor = ExprCursor::new(expr);
    match cursor.read_opcode() {
        Opcode::I32Const => Slot::from_i32(cursor.read_i32()),
        Opcode::I64Const => Slot::from_i64(cursor.read_i64()),
        Opcode::F32Const => Slot::from_f32(cursor.read_f32()),
        Opcode::F64Const => Slot::from_f64(cursor.read_f64()),
        Opcode::GlobalGet => {
            let idx = cursor.read_u32();
            globals[idx as usize].borrow().value
        }
        Opcode::RefNull => {
            cursor.read_ref_type();
            Slot::from_funcref(None)
        }
        Opcode::RefFunc => Slot::from_funcref(Some(cursor.read_u32())),
        other => unreachable!("{other:?} cannot appear in a constant expression"),
    }
}
