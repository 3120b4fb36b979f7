//! Modules and global variables.

use super::constant::Constant;
use super::function::Function;
use super::inst::{InstKind, Operand};
use super::types::{Linkage, Ty};

/// Function id, scoped to one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Global-variable id, scoped to one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

/// A module-level global variable.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    /// Symbol name.
    pub name: String,
    /// Value type of the variable (the pointee).
    pub ty: Ty,
    /// Initializer; `None` for external declarations.
    pub init: Option<Constant>,
    /// Linkage.
    pub linkage: Linkage,
    /// Whether the contents are immutable.
    pub is_constant: bool,
    /// Thread-local storage.
    pub thread_local: bool,
    /// Reached through a DLL import table.
    pub dll_import: bool,
    metadata: Vec<String>,
}

impl GlobalVariable {
    /// A defined global with an initializer.
    pub fn new<S: Into<String>>(name: S, ty: Ty, init: Constant) -> Self {
        GlobalVariable {
            name: name.into(),
            ty,
            init: Some(init),
            linkage: Linkage::External,
            is_constant: false,
            thread_local: false,
            dll_import: false,
            metadata: Vec::new(),
        }
    }

    /// Attach a metadata marker such as `noobf`.
    pub fn add_metadata<S: Into<String>>(&mut self, marker: S) {
        let marker = marker.into();
        if !self.metadata.contains(&marker) {
            self.metadata.push(marker);
        }
    }

    /// Whether the marker is attached.
    pub fn has_metadata(&self, marker: &str) -> bool {
        self.metadata.iter().any(|m| m == marker)
    }
}

/// A compilation module: globals, functions, annotation strings and the
/// compiler-used list.
#[derive(Debug, Clone)]
pub struct Module {
    /// Module name; prefixes every generated side global.
    pub name: String,
    /// Pointer size in bytes of the target (4 or 8).
    pub pointer_size: u32,
    globals: Vec<GlobalVariable>,
    functions: Vec<Function>,
    annotations: Vec<(FuncId, String)>,
    compiler_used: Vec<GlobalId>,
}

impl Module {
    /// An empty module for a 64-bit target.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Module {
            name: name.into(),
            pointer_size: 8,
            globals: Vec::new(),
            functions: Vec::new(),
            annotations: Vec::new(),
            compiler_used: Vec::new(),
        }
    }

    /// Add a function.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    /// Function access.
    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    /// Mutable function access.
    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    /// Ids of all functions, in definition order.
    pub fn func_ids(&self) -> Vec<FuncId> {
        (0..self.functions.len() as u32).map(FuncId).collect()
    }

    /// Look a function up by symbol name.
    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Add a global variable. A name that is already taken gets a numeric
    /// suffix, the way symbol tables uniquify.
    pub fn add_global(&mut self, mut global: GlobalVariable) -> GlobalId {
        if self.global_by_name(&global.name).is_some() {
            let base = global.name.clone();
            let mut n = 1;
            while self.global_by_name(&format!("{base}.{n}")).is_some() {
                n += 1;
            }
            global.name = format!("{base}.{n}");
        }
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    /// Global access.
    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.0 as usize]
    }

    /// Mutable global access.
    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        &mut self.globals[id.0 as usize]
    }

    /// Ids of all globals, in definition order.
    pub fn global_ids(&self) -> Vec<GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId).collect()
    }

    /// Look a global up by symbol name.
    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    /// Attach an annotation string to a function.
    pub fn add_annotation<S: Into<String>>(&mut self, func: FuncId, annotation: S) {
        self.annotations.push((func, annotation.into()));
    }

    /// Annotation strings attached to a function.
    pub fn annotations_for(&self, func: FuncId) -> impl Iterator<Item = &str> {
        self.annotations
            .iter()
            .filter(move |(f, _)| *f == func)
            .map(|(_, s)| s.as_str())
    }

    /// Append a global to the compiler-used list, keeping it alive through
    /// linker dead-stripping.
    pub fn append_compiler_used(&mut self, global: GlobalId) {
        if !self.compiler_used.contains(&global) {
            self.compiler_used.push(global);
        }
    }

    /// The compiler-used list.
    pub fn compiler_used(&self) -> &[GlobalId] {
        &self.compiler_used
    }

    /// Resolve the called function of a call or invoke, looking through
    /// pointer casts of the called operand.
    pub fn called_function(&self, kind: &InstKind) -> Option<FuncId> {
        let callee = match kind {
            InstKind::Call { callee, .. } | InstKind::Invoke { callee, .. } => callee,
            _ => return None,
        };
        match callee {
            Operand::Const(c) => match c.strip_pointer_casts() {
                Constant::Function(f) => Some(*f),
                _ => None,
            },
            Operand::Value(_) => None,
        }
    }

    /// Whether the instruction is a direct call to an intrinsic.
    pub fn is_intrinsic_call(&self, kind: &InstKind) -> bool {
        self.called_function(kind)
            .is_some_and(|f| self.func(f).is_intrinsic)
    }
}
