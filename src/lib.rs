//! The runtime core of the toy scripting language.
//!
//! This crate executes compiled bytecode: it owns the value model, the
//! stack-based interpreter, the built-in function universe, and the
//! structured error regime. Parsing and compilation are a frontend concern;
//! a frontend implements [`Compiler`] and targets
//! [`bytecode::builder::UnitBuilder`].
//!
//! The embedding surface is [`Script`] (source plus named input variables)
//! and [`Compiled`] (a unit plus its globals vector, runnable any number of
//! times). Cancellation is cooperative through [`AbortHandle`].

#[macro_use]
mod util;

pub mod builtins;
pub mod bytecode;
mod error;
pub mod span;
pub mod unpack;
pub mod value;
pub mod vm;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

pub use error::{Error, Result, RuntimeError, TraceFrame};
pub use value::{Type, Value};
pub use vm::{AbortHandle, Vm};

use bytecode::Unit;

/// A frontend that turns source into a compiled unit.
///
/// Symbol resolution is expected to consult [`builtins::lookup`] first and
/// allocate global slots for `inputs` (in order) before script-defined
/// symbols.
pub trait Compiler {
  fn compile(&self, request: CompileRequest<'_>) -> Result<Unit>;
}

/// Everything a frontend needs from the embedding to compile one script.
pub struct CompileRequest<'a> {
  pub source: &'a [u8],
  /// Names of the host-provided input variables, in registration order.
  pub inputs: Vec<&'a str>,
  pub import_dir: Option<&'a Path>,
  pub file_import: bool,
  pub imports: Option<&'a ImportGetter>,
}

/// Resolves an import path to module source.
pub type ImportGetter = dyn Fn(&str) -> Option<Vec<u8>>;

/// A script: source bytes plus named input variables and import
/// configuration.
#[derive(Default)]
pub struct Script {
  source: Vec<u8>,
  variables: IndexMap<String, Value>,
  imports: Option<Box<ImportGetter>>,
  import_dir: Option<PathBuf>,
  file_import: bool,
}

impl Script {
  pub fn new(source: impl Into<Vec<u8>>) -> Script {
    Script {
      source: source.into(),
      ..Script::default()
    }
  }

  /// Register an input variable. The compiled script reads its initial
  /// value from the globals vector and may reassign it.
  pub fn add(&mut self, name: impl Into<String>, value: Value) {
    self.variables.insert(name.into(), value);
  }

  pub fn add_all(&mut self, variables: impl IntoIterator<Item = (String, Value)>) {
    for (name, value) in variables {
      self.add(name, value);
    }
  }

  /// Remove a registered variable; returns whether it existed.
  pub fn remove(&mut self, name: &str) -> bool {
    self.variables.shift_remove(name).is_some()
  }

  pub fn set_imports(&mut self, getter: impl Fn(&str) -> Option<Vec<u8>> + 'static) {
    self.imports = Some(Box::new(getter));
  }

  pub fn set_import_dir(&mut self, path: impl Into<PathBuf>) {
    self.import_dir = Some(path.into());
  }

  pub fn enable_file_import(&mut self, enable: bool) {
    self.file_import = enable;
  }

  /// Compile through the given frontend and bind the input variables to
  /// their global slots.
  pub fn compile_with(&self, compiler: &dyn Compiler) -> Result<Compiled> {
    let request = CompileRequest {
      source: &self.source,
      inputs: self.variables.keys().map(String::as_str).collect(),
      import_dir: self.import_dir.as_deref(),
      file_import: self.file_import,
      imports: self.imports.as_deref(),
    };
    let unit = Arc::new(compiler.compile(request)?);
    let compiled = Compiled::new(unit);
    for (name, value) in self.variables.iter() {
      compiled.set(name, value.clone())?;
    }
    Ok(compiled)
  }

  /// Compile and run once, returning the compiled script for inspection.
  pub fn run_with(&self, compiler: &dyn Compiler) -> Result<Compiled> {
    let compiled = self.compile_with(compiler)?;
    compiled.run()?;
    Ok(compiled)
  }
}

/// A compiled script and its global state.
///
/// One run at a time: `run` takes the globals lock for the duration of the
/// run. For concurrent runs, `clone` produces an independent copy with
/// deep-cloned globals.
pub struct Compiled {
  unit: Arc<Unit>,
  globals: Mutex<Vec<Value>>,
}

impl Compiled {
  /// Load a compiled unit with nil-initialized globals.
  pub fn new(unit: Arc<Unit>) -> Compiled {
    let globals = vec![Value::Nil; unit.num_globals];
    Compiled {
      unit,
      globals: Mutex::new(globals),
    }
  }

  pub fn unit(&self) -> &Arc<Unit> {
    &self.unit
  }

  /// Run the unit's main function.
  pub fn run(&self) -> Result<Value> {
    self.run_aborting(&AbortHandle::new())
  }

  /// Run under an abort handle; tripping the handle (from any thread)
  /// unwinds the VM at its next dispatch.
  pub fn run_aborting(&self, handle: &AbortHandle) -> Result<Value> {
    let mut guard = self.globals.lock().unwrap_or_else(|e| e.into_inner());
    let globals = std::mem::take(&mut *guard);
    let mut vm = Vm::new(self.unit.clone(), globals).with_abort(handle);
    let result = vm.run();
    *guard = vm.into_globals();
    result
  }

  fn slot(&self, name: &str) -> Option<usize> {
    self.unit.symbols.get(name).copied()
  }

  pub fn is_defined(&self, name: &str) -> bool {
    self.slot(name).is_some()
  }

  pub fn get(&self, name: &str) -> Option<Value> {
    let slot = self.slot(name)?;
    let guard = self.globals.lock().unwrap_or_else(|e| e.into_inner());
    guard.get(slot).cloned()
  }

  pub fn set(&self, name: &str, value: Value) -> Result<()> {
    let Some(slot) = self.slot(name) else {
      return Err(Error::message(format!("'{name}' is not defined")));
    };
    let mut guard = self.globals.lock().unwrap_or_else(|e| e.into_inner());
    guard[slot] = value;
    Ok(())
  }

  pub fn get_all(&self) -> Vec<(String, Value)> {
    let guard = self.globals.lock().unwrap_or_else(|e| e.into_inner());
    self
      .unit
      .symbols
      .iter()
      .filter_map(|(name, slot)| guard.get(*slot).map(|v| (name.clone(), v.clone())))
      .collect()
  }
}

impl Clone for Compiled {
  /// An independent copy for concurrent reuse: globals are deep-cloned so
  /// the two never share mutable state.
  fn clone(&self) -> Compiled {
    let guard = self.globals.lock().unwrap_or_else(|e| e.into_inner());
    let globals = guard.iter().map(Value::deep_clone).collect();
    Compiled {
      unit: self.unit.clone(),
      globals: Mutex::new(globals),
    }
  }
}
