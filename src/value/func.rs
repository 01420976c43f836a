//! Callable values: host-provided native functions and compiled closures.

use std::fmt::{Debug, Display};
use std::rc::Rc;
use std::sync::Arc;

use beef::lean::Cow;

use crate::bytecode::FuncProto;
use crate::error::Result;
use crate::value::ptr::Cell;
use crate::value::Value;
use crate::vm::Vm;

/// The plain-function form of a native callable; the `Universe` builtins
/// are all of this shape.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value>;

/// A host-provided callable, with an optional bound receiver.
///
/// The receiver, when present, is prepended to the caller-supplied
/// arguments.
pub struct NativeFunction {
  name: Cow<'static, str>,
  callable: Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value>>,
  recv: Option<Value>,
}

impl NativeFunction {
  pub fn new(
    name: impl Into<Cow<'static, str>>,
    f: impl Fn(&mut Vm, &[Value]) -> Result<Value> + 'static,
  ) -> NativeFunction {
    NativeFunction {
      name: name.into(),
      callable: Rc::new(f),
      recv: None,
    }
  }

  pub fn from_fn(name: impl Into<Cow<'static, str>>, f: NativeFn) -> NativeFunction {
    NativeFunction {
      name: name.into(),
      callable: Rc::new(f),
      recv: None,
    }
  }

  /// A copy of this function with `recv` bound as its receiver.
  pub fn bind(&self, recv: Value) -> NativeFunction {
    NativeFunction {
      name: self.name.clone(),
      callable: Rc::clone(&self.callable),
      recv: Some(recv),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn call(&self, vm: &mut Vm, args: &[Value]) -> Result<Value> {
    match &self.recv {
      None => (self.callable)(vm, args),
      Some(recv) => {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(recv.clone());
        full.extend_from_slice(args);
        (self.callable)(vm, &full)
      }
    }
  }
}

impl Display for NativeFunction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "<native function {}>", self.name)
  }
}

impl Debug for NativeFunction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NativeFunction")
      .field("name", &&*self.name)
      .finish_non_exhaustive()
  }
}

/// A compiled function together with its captured upvalue cells.
pub struct Closure {
  pub proto: Arc<FuncProto>,
  pub free: Vec<Cell>,
}

impl Closure {
  pub fn new(proto: Arc<FuncProto>, free: Vec<Cell>) -> Closure {
    debug_assert_eq!(proto.num_free, free.len());
    Closure { proto, free }
  }
}

impl Display for Closure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "<function {}>", self.proto.name)
  }
}
