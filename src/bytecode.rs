//! The compiled artifact the runtime consumes.
//!
//! A [`Unit`] carries the constant pool, the function table, the main
//! function handle, the global-slot symbol table, and the source map. It is
//! produced once by a frontend (through [`builder::UnitBuilder`]) and is
//! read-only from then on; `Arc` sharing makes it cheap to hand to any
//! number of VMs.

pub mod builder;
pub mod disasm;
pub mod opcode;

use std::fmt::Display;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::span::{LineIndex, Pos, Span};
use crate::value::{Closure, Value};

/// A constant pool entry.
///
/// Function constants refer into the unit's function table by index.
#[derive(Clone, Debug)]
pub enum Constant {
  Int(i64),
  Float(f64),
  Char(char),
  Str(Arc<str>),
  Bytes(Arc<[u8]>),
  Func(usize),
}

impl PartialEq for Constant {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Constant::Int(a), Constant::Int(b)) => a == b,
      // bit equality, so NaN still interns
      (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
      (Constant::Char(a), Constant::Char(b)) => a == b,
      (Constant::Str(a), Constant::Str(b)) => a == b,
      (Constant::Bytes(a), Constant::Bytes(b)) => a == b,
      (Constant::Func(a), Constant::Func(b)) => a == b,
      _ => false,
    }
  }
}

impl Constant {
  /// Materialize the runtime value. A function constant becomes a closure
  /// with no captures; captured functions go through the closure
  /// instruction instead.
  pub(crate) fn to_value(&self, unit: &Unit) -> Value {
    match self {
      Constant::Int(v) => Value::Int(*v),
      Constant::Float(v) => Value::Float(*v),
      Constant::Char(v) => Value::Char(*v),
      Constant::Str(v) => Value::from(&**v),
      Constant::Bytes(v) => Value::Bytes(v.as_ref().into()),
      Constant::Func(idx) => {
        Value::Func(Rc::new(Closure::new(unit.functions[*idx].clone(), vec![])))
      }
    }
  }
}

impl Display for Constant {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Constant::Int(v) => write!(f, "{v}"),
      Constant::Float(v) => write!(f, "{v}"),
      Constant::Char(v) => write!(f, "'{}'", v.escape_default()),
      Constant::Str(v) => write!(f, "\"{}\"", v.escape_default()),
      Constant::Bytes(v) => write!(f, "<{} bytes>", v.len()),
      Constant::Func(idx) => write!(f, "<func #{idx}>"),
    }
  }
}

/// Parameter shape of a compiled function.
#[derive(Clone, Copy, Debug, Default)]
pub struct Params {
  /// Declared parameter count, including the variadic slot.
  pub num_params: usize,
  /// Trailing parameters that may be nil-padded.
  pub num_optional: usize,
  pub variadic: bool,
}

/// A compiled function: code, shape, and source tables.
#[derive(Debug)]
pub struct FuncProto {
  pub name: Arc<str>,
  pub code: Vec<u8>,
  pub params: Params,
  /// Frame slots, including the parameters.
  pub num_locals: usize,
  /// Upvalue cells consumed by the closure instruction.
  pub num_free: usize,
  /// `(instruction offset, span)` pairs, sorted by offset.
  pub spans: Vec<(u32, Span)>,
  /// Deferred-call sites, indexed by the defer instruction's operand.
  pub defer_sites: Vec<Span>,
}

impl FuncProto {
  /// The span of the instruction at `ip` (the last recorded span at or
  /// before it).
  pub fn span_at(&self, ip: usize) -> Span {
    let at = self.spans.partition_point(|(offset, _)| *offset as usize <= ip);
    at
      .checked_sub(1)
      .map(|i| self.spans[i].1)
      .unwrap_or_default()
  }
}

/// A complete compiled program.
pub struct Unit {
  pub name: Arc<str>,
  pub constants: Vec<Constant>,
  pub functions: Vec<Arc<FuncProto>>,
  /// Function-table index of the entry point.
  pub main: usize,
  /// Size of the globals vector.
  pub num_globals: usize,
  /// Input and script-defined symbol names, to global slots.
  pub symbols: IndexMap<String, usize>,
  /// Line table of the original source, when the frontend provides it.
  pub lines: Option<LineIndex>,
}

impl Unit {
  pub fn main_proto(&self) -> Arc<FuncProto> {
    self.functions[self.main].clone()
  }

  pub fn position(&self, span: Span) -> Option<Pos> {
    self.lines.as_ref().map(|lines| lines.pos(span.start))
  }

  pub fn disassemble(&self) -> String {
    disasm::disassemble(self)
  }
}
