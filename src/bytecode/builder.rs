//! Builders a frontend uses to assemble a [`Unit`].
//!
//! Jumps are emitted against labels and patched when the builder finishes;
//! every emitted instruction records the span set by [`FuncBuilder::at`].

use std::sync::Arc;

use indexmap::IndexMap;

use super::opcode::{Instr, Opcode};
use super::{Constant, FuncProto, Params, Unit};
use crate::span::{LineIndex, Span};

pub struct UnitBuilder {
  name: Arc<str>,
  constants: Vec<Constant>,
  functions: Vec<Arc<FuncProto>>,
  symbols: IndexMap<String, usize>,
  lines: Option<LineIndex>,
}

impl UnitBuilder {
  pub fn new(name: &str) -> UnitBuilder {
    UnitBuilder {
      name: name.into(),
      constants: vec![],
      functions: vec![],
      symbols: IndexMap::new(),
      lines: None,
    }
  }

  /// Record the line table of the source this unit was compiled from.
  pub fn source(&mut self, src: &str) {
    self.lines = Some(LineIndex::new(src));
  }

  /// Intern a constant and return its pool index.
  pub fn constant(&mut self, constant: Constant) -> u16 {
    let idx = match self.constants.iter().position(|c| *c == constant) {
      Some(idx) => idx,
      None => {
        self.constants.push(constant);
        self.constants.len() - 1
      }
    };
    u16::try_from(idx).expect("constant pool overflow")
  }

  pub fn int(&mut self, value: i64) -> u16 {
    self.constant(Constant::Int(value))
  }

  pub fn str(&mut self, value: &str) -> u16 {
    self.constant(Constant::Str(value.into()))
  }

  /// Allocate (or look up) the global slot for `name`.
  pub fn global(&mut self, name: &str) -> u16 {
    let next = self.symbols.len();
    let slot = *self.symbols.entry(name.to_string()).or_insert(next);
    u16::try_from(slot).expect("global table overflow")
  }

  pub fn add_function(&mut self, proto: FuncProto) -> usize {
    self.functions.push(Arc::new(proto));
    self.functions.len() - 1
  }

  /// Intern the constant referring to function-table entry `idx`.
  pub fn func(&mut self, idx: usize) -> u16 {
    self.constant(Constant::Func(idx))
  }

  pub fn finish(self, main: usize) -> Unit {
    assert!(main < self.functions.len(), "main function out of range");
    Unit {
      name: self.name,
      constants: self.constants,
      num_globals: self.symbols.len(),
      functions: self.functions,
      main,
      symbols: self.symbols,
      lines: self.lines,
    }
  }
}

#[derive(Clone, Copy)]
pub struct Label(usize);

pub struct FuncBuilder {
  name: Arc<str>,
  code: Vec<u8>,
  spans: Vec<(u32, Span)>,
  defer_sites: Vec<Span>,
  labels: Vec<Option<usize>>,
  patches: Vec<(usize, Label)>,
  span: Span,
  params: Params,
  num_locals: usize,
  num_free: usize,
}

impl FuncBuilder {
  pub fn new(name: &str) -> FuncBuilder {
    FuncBuilder {
      name: name.into(),
      code: vec![],
      spans: vec![],
      defer_sites: vec![],
      labels: vec![],
      patches: vec![],
      span: Span::default(),
      params: Params::default(),
      num_locals: 0,
      num_free: 0,
    }
  }

  pub fn params(&mut self, num_params: usize, num_optional: usize, variadic: bool) {
    self.params = Params {
      num_params,
      num_optional,
      variadic,
    };
    if self.num_locals < num_params {
      self.num_locals = num_params;
    }
  }

  pub fn locals(&mut self, num_locals: usize) {
    self.num_locals = num_locals;
  }

  pub fn free(&mut self, num_free: usize) {
    self.num_free = num_free;
  }

  /// Set the span recorded for subsequently emitted instructions.
  pub fn at(&mut self, span: impl Into<Span>) -> &mut FuncBuilder {
    self.span = span.into();
    self
  }

  pub fn emit(&mut self, instr: Instr) {
    debug_assert!(
      !matches!(
        instr,
        Instr::Jump(_) | Instr::JumpFalsy(_) | Instr::AndJump(_) | Instr::OrJump(_)
      ),
      "use `jump` to emit jump instructions"
    );
    self.spans.push((self.code.len() as u32, self.span));
    instr.encode(&mut self.code);
  }

  pub fn label(&mut self) -> Label {
    self.labels.push(None);
    Label(self.labels.len() - 1)
  }

  pub fn bind(&mut self, label: Label) {
    debug_assert!(self.labels[label.0].is_none(), "label bound twice");
    self.labels[label.0] = Some(self.code.len());
  }

  /// Emit a jump of the given kind towards `label`, which may be bound
  /// before or after this call.
  pub fn jump(&mut self, opcode: Opcode, label: Label) {
    debug_assert!(matches!(
      opcode,
      Opcode::Jump | Opcode::JumpFalsy | Opcode::AndJump | Opcode::OrJump
    ));
    self.spans.push((self.code.len() as u32, self.span));
    self.code.push(opcode as u8);
    self.patches.push((self.code.len(), label));
    self.code.extend_from_slice(&u16::MAX.to_be_bytes());
  }

  /// Register a deferred-call site and return its operand index.
  pub fn defer_site(&mut self, span: impl Into<Span>) -> u8 {
    self.defer_sites.push(span.into());
    u8::try_from(self.defer_sites.len() - 1).expect("defer table overflow")
  }

  pub fn finish(mut self) -> FuncProto {
    for (offset, label) in self.patches.iter() {
      let target = self.labels[label.0].expect("unbound label");
      let target = u16::try_from(target).expect("code offset overflow");
      self.code[*offset..*offset + 2].copy_from_slice(&target.to_be_bytes());
    }
    assert!(
      self.num_locals >= self.params.num_params,
      "locals must cover the parameters"
    );
    FuncProto {
      name: self.name,
      code: self.code,
      params: self.params,
      num_locals: self.num_locals,
      num_free: self.num_free,
      spans: self.spans,
      defer_sites: self.defer_sites,
    }
  }
}
