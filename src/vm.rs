//! The interpreter.
//!
//! A [`Vm`] is strictly single-threaded: it owns a fixed-capacity operand
//! stack and frame stack and runs one dispatch loop. The only cross-thread
//! surface is the [`AbortHandle`], an atomic flag polled at the top of the
//! loop; observing it unwinds cleanly, still running deferred calls.

pub mod frame;

#[cfg(test)]
mod tests;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use self::frame::{Deferred, Frame};
use crate::bytecode::opcode::Opcode;
use crate::bytecode::{Constant, FuncProto, Unit};
use crate::error::{Error, Result, RuntimeError};
use crate::value::ops::{self, BinOp, CmpOp, UnOp};
use crate::builtins;
use crate::value::{Cell, Closure, Map, NativeFunction, Ptr, Splat, Value, ValueIter};

/// Operand stack capacity.
pub const STACK_SIZE: usize = 2048;
/// Call-frame stack capacity.
pub const MAX_FRAMES: usize = 1024;
/// Largest constructible string, in bytes.
pub const MAX_STRING_LEN: usize = 0x7fff_ffff;
/// Largest constructible byte string.
pub const MAX_BYTES_LEN: usize = 0x7fff_ffff;

/// A cloneable, thread-safe handle that cancels a running VM.
#[derive(Clone, Default)]
pub struct AbortHandle {
  flag: Arc<AtomicBool>,
}

impl AbortHandle {
  pub fn new() -> AbortHandle {
    AbortHandle::default()
  }

  /// Request cancellation; the VM observes it at its next dispatch.
  pub fn abort(&self) {
    self.flag.store(true, Ordering::Relaxed);
  }

  pub fn is_aborted(&self) -> bool {
    self.flag.load(Ordering::Relaxed)
  }
}

pub struct Vm {
  unit: Arc<Unit>,
  globals: Vec<Value>,
  stack: Vec<Value>,
  frames: Vec<Frame>,
  abort: Arc<AtomicBool>,
  pending: Option<Error>,
  unwinding: usize,
}

impl Vm {
  pub fn new(unit: Arc<Unit>, mut globals: Vec<Value>) -> Vm {
    if globals.len() < unit.num_globals {
      globals.resize(unit.num_globals, Value::Nil);
    }
    Vm {
      unit,
      globals,
      stack: Vec::with_capacity(STACK_SIZE),
      frames: Vec::with_capacity(16),
      abort: Arc::new(AtomicBool::new(false)),
      pending: None,
      unwinding: 0,
    }
  }

  pub fn with_abort(mut self, handle: &AbortHandle) -> Vm {
    self.abort = handle.flag.clone();
    self
  }

  pub fn unit(&self) -> &Arc<Unit> {
    &self.unit
  }

  pub fn globals(&self) -> &[Value] {
    &self.globals
  }

  pub fn globals_mut(&mut self) -> &mut [Value] {
    &mut self.globals
  }

  pub fn into_globals(self) -> Vec<Value> {
    self.globals
  }

  /// Record an error the dispatch loop observes when the current native
  /// call returns; this is how `fail` reports.
  pub fn set_pending_error(&mut self, error: Error) {
    self.pending = Some(error);
  }

  /// Execute the unit's main function to completion.
  pub fn run(&mut self) -> Result<Value> {
    let main = Value::Func(Rc::new(Closure::new(self.unit.main_proto(), vec![])));
    self.call(main, &[])
  }

  /// Call any callable value with raw arguments. Reentrant: deferred
  /// calls, `try` thunks, and native callables use this to run compiled
  /// code within the active loop.
  pub fn call(&mut self, callable: Value, args: &[Value]) -> Result<Value> {
    match callable {
      Value::Native(f) => self.call_native(&f, args),
      Value::Type(ty) => ty.construct(args),
      Value::Func(_) => {
        let depth = self.frames.len();
        let entry_sp = self.stack.len();
        self.push(callable)?;
        for arg in args {
          self.push(arg.clone())?;
        }
        if let Err(e) = self.setup_call(args.len()) {
          self.stack.truncate(entry_sp);
          return Err(e);
        }
        match self.execute(depth) {
          Ok(()) => Ok(self.pop()),
          Err(e) => {
            self.stack.truncate(entry_sp);
            Err(e)
          }
        }
      }
      other => Err(Error::NotCallable {
        got: other.type_name(),
      }),
    }
  }

  fn call_native(&mut self, f: &Rc<NativeFunction>, args: &[Value]) -> Result<Value> {
    let result = catch_unwind(AssertUnwindSafe(|| f.call(self, args)));
    let value = match result {
      Ok(result) => result?,
      Err(payload) => return Err(classify_panic(payload)),
    };
    // a pending error set by the native call (`fail`) wins over its result
    match self.pending.take() {
      Some(error) => Err(error),
      None => Ok(value),
    }
  }

  /// The dispatch loop: run until the frame stack drops back to
  /// `min_depth`. On failure, frames above `min_depth` unwind (running
  /// their deferred calls) and the trace-carrying error is returned.
  fn execute(&mut self, min_depth: usize) -> Result<()> {
    while self.frames.len() > min_depth {
      if self.unwinding == 0 && self.abort.load(Ordering::Relaxed) {
        let cause = self.pending.take().unwrap_or(Error::Aborted);
        return Err(self.unwind(min_depth, cause));
      }
      if let Err(e) = self.step() {
        return Err(self.unwind(min_depth, e));
      }
    }
    Ok(())
  }

  fn unwind(&mut self, min_depth: usize, error: Error) -> Error {
    self.unwinding += 1;
    let mut rt = match error {
      Error::Runtime(boxed) => *boxed,
      other => RuntimeError::new(other),
    };
    while self.frames.len() > min_depth {
      {
        let frame = self.frames.last().expect("unwinding past frame stack");
        let proto = frame.closure.proto.clone();
        let span = frame
          .running_defer
          .unwrap_or_else(|| proto.span_at(frame.last_ip));
        rt.push_frame(
          proto.name.clone(),
          span,
          self.unit.position(span),
          frame.running_defer.is_some(),
        );
      }
      self.drain_defers(&mut rt);
      let frame = self.frames.pop().expect("unwinding past frame stack");
      self.stack.truncate(frame.base - 1);
    }
    self.unwinding -= 1;
    Error::Runtime(Box::new(rt))
  }

  /// Run the current frame's deferred calls in LIFO order, splicing any
  /// errors (and their defer sites) into `rt`.
  fn drain_defers(&mut self, rt: &mut RuntimeError) {
    loop {
      let frame_idx = self.frames.len() - 1;
      let Some(deferred) = self.frames[frame_idx].defers.pop() else {
        break;
      };
      let proto = self.frames[frame_idx].closure.proto.clone();
      let site = proto
        .defer_sites
        .get(deferred.site as usize)
        .copied()
        .unwrap_or_default();
      self.frames[frame_idx].running_defer = Some(site);
      if let Err(e) = self.call(deferred.callable.clone(), &deferred.args) {
        rt.absorb(e);
        rt.push_frame(proto.name.clone(), site, self.unit.position(site), true);
      }
      self.frames[frame_idx].running_defer = None;
    }
  }

  /// Deferred calls on normal return; any failures become the call's
  /// error.
  fn run_defers(&mut self) -> Result<()> {
    if self.frames.last().expect("no active frame").defers.is_empty() {
      return Ok(());
    }
    let mut rt = RuntimeError {
      errors: vec![],
      trace: vec![],
    };
    self.drain_defers(&mut rt);
    if rt.errors.is_empty() {
      Ok(())
    } else {
      Err(Error::Runtime(Box::new(rt)))
    }
  }

  fn push(&mut self, value: Value) -> Result<()> {
    if self.stack.len() >= STACK_SIZE {
      return Err(Error::StackOverflow);
    }
    self.stack.push(value);
    Ok(())
  }

  fn pop(&mut self) -> Value {
    self.stack.pop().expect("operand stack underflow")
  }

  fn peek(&self, depth: usize) -> &Value {
    &self.stack[self.stack.len() - 1 - depth]
  }

  fn fetch_u8(&mut self) -> u8 {
    let frame = self.frames.last_mut().expect("no active frame");
    let byte = frame.closure.proto.code[frame.ip];
    frame.ip += 1;
    byte
  }

  fn fetch_u16(&mut self) -> u16 {
    let frame = self.frames.last_mut().expect("no active frame");
    let code = &frame.closure.proto.code;
    let value = u16::from_be_bytes([code[frame.ip], code[frame.ip + 1]]);
    frame.ip += 2;
    value
  }

  fn local_slot(&self, slot: u8) -> usize {
    self.frames.last().expect("no active frame").base + slot as usize
  }

  fn get_local(&self, slot: u8) -> Value {
    match &self.stack[self.local_slot(slot)] {
      Value::Cell(cell) => cell.get(),
      value => value.clone(),
    }
  }

  fn set_local(&mut self, slot: u8, value: Value) {
    let idx = self.local_slot(slot);
    match &self.stack[idx] {
      Value::Cell(cell) => cell.set(value),
      _ => self.stack[idx] = value,
    }
  }

  /// Promote the local to a shared cell, replacing the slot with a cell
  /// reference; reads and writes then go through the indirection.
  fn promote_local(&mut self, slot: u8) -> Cell {
    let idx = self.local_slot(slot);
    if let Value::Cell(cell) = &self.stack[idx] {
      return cell.clone();
    }
    let cell = Cell::new(std::mem::take(&mut self.stack[idx]));
    self.stack[idx] = Value::Cell(cell.clone());
    cell
  }

  fn corrupt(what: &str) -> Error {
    Error::message(format!("corrupt bytecode: {what}"))
  }

  fn step(&mut self) -> Result<()> {
    {
      let frame = self.frames.last_mut().expect("no active frame");
      frame.last_ip = frame.ip;
    }
    let byte = self.fetch_u8();
    let opcode = Opcode::decode(byte)
      .ok_or_else(|| Self::corrupt(&format!("invalid opcode 0x{byte:02x}")))?;

    match opcode {
      Opcode::Const => {
        let idx = self.fetch_u16() as usize;
        let constant = self
          .unit
          .constants
          .get(idx)
          .ok_or_else(|| Self::corrupt("constant index out of range"))?;
        let value = constant.to_value(&self.unit);
        self.push(value)?;
      }
      Opcode::Nil => self.push(Value::Nil)?,
      Opcode::True => self.push(Value::Bool(true))?,
      Opcode::False => self.push(Value::Bool(false))?,
      Opcode::Pop => {
        self.pop();
      }

      Opcode::Binary => {
        let op = self.fetch_u8();
        let op = BinOp::from_u8(op).ok_or_else(|| Self::corrupt("invalid binary operator"))?;
        let rhs = self.pop();
        let lhs = self.pop();
        let value = ops::binary_op(op, &lhs, &rhs)?;
        self.push(value)?;
      }
      Opcode::Compare => {
        let op = self.fetch_u8();
        let op = CmpOp::from_u8(op).ok_or_else(|| Self::corrupt("invalid comparison operator"))?;
        let rhs = self.pop();
        let lhs = self.pop();
        let value = ops::compare(op, &lhs, &rhs)?;
        self.push(Value::Bool(value))?;
      }
      Opcode::Unary => {
        let op = self.fetch_u8();
        let op = UnOp::from_u8(op).ok_or_else(|| Self::corrupt("invalid unary operator"))?;
        let operand = self.pop();
        let value = ops::unary_op(op, &operand)?;
        self.push(value)?;
      }

      Opcode::Jump => {
        let target = self.fetch_u16() as usize;
        self.frames.last_mut().expect("no active frame").ip = target;
      }
      Opcode::JumpFalsy => {
        let target = self.fetch_u16() as usize;
        if self.pop().is_falsy() {
          self.frames.last_mut().expect("no active frame").ip = target;
        }
      }
      Opcode::AndJump => {
        let target = self.fetch_u16() as usize;
        if self.peek(0).is_falsy() {
          self.frames.last_mut().expect("no active frame").ip = target;
        } else {
          self.pop();
        }
      }
      Opcode::OrJump => {
        let target = self.fetch_u16() as usize;
        if self.peek(0).is_falsy() {
          self.pop();
        } else {
          self.frames.last_mut().expect("no active frame").ip = target;
        }
      }

      Opcode::GetGlobal => {
        let slot = self.fetch_u16() as usize;
        let value = self
          .globals
          .get(slot)
          .cloned()
          .ok_or_else(|| Self::corrupt("global slot out of range"))?;
        self.push(value)?;
      }
      Opcode::SetGlobal => {
        let slot = self.fetch_u16() as usize;
        let value = self.pop();
        let dest = self
          .globals
          .get_mut(slot)
          .ok_or_else(|| Self::corrupt("global slot out of range"))?;
        *dest = value;
      }

      Opcode::GetLocal => {
        let slot = self.fetch_u8();
        let value = self.get_local(slot);
        self.push(value)?;
      }
      Opcode::SetLocal => {
        let slot = self.fetch_u8();
        let value = self.pop();
        self.set_local(slot, value);
      }
      Opcode::DefineLocal => {
        let slot = self.fetch_u8();
        let value = self.pop();
        // a fresh definition replaces any promoted cell in the slot
        let idx = self.local_slot(slot);
        self.stack[idx] = value;
      }
      Opcode::GetLocalPtr => {
        let slot = self.fetch_u8();
        let cell = self.promote_local(slot);
        self.push(Value::Cell(cell))?;
      }

      Opcode::GetFree => {
        let slot = self.fetch_u8() as usize;
        let frame = self.frames.last().expect("no active frame");
        let value = frame.closure.free[slot].get();
        self.push(value)?;
      }
      Opcode::SetFree => {
        let slot = self.fetch_u8() as usize;
        let value = self.pop();
        let frame = self.frames.last().expect("no active frame");
        frame.closure.free[slot].set(value);
      }
      Opcode::GetFreePtr => {
        let slot = self.fetch_u8() as usize;
        let frame = self.frames.last().expect("no active frame");
        let cell = frame.closure.free[slot].clone();
        self.push(Value::Cell(cell))?;
      }

      Opcode::String => {
        let n = self.fetch_u16() as usize;
        let unindent = self.fetch_u8() != 0;
        let start = self.stack.len() - n;
        let parts: Vec<Value> = self.stack.drain(start..).collect();
        let value = ops::build_string(&parts, unindent)?;
        self.push(value)?;
      }
      Opcode::Array => {
        let n = self.fetch_u16() as usize;
        let splat = self.fetch_u8() != 0;
        let n = if splat { self.expand_splat_seq(n)? } else { n };
        let start = self.stack.len() - n;
        let items: Vec<Value> = self.stack.drain(start..).collect();
        self.push(Value::array(items))?;
      }
      Opcode::Tuple => {
        let n = self.fetch_u16() as usize;
        let splat = self.fetch_u8() != 0;
        let n = if splat { self.expand_splat_seq(n)? } else { n };
        let start = self.stack.len() - n;
        let items: Vec<Value> = self.stack.drain(start..).collect();
        self.push(Value::tuple(items))?;
      }
      Opcode::Map => {
        let n = self.fetch_u16() as usize;
        let _splat = self.fetch_u8();
        let start = self.stack.len() - n;
        let values: Vec<Value> = self.stack.drain(start..).collect();
        let mut map = Map::new();
        let mut iter = values.into_iter();
        while let Some(value) = iter.next() {
          match value {
            Value::Splat(splat) => match &*splat {
              Splat::Mapping(pairs) => {
                for (k, v) in pairs {
                  map.insert(k.clone(), v.clone())?;
                }
              }
              Splat::Seq(_) => {
                return Err(Error::message("cannot splat a sequence into a map"))
              }
            },
            key => {
              let value = iter
                .next()
                .ok_or_else(|| Self::corrupt("odd map construction"))?;
              map.insert(key, value)?;
            }
          }
        }
        self.push(Value::map(map))?;
      }

      Opcode::Index => {
        let with_ok = self.fetch_u8() != 0;
        let key = self.pop();
        let container = self.pop();
        let (value, found) = ops::index_get(&container, &key)?;
        self.push(value)?;
        if with_ok {
          self.push(Value::Bool(found))?;
        }
      }
      Opcode::SetIndex => {
        let value = self.pop();
        let key = self.pop();
        let container = self.pop();
        ops::index_set(&container, &key, value)?;
      }
      Opcode::Slice => {
        let flags = self.fetch_u8();
        let hi = if flags & 0b10 != 0 {
          Some(self.pop_int("slice bound")?)
        } else {
          None
        };
        let lo = if flags & 0b01 != 0 {
          Some(self.pop_int("slice bound")?)
        } else {
          None
        };
        let container = self.pop();
        let value = ops::slice(&container, lo, hi)?;
        self.push(value)?;
      }

      Opcode::Splat => {
        let mapping = self.fetch_u8() != 0;
        let value = self.pop();
        let splat = if mapping {
          match &value {
            Value::Map(m) => {
              let pairs = m
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
              Splat::Mapping(pairs)
            }
            other => {
              return Err(Error::InvalidValueType {
                sel: Some("splat".into()),
                want: "map".into(),
                got: other.type_name().into(),
              })
            }
          }
        } else {
          let items = match &value {
            Value::Array(a) => a.borrow().items().to_vec(),
            Value::Tuple(t) => t.as_slice().to_vec(),
            other => {
              let mut iter = ValueIter::new(other)?;
              let mut items = vec![];
              while let Some((_, v)) = iter.next() {
                items.push(v);
              }
              items
            }
          };
          Splat::Seq(items)
        };
        self.push(Value::Splat(Rc::new(splat)))?;
      }

      Opcode::Call => {
        let nargs = self.fetch_u8() as usize;
        let splat = self.fetch_u8() != 0;
        let nargs = if splat { self.expand_splat_seq(nargs)? } else { nargs };
        if !self.try_tail_call(nargs)? {
          self.setup_call(nargs)?;
        }
      }
      Opcode::Return => {
        let results = self.fetch_u8() as usize;
        let value = match results {
          0 => Value::Nil,
          1 => self.pop(),
          n => {
            let start = self.stack.len() - n;
            let items: Vec<Value> = self.stack.drain(start..).collect();
            Value::tuple(items)
          }
        };
        self.run_defers()?;
        let frame = self.frames.pop().expect("no active frame");
        self.stack.truncate(frame.base - 1);
        self.push(value)?;
      }
      Opcode::Closure => {
        let idx = self.fetch_u16() as usize;
        let nfree = self.fetch_u8() as usize;
        let proto = match self.unit.constants.get(idx) {
          Some(Constant::Func(f)) => self.unit.functions[*f].clone(),
          _ => return Err(Self::corrupt("closure over a non-function constant")),
        };
        let start = self.stack.len() - nfree;
        let mut free = Vec::with_capacity(nfree);
        for value in self.stack.drain(start..) {
          match value {
            Value::Cell(cell) => free.push(cell),
            _ => return Err(Self::corrupt("closure capture is not a cell")),
          }
        }
        self.push(Value::Func(Rc::new(Closure::new(proto, free))))?;
      }
      Opcode::GetBuiltin => {
        let idx = self.fetch_u8() as usize;
        let value =
          builtins::get(idx).ok_or_else(|| Self::corrupt("builtin index out of range"))?;
        self.push(value)?;
      }

      Opcode::Defer => {
        let nargs = self.fetch_u8() as usize;
        let splat = self.fetch_u8() != 0;
        let site = self.fetch_u8();
        let nargs = if splat { self.expand_splat_seq(nargs)? } else { nargs };
        let start = self.stack.len() - nargs;
        let args: Vec<Value> = self.stack.drain(start..).collect();
        let callable = self.pop();
        if !callable.is_callable() {
          return Err(Error::NotCallable {
            got: callable.type_name(),
          });
        }
        self
          .frames
          .last_mut()
          .expect("no active frame")
          .defers
          .push(Deferred {
            callable,
            args,
            site,
          });
      }
      Opcode::Try => {
        let nargs = self.fetch_u8() as usize;
        let splat = self.fetch_u8() != 0;
        let nargs = if splat { self.expand_splat_seq(nargs)? } else { nargs };
        let start = self.stack.len() - nargs;
        let args: Vec<Value> = self.stack.drain(start..).collect();
        let callable = self.pop();
        match self.call(callable, &args) {
          Ok(value) => {
            self.push(Value::tuple(vec![value, Value::Nil]))?;
          }
          Err(e) => {
            // cancellation must not be swallowed by try
            if self.abort.load(Ordering::Relaxed) {
              return Err(e);
            }
            let (msg, val) = match e.primary() {
              Error::Exception(value) => (format!("{value}"), value.clone()),
              other => (other.to_string(), Value::Nil),
            };
            let mut status = Map::new();
            status.insert(Value::from("msg"), Value::from(msg))?;
            status.insert(Value::from("val"), val)?;
            status.freeze();
            self.push(Value::tuple(vec![Value::Nil, Value::map(status)]))?;
          }
        }
      }
      Opcode::Throw => {
        let count = self.fetch_u8();
        let value = if count > 0 { self.pop() } else { Value::Nil };
        return Err(Error::Exception(value));
      }

      Opcode::IdxAssignAssert => {
        let n = self.fetch_u8() as usize;
        let len = match self.peek(0) {
          Value::Array(a) => a.borrow().len(),
          Value::Tuple(t) => t.len(),
          Value::Str(s) => s.char_len(),
          Value::Bytes(b) => b.len(),
          Value::Range(r) => r.len(),
          other => {
            return Err(Error::message(format!(
              "cannot unpack {} into {n} values",
              other.type_name()
            )))
          }
        };
        if len != n {
          return Err(Error::message(format!(
            "cannot unpack {len} values into {n}"
          )));
        }
      }
      Opcode::IdxElem => {
        let i = self.fetch_u8() as i64;
        let container = self.peek(0).clone();
        let (value, _) = ops::index_get(&container, &Value::Int(i))?;
        self.push(value)?;
      }

      Opcode::IterInit => {
        let value = self.pop();
        let iter = ValueIter::new(&value)?;
        self.push(Value::Iter(Ptr::new(iter)))?;
      }
      Opcode::IterNext => {
        let flags = self.fetch_u8();
        let iter = match self.peek(0) {
          Value::Iter(iter) => iter.clone(),
          _ => return Err(Self::corrupt("iterator step without an iterator")),
        };
        let next = iter.borrow_mut().next();
        match next {
          Some((key, value)) => {
            if flags & 0b01 != 0 {
              self.push(key)?;
            }
            if flags & 0b10 != 0 {
              self.push(value)?;
            }
            self.push(Value::Bool(true))?;
          }
          None => {
            if flags & 0b01 != 0 {
              self.push(Value::Nil)?;
            }
            if flags & 0b10 != 0 {
              self.push(Value::Nil)?;
            }
            self.push(Value::Bool(false))?;
          }
        }
      }
      Opcode::IterClose => {
        let value = self.pop();
        debug_assert!(matches!(value, Value::Iter(_)));
        drop(value);
      }
    }
    Ok(())
  }

  fn pop_int(&mut self, what: &'static str) -> Result<i64> {
    let value = self.pop();
    value.as_int().ok_or_else(|| Error::InvalidIndexType {
      sel: Some(what.into()),
      want: "int".into(),
      got: value.type_name().into(),
    })
  }

  /// Expand splat markers within the top `n` stack values; returns the new
  /// count.
  fn expand_splat_seq(&mut self, n: usize) -> Result<usize> {
    let start = self.stack.len() - n;
    if !self.stack[start..]
      .iter()
      .any(|v| matches!(v, Value::Splat(_)))
    {
      return Ok(n);
    }
    let items: Vec<Value> = self.stack.drain(start..).collect();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
      match item {
        Value::Splat(splat) => match &*splat {
          Splat::Seq(values) => out.extend(values.iter().cloned()),
          Splat::Mapping(_) => {
            return Err(Error::message("cannot splat a map into a sequence"))
          }
        },
        value => out.push(value),
      }
    }
    let count = out.len();
    for value in out {
      self.push(value)?;
    }
    Ok(count)
  }

  /// Self-recursive call in tail position: reuse the current frame instead
  /// of growing the frame stack. Requires the callee to share the current
  /// frame's function, a following `return` (optionally behind a `pop`),
  /// and no queued deferred calls.
  fn try_tail_call(&mut self, nargs: usize) -> Result<bool> {
    let callee_idx = self.stack.len() - nargs - 1;
    let closure = match &self.stack[callee_idx] {
      Value::Func(closure) => {
        let frame = self.frames.last().expect("no active frame");
        if !Arc::ptr_eq(&closure.proto, &frame.closure.proto)
          || !frame.defers.is_empty()
          || !self.next_is_return()
        {
          return Ok(false);
        }
        closure.clone()
      }
      _ => return Ok(false),
    };
    let proto = closure.proto.clone();
    let nargs = self.normalize_args(&proto, nargs)?;
    let base = self.frames.last().expect("no active frame").base;
    let args_start = self.stack.len() - nargs;
    for i in 0..nargs {
      self.stack[base + i] = std::mem::take(&mut self.stack[args_start + i]);
    }
    for i in nargs..closure.proto.num_locals {
      self.stack[base + i] = Value::Nil;
    }
    self.stack.truncate(base + closure.proto.num_locals);
    let frame = self.frames.last_mut().expect("no active frame");
    frame.closure = closure;
    frame.ip = 0;
    Ok(true)
  }

  fn next_is_return(&self) -> bool {
    let frame = self.frames.last().expect("no active frame");
    let code = &frame.closure.proto.code;
    match code.get(frame.ip) {
      Some(b) if *b == Opcode::Return as u8 => true,
      Some(b) if *b == Opcode::Pop as u8 => {
        matches!(code.get(frame.ip + 1), Some(b) if *b == Opcode::Return as u8)
      }
      _ => false,
    }
  }

  /// Dispatch a call: the stack holds the callee under `nargs` arguments.
  /// Compiled callees get a frame; native callables and type constructors
  /// complete immediately, leaving their result on the stack.
  fn setup_call(&mut self, nargs: usize) -> Result<()> {
    let callee_idx = self.stack.len() - nargs - 1;
    let callee = self.stack[callee_idx].clone();
    match callee {
      Value::Func(closure) => {
        let proto = closure.proto.clone();
        let nargs = self.normalize_args(&proto, nargs)?;
        if self.frames.len() >= MAX_FRAMES {
          return Err(Error::StackOverflow);
        }
        let base = callee_idx + 1;
        for _ in nargs..closure.proto.num_locals {
          self.push(Value::Nil)?;
        }
        self.frames.push(Frame::new(closure, base));
        Ok(())
      }
      Value::Native(f) => {
        let args: Vec<Value> = self.stack.drain(callee_idx + 1..).collect();
        self.pop();
        let result = self.call_native(&f, &args)?;
        self.push(result)
      }
      Value::Type(ty) => {
        let args: Vec<Value> = self.stack.drain(callee_idx + 1..).collect();
        self.pop();
        let result = ty.construct(&args)?;
        self.push(result)
      }
      other => Err(Error::NotCallable {
        got: other.type_name(),
      }),
    }
  }

  /// Bring the argument window in line with the callee's parameters:
  /// variadic tails fold into an array, optional parameters pad with nil,
  /// and anything else is a count mismatch.
  fn normalize_args(&mut self, proto: &FuncProto, nargs: usize) -> Result<usize> {
    let params = proto.params;
    let fixed = params.num_params - usize::from(params.variadic);
    let mut count = nargs;
    if count < fixed && fixed - count <= params.num_optional {
      for _ in count..fixed {
        self.push(Value::Nil)?;
      }
      count = fixed;
    }
    if params.variadic && count >= fixed {
      let start = self.stack.len() - (count - fixed);
      let rest: Vec<Value> = self.stack.drain(start..).collect();
      self.push(Value::array(rest))?;
      count = params.num_params;
    }
    if count != params.num_params {
      return Err(Error::WrongNumArguments {
        want_min: fixed - params.num_optional,
        want_max: if params.variadic {
          usize::MAX
        } else {
          params.num_params
        },
        got: nargs,
      });
    }
    Ok(count)
  }
}

fn classify_panic(payload: Box<dyn std::any::Any + Send>) -> Error {
  if let Some(message) = payload.downcast_ref::<&str>() {
    return Error::message(message.to_string());
  }
  if let Some(message) = payload.downcast_ref::<String>() {
    return Error::message(message.clone());
  }
  Error::message("unknown panic in native call")
}
