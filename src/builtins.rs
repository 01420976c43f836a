//! The built-in function universe.
//!
//! A process-global, read-only table of native functions and type
//! descriptors. Frontends resolve builtin names against this table first;
//! the `get_builtin` instruction materializes entries by index.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::unpack::{param, unpack_args, Hashable, Sized};
use crate::value::func::NativeFn;
use crate::value::{ops, Array, Capability, Map, NativeFunction, Ptr, Str, Type, Value};
use crate::vm::Vm;

pub struct Builtin {
  pub name: &'static str,
  pub kind: BuiltinKind,
}

pub enum BuiltinKind {
  Function(NativeFn),
  Type(Type),
}

macro_rules! universe {
  ($( $name:literal => $kind:expr ),* $(,)?) => {
    pub const UNIVERSE: &[Builtin] = &[
      $( Builtin { name: $name, kind: $kind } ),*
    ];
  };
}

universe! {
  "type" => BuiltinKind::Function(builtin_type),
  "typename" => BuiltinKind::Function(builtin_typename),
  "clone" => BuiltinKind::Function(builtin_clone),
  "freeze" => BuiltinKind::Function(builtin_freeze),
  "immutable" => BuiltinKind::Function(builtin_immutable),
  "satisfies" => BuiltinKind::Function(builtin_satisfies),
  "len" => BuiltinKind::Function(builtin_len),
  "append" => BuiltinKind::Function(builtin_append),
  "copy" => BuiltinKind::Function(builtin_copy),
  "delete" => BuiltinKind::Function(builtin_delete),
  "splice" => BuiltinKind::Function(builtin_splice),
  "insert" => BuiltinKind::Function(builtin_insert),
  "clear" => BuiltinKind::Function(builtin_clear),
  "contains" => BuiltinKind::Function(builtin_contains),
  "format" => BuiltinKind::Function(builtin_format),
  "fail" => BuiltinKind::Function(builtin_fail),
  "min" => BuiltinKind::Function(builtin_min),
  "max" => BuiltinKind::Function(builtin_max),
  // the range constructor is its type descriptor, so `type(x) == range`
  // resolves like the other type names
  "range" => BuiltinKind::Type(Type::Range),
  "bool" => BuiltinKind::Type(Type::Bool),
  "int" => BuiltinKind::Type(Type::Int),
  "float" => BuiltinKind::Type(Type::Float),
  "char" => BuiltinKind::Type(Type::Char),
  "string" => BuiltinKind::Type(Type::Str),
  "bytes" => BuiltinKind::Type(Type::Bytes),
  "array" => BuiltinKind::Type(Type::Array),
  "map" => BuiltinKind::Type(Type::Map),
  "tuple" => BuiltinKind::Type(Type::Tuple),
  "error" => BuiltinKind::Type(Type::Error),
}

pub fn lookup(name: &str) -> Option<usize> {
  UNIVERSE.iter().position(|b| b.name == name)
}

/// Materialize universe entry `index` as a value.
pub fn get(index: usize) -> Option<Value> {
  let builtin = UNIVERSE.get(index)?;
  Some(match builtin.kind {
    BuiltinKind::Function(f) => Value::Native(Rc::new(NativeFunction::from_fn(builtin.name, f))),
    BuiltinKind::Type(ty) => Value::Type(ty),
  })
}

fn want_args(args: &[Value], min: usize, max: usize) -> Result<()> {
  if args.len() < min || args.len() > max {
    return Err(Error::WrongNumArguments {
      want_min: min,
      want_max: max,
      got: args.len(),
    });
  }
  Ok(())
}

fn builtin_type(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  Ok(Value::Type(args[0].type_of()))
}

fn builtin_typename(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  Ok(Value::from(args[0].type_name()))
}

fn builtin_clone(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  Ok(args[0].deep_clone())
}

fn builtin_freeze(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  Ok(args[0].freeze())
}

fn builtin_immutable(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  Ok(Value::Bool(args[0].is_immutable()))
}

fn builtin_satisfies(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 2, usize::MAX)?;
  for (i, cap) in args[1..].iter().enumerate() {
    let Some(name) = cap.as_str() else {
      return Err(Error::InvalidArgumentType {
        name: format!("cap{}", i + 1).into(),
        want: "string".into(),
        got: cap.type_name().into(),
      });
    };
    let Some(capability) = Capability::from_name(name.as_str()) else {
      return Err(Error::message(format!("unknown capability '{name}'")));
    };
    if !args[0].satisfies(capability) {
      return Ok(Value::Bool(false));
    }
  }
  Ok(Value::Bool(true))
}

fn builtin_len(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  let mut sized = Sized::default();
  unpack_args(args, &mut [param("value", &mut sized)])?;
  let len = match &sized.0 {
    Value::Str(s) => s.char_len(),
    Value::Bytes(b) => b.len(),
    Value::Array(a) => a.borrow().len(),
    Value::Map(m) => m.borrow().len(),
    Value::Tuple(t) => t.len(),
    Value::Range(r) => r.len(),
    _ => unreachable!("the sized sink admits only sized values"),
  };
  Ok(Value::Int(len as i64))
}

fn builtin_append(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, usize::MAX)?;
  let mut arr = Ptr::new(Array::new());
  let mut items = Vec::new();
  unpack_args(args, &mut [param("array", &mut arr), param("...", &mut items)])?;
  let mut out = arr.borrow().items().to_vec();
  out.extend(items);
  Ok(Value::array(out))
}

fn builtin_copy(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 2, 2)?;
  let mut dst = Ptr::new(Array::new());
  unpack_args(&args[..1], &mut [param("dst", &mut dst)])?;
  let copied = match &args[1] {
    Value::Array(src) => {
      if dst.ptr_eq(src) {
        dst.borrow().len().min(src.borrow().len())
      } else {
        dst.borrow_mut().copy_from(src.borrow().items())?
      }
    }
    Value::Tuple(src) => dst.borrow_mut().copy_from(src.as_slice())?,
    other => {
      return Err(Error::InvalidArgumentType {
        name: "src".into(),
        want: "array or tuple".into(),
        got: other.type_name().into(),
      })
    }
  };
  Ok(Value::Int(copied as i64))
}

fn builtin_delete(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 2, 3)?;
  match &args[0] {
    Value::Array(a) => {
      let mut start = 0i64;
      let mut stop = i64::MIN;
      unpack_args(
        &args[1..],
        &mut [param("start", &mut start), param("stop?", &mut stop)],
      )?;
      let stop = if stop == i64::MIN { start + 1 } else { stop };
      let removed = a.borrow_mut().splice(start, stop, vec![])?;
      Ok(Value::array(removed))
    }
    Value::Map(m) => {
      want_args(args, 2, 2)?;
      let previous = m.borrow_mut().remove(&args[1])?;
      Ok(previous.unwrap_or(Value::Nil))
    }
    other => Err(Error::InvalidArgumentType {
      name: "collection".into(),
      want: "array or map".into(),
      got: other.type_name().into(),
    }),
  }
}

fn builtin_splice(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, usize::MAX)?;
  let mut arr = Ptr::new(Array::new());
  let mut start = 0i64;
  let mut stop = i64::MIN;
  let mut items = Vec::new();
  unpack_args(
    args,
    &mut [
      param("array", &mut arr),
      param("start?", &mut start),
      param("stop?", &mut stop),
      param("...", &mut items),
    ],
  )?;
  let stop = if stop == i64::MIN {
    arr.borrow().len() as i64
  } else {
    stop
  };
  let removed = arr.borrow_mut().splice(start, stop, items)?;
  Ok(Value::array(removed))
}

fn builtin_insert(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 2, usize::MAX)?;
  match &args[0] {
    Value::Array(a) => {
      let mut index = 0i64;
      let mut items = Vec::new();
      unpack_args(
        &args[1..],
        &mut [param("index", &mut index), param("...", &mut items)],
      )?;
      a.borrow_mut().insert(index, items)?;
      Ok(Value::Nil)
    }
    Value::Map(m) => {
      want_args(args, 3, 3)?;
      let mut key = Hashable::default();
      let mut value = Value::Nil;
      unpack_args(
        &args[1..],
        &mut [param("key", &mut key), param("value", &mut value)],
      )?;
      m.borrow_mut().insert(key.0, value)?;
      Ok(Value::Nil)
    }
    other => Err(Error::InvalidArgumentType {
      name: "collection".into(),
      want: "array or map".into(),
      got: other.type_name().into(),
    }),
  }
}

fn builtin_clear(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, 1)?;
  match &args[0] {
    Value::Array(a) => a.borrow_mut().clear()?,
    Value::Map(m) => m.borrow_mut().clear()?,
    other => {
      return Err(Error::InvalidArgumentType {
        name: "collection".into(),
        want: "array or map".into(),
        got: other.type_name().into(),
      })
    }
  }
  Ok(Value::Nil)
}

fn builtin_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 2, 2)?;
  Ok(Value::Bool(ops::contains(&args[0], &args[1])?))
}

fn builtin_format(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, usize::MAX)?;
  let mut fmt = Str::default();
  unpack_args(&args[..1], &mut [param("format", &mut fmt)])?;
  Ok(Value::from(format_verbs(fmt.as_str(), &args[1..])?))
}

fn builtin_fail(vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, usize::MAX)?;
  let mut fmt = Str::default();
  unpack_args(&args[..1], &mut [param("format", &mut fmt)])?;
  let message = format_verbs(fmt.as_str(), &args[1..])?;
  vm.set_pending_error(Error::message(message));
  Ok(Value::Nil)
}

fn builtin_min(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, usize::MAX)?;
  reduce_ordered(args, ops::CmpOp::Lt)
}

fn builtin_max(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
  want_args(args, 1, usize::MAX)?;
  reduce_ordered(args, ops::CmpOp::Gt)
}

fn reduce_ordered(args: &[Value], op: ops::CmpOp) -> Result<Value> {
  let mut best = args[0].clone();
  for candidate in &args[1..] {
    if ops::compare(op, candidate, &best)? {
      best = candidate.clone();
    }
  }
  Ok(best)
}

/// The verb subset of the formatting helper: `%v %s %d %f %t %q %c %%`.
fn format_verbs(fmt: &str, args: &[Value]) -> Result<String> {
  use std::fmt::Write;

  let mut out = String::new();
  let mut next = 0;
  let mut chars = fmt.chars();
  while let Some(c) = chars.next() {
    if c != '%' {
      out.push(c);
      continue;
    }
    let Some(verb) = chars.next() else {
      return Err(Error::message("format string ends with '%'"));
    };
    if verb == '%' {
      out.push('%');
      continue;
    }
    let Some(arg) = args.get(next) else {
      return Err(Error::message("not enough arguments for format string"));
    };
    next += 1;
    let mismatch = |want: &'static str| Error::InvalidArgumentType {
      name: format!("%{verb}").into(),
      want: want.into(),
      got: arg.type_name().into(),
    };
    match verb {
      'v' => write!(out, "{arg}").unwrap(),
      'q' => write!(out, "{arg:?}").unwrap(),
      's' => match arg {
        Value::Str(s) => out.push_str(s.as_str()),
        _ => return Err(mismatch("string")),
      },
      'd' => match arg {
        Value::Int(i) => write!(out, "{i}").unwrap(),
        Value::Char(c) => write!(out, "{}", *c as i64).unwrap(),
        _ => return Err(mismatch("int")),
      },
      'f' => match arg {
        Value::Float(f) => write!(out, "{f:?}").unwrap(),
        Value::Int(i) => write!(out, "{:?}", *i as f64).unwrap(),
        _ => return Err(mismatch("float")),
      },
      't' => match arg {
        Value::Bool(b) => write!(out, "{b}").unwrap(),
        _ => return Err(mismatch("bool")),
      },
      'c' => match arg {
        Value::Char(c) => out.push(*c),
        _ => return Err(mismatch("char")),
      },
      other => return Err(Error::message(format!("unknown format verb '%{other}'"))),
    }
  }
  if next < args.len() {
    return Err(Error::message("too many arguments for format string"));
  }
  Ok(out)
}
