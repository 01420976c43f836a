//! First-class type descriptors.
//!
//! `type(x)` returns one of these; calling a type descriptor invokes its
//! constructor. The default constructor is a one-argument conversion; the
//! range descriptor instead builds a progression from
//! `start[, stop[, step]]`.

use crate::error::{Error, Result};
use crate::unpack::{param, unpack_args};
use crate::value::{ops, Range, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
  Nil,
  Bool,
  Int,
  Float,
  Char,
  Str,
  Bytes,
  Array,
  Map,
  Tuple,
  Range,
  Error,
  Func,
  Type,
  Cell,
  Splat,
  Iter,
}

impl Type {
  pub fn name(self) -> &'static str {
    match self {
      Type::Nil => "nil",
      Type::Bool => "bool",
      Type::Int => "int",
      Type::Float => "float",
      Type::Char => "char",
      Type::Str => "string",
      Type::Bytes => "bytes",
      Type::Array => "array",
      Type::Map => "map",
      Type::Tuple => "tuple",
      Type::Range => "range",
      Type::Error => "error",
      Type::Func => "function",
      Type::Type => "type",
      Type::Cell => "cell",
      Type::Splat => "splat",
      Type::Iter => "iterator",
    }
  }

  /// Invoke the constructor.
  pub fn construct(self, args: &[Value]) -> Result<Value> {
    if let Type::Range = self {
      return construct_range(args);
    }
    if args.len() != 1 {
      return Err(Error::WrongNumArguments {
        want_min: 1,
        want_max: 1,
        got: args.len(),
      });
    }
    ops::convert(&args[0], self)
  }
}

/// `range(stop)`, `range(start, stop)`, or `range(start, stop, step)`.
fn construct_range(args: &[Value]) -> Result<Value> {
  if let [Value::Range(r)] = args {
    return Ok(Value::Range(*r));
  }
  if args.is_empty() || args.len() > 3 {
    return Err(Error::WrongNumArguments {
      want_min: 1,
      want_max: 3,
      got: args.len(),
    });
  }
  let mut a = 0i64;
  let mut b = 0i64;
  let mut step = 1i64;
  unpack_args(
    args,
    &mut [
      param("start", &mut a),
      param("stop?", &mut b),
      param("step?", &mut step),
    ],
  )?;
  let range = if args.len() == 1 {
    Range::new(0, a, 1)?
  } else {
    Range::new(a, b, step)?
  };
  Ok(Value::Range(range))
}

impl std::fmt::Display for Type {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name())
  }
}
