//! Declarative argument unpacking for native callables.
//!
//! A callable describes its parameters as `(name, destination)` pairs; a
//! name ending in `?` marks the parameter optional (a missing or nil
//! argument leaves the destination untouched), and a final `"..."`
//! parameter collects the trailing arguments.
//!
//! ```ignore
//! let mut start = 0i64;
//! let mut stop = 0i64;
//! let mut step = 1i64;
//! unpack_args(args, &mut [
//!   param("start", &mut start),
//!   param("stop?", &mut stop),
//!   param("step?", &mut step),
//! ])?;
//! ```

use crate::error::{Error, Result};
use crate::value::{Array, Capability, Map, Ptr, Range, Str, Tuple, Value};

/// A destination an argument can be unpacked into.
///
/// `accept` returns `false` on a type mismatch, which the driver turns into
/// an `InvalidArgumentType` naming the parameter.
pub trait Sink {
  fn want(&self) -> &'static str;
  fn accept(&mut self, value: &Value) -> bool;
  /// Collect the trailing arguments; only the `"..."` destination
  /// implements this.
  fn accept_rest(&mut self, _values: &[Value]) -> bool {
    false
  }
}

pub struct Param<'a> {
  name: &'a str,
  sink: &'a mut dyn Sink,
}

pub fn param<'a>(name: &'a str, sink: &'a mut dyn Sink) -> Param<'a> {
  Param { name, sink }
}

/// Map `args` onto `params`, enforcing counts and types.
pub fn unpack_args(args: &[Value], params: &mut [Param<'_>]) -> Result<()> {
  let variadic = params.last().is_some_and(|p| p.name == "...");
  let nfixed = params.len() - usize::from(variadic);
  let required = params[..nfixed]
    .iter()
    .take_while(|p| !p.name.ends_with('?'))
    .count();

  if !variadic && args.len() > nfixed {
    return Err(Error::WrongNumArguments {
      want_min: required,
      want_max: nfixed,
      got: args.len(),
    });
  }

  for (i, p) in params[..nfixed].iter_mut().enumerate() {
    let optional = p.name.ends_with('?');
    let name = p.name.trim_end_matches('?');
    match args.get(i) {
      None | Some(Value::Nil) if optional => {}
      None => {
        return Err(Error::MissingArgument {
          name: name.to_string().into(),
        })
      }
      Some(value) => {
        if !p.sink.accept(value) {
          return Err(Error::InvalidArgumentType {
            name: name.to_string().into(),
            want: p.sink.want().into(),
            got: value.type_name().into(),
          });
        }
      }
    }
  }

  if variadic {
    let rest = args.get(nfixed..).unwrap_or(&[]);
    let sink = &mut params[nfixed].sink;
    if !sink.accept_rest(rest) {
      // a non-rest sink in the "..." slot is a programming error
      debug_assert!(false, "the \"...\" parameter requires a rest sink");
    }
  }

  Ok(())
}

impl Sink for Value {
  fn want(&self) -> &'static str {
    "value"
  }

  fn accept(&mut self, value: &Value) -> bool {
    *self = value.clone();
    true
  }
}

impl Sink for i64 {
  fn want(&self) -> &'static str {
    "int"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_int() {
      Some(v) => {
        *self = v;
        true
      }
      None => false,
    }
  }
}

impl Sink for f64 {
  fn want(&self) -> &'static str {
    "float"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value {
      Value::Float(v) => {
        *self = *v;
        true
      }
      Value::Int(v) => {
        *self = *v as f64;
        true
      }
      _ => false,
    }
  }
}

impl Sink for bool {
  fn want(&self) -> &'static str {
    "bool"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_bool() {
      Some(v) => {
        *self = v;
        true
      }
      None => false,
    }
  }
}

impl Sink for char {
  fn want(&self) -> &'static str {
    "char"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_char() {
      Some(v) => {
        *self = v;
        true
      }
      None => false,
    }
  }
}

impl Sink for Str {
  fn want(&self) -> &'static str {
    "string"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_str() {
      Some(v) => {
        *self = v.clone();
        true
      }
      None => false,
    }
  }
}

impl Sink for Ptr<Array> {
  fn want(&self) -> &'static str {
    "array"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_array() {
      Some(v) => {
        *self = v.clone();
        true
      }
      None => false,
    }
  }
}

impl Sink for Ptr<Map> {
  fn want(&self) -> &'static str {
    "map"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_map() {
      Some(v) => {
        *self = v.clone();
        true
      }
      None => false,
    }
  }
}

impl Sink for Tuple {
  fn want(&self) -> &'static str {
    "tuple"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value.as_tuple() {
      Some(v) => {
        *self = v.clone();
        true
      }
      None => false,
    }
  }
}

impl Sink for Range {
  fn want(&self) -> &'static str {
    "range"
  }

  fn accept(&mut self, value: &Value) -> bool {
    match value {
      Value::Range(v) => {
        *self = *v;
        true
      }
      _ => false,
    }
  }
}

/// The `"..."` destination.
impl Sink for Vec<Value> {
  fn want(&self) -> &'static str {
    "..."
  }

  fn accept(&mut self, value: &Value) -> bool {
    self.push(value.clone());
    true
  }

  fn accept_rest(&mut self, values: &[Value]) -> bool {
    self.extend_from_slice(values);
    true
  }
}

macro_rules! capability_sink {
  ($(#[$meta:meta])* $name:ident, $capability:ident, $want:literal) => {
    $(#[$meta])*
    #[derive(Default)]
    pub struct $name(pub Value);

    impl Sink for $name {
      fn want(&self) -> &'static str {
        $want
      }

      fn accept(&mut self, value: &Value) -> bool {
        if value.satisfies(Capability::$capability) {
          self.0 = value.clone();
          true
        } else {
          false
        }
      }
    }
  };
}

capability_sink!(
  /// Any callable value.
  Callable,
  Callable,
  "callable"
);
capability_sink!(
  /// Any iterable value.
  Iterable,
  Iterable,
  "iterable"
);
capability_sink!(
  /// Any hashable value.
  Hashable,
  Hashable,
  "hashable"
);
capability_sink!(
  /// Any sized value.
  Sized,
  Sized,
  "sized"
);
capability_sink!(
  /// Any integer-indexable sequence.
  Indexable,
  Indexable,
  "indexable"
);
