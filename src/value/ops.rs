//! Uniform operations over values.
//!
//! The dispatch loop and the builtins never match on value kinds directly;
//! they call the helpers here. The comparison protocol is the mirrored one:
//! try the left operand's ordering, and when it does not define one against
//! a *different* right-hand kind, retry through the right operand with the
//! mirrored operator (`<` ↔ `>`, `<=` ↔ `>=`; `==`/`!=` are their own
//! mirror). A same-kind pair that defines no ordering fails immediately.
//! Binary operators probe both sides the same way, with the non-commutative
//! ones keyed on which operand ended up as the receiver.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::value::{float_to_int_exact, Array, ErrorValue, Map, Ptr, Str, Type, Value, ValueIter};
use crate::vm::{MAX_BYTES_LEN, MAX_STRING_LEN};

macro_rules! operator_enum {
  ($name:ident { $($variant:ident = $symbol:literal),* $(,)? }) => {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum $name {
      $($variant),*
    }

    impl $name {
      pub fn symbol(self) -> &'static str {
        match self {
          $(Self::$variant => $symbol),*
        }
      }

      pub fn from_u8(value: u8) -> Option<Self> {
        $(
          if value == Self::$variant as u8 {
            return Some(Self::$variant);
          }
        )*
        None
      }
    }
  };
}

operator_enum!(BinOp {
  Add = "+",
  Sub = "-",
  Mul = "*",
  Div = "/",
  Rem = "%",
  And = "&",
  Or = "|",
  Xor = "^",
  AndNot = "&^",
  Shl = "<<",
  Shr = ">>",
  Coalesce = "??",
});

operator_enum!(CmpOp {
  Eq = "==",
  Ne = "!=",
  Lt = "<",
  Gt = ">",
  Le = "<=",
  Ge = ">=",
});

operator_enum!(UnOp {
  Pos = "+",
  Neg = "-",
  Not = "!",
  BNot = "^",
});

impl CmpOp {
  /// The operator the right operand answers when the left defers to it.
  pub fn mirror(self) -> CmpOp {
    match self {
      CmpOp::Lt => CmpOp::Gt,
      CmpOp::Gt => CmpOp::Lt,
      CmpOp::Le => CmpOp::Ge,
      CmpOp::Ge => CmpOp::Le,
      CmpOp::Eq => CmpOp::Eq,
      CmpOp::Ne => CmpOp::Ne,
    }
  }

  fn test(self, ord: Ordering) -> bool {
    match self {
      CmpOp::Lt => ord == Ordering::Less,
      CmpOp::Gt => ord == Ordering::Greater,
      CmpOp::Le => ord != Ordering::Greater,
      CmpOp::Ge => ord != Ordering::Less,
      CmpOp::Eq => ord == Ordering::Equal,
      CmpOp::Ne => ord != Ordering::Equal,
    }
  }
}

pub fn binary_op(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value> {
  use Value as V;

  // ?? short-circuits on the left operand without any dispatch
  if let BinOp::Coalesce = op {
    return Ok(if lhs.is_nil() { rhs.clone() } else { lhs.clone() });
  }

  match (lhs, rhs) {
    (V::Int(a), V::Int(b)) => int_binop(op, *a, *b),
    (V::Float(a), V::Float(b)) => float_binop(op, *a, *b),
    (V::Int(a), V::Float(b)) => float_binop(op, *a as f64, *b),
    (V::Float(a), V::Int(b)) => float_binop(op, *a, *b as f64),

    (V::Char(c), V::Int(i)) if op == BinOp::Add => char_offset(*c, *i as i128),
    (V::Char(c), V::Int(i)) if op == BinOp::Sub => char_offset(*c, -(*i as i128)),
    (V::Int(i), V::Char(c)) if op == BinOp::Add => char_offset(*c, *i as i128),
    (V::Char(a), V::Char(b)) if op == BinOp::Sub => Ok(V::Int(*a as i64 - *b as i64)),

    (V::Str(a), V::Str(b)) if op == BinOp::Add => str_concat(a.as_str(), b.as_str()),
    (V::Str(a), V::Char(b)) if op == BinOp::Add => {
      str_concat(a.as_str(), b.encode_utf8(&mut [0; 4]))
    }
    (V::Char(a), V::Str(b)) if op == BinOp::Add => {
      str_concat(a.encode_utf8(&mut [0; 4]), b.as_str())
    }
    (V::Str(s), V::Int(n)) | (V::Int(n), V::Str(s)) if op == BinOp::Mul => str_repeat(s, *n),

    (V::Bytes(a), V::Bytes(b)) if op == BinOp::Add => {
      let total = a.len() + b.len();
      if total > MAX_BYTES_LEN {
        return Err(Error::message("bytes size limit exceeded"));
      }
      let mut out = Vec::with_capacity(total);
      out.extend_from_slice(a.as_slice());
      out.extend_from_slice(b.as_slice());
      Ok(V::Bytes(out.into()))
    }
    (V::Bytes(b), V::Int(n)) | (V::Int(n), V::Bytes(b)) if op == BinOp::Mul => bytes_repeat(b, *n),

    (V::Array(a), V::Array(b)) if op == BinOp::Add => {
      let mut items = a.borrow().items().to_vec();
      items.extend_from_slice(b.borrow().items());
      Ok(Value::array(items))
    }
    (V::Array(a), V::Int(n)) | (V::Int(n), V::Array(a)) if op == BinOp::Mul => array_repeat(a, *n),

    (V::Tuple(a), V::Tuple(b)) if op == BinOp::Add => {
      let mut items = a.as_slice().to_vec();
      items.extend_from_slice(b.as_slice());
      Ok(Value::tuple(items))
    }

    (V::Map(a), V::Map(b)) if op == BinOp::Or => {
      // union; the right-hand side wins on key collision
      let mut out = Map::new();
      for (k, v) in a.borrow().iter() {
        out.insert(k.clone(), v.clone())?;
      }
      for (k, v) in b.borrow().iter() {
        out.insert(k.clone(), v.clone())?;
      }
      Ok(Value::map(out))
    }

    _ => Err(Error::invalid_binop(op.symbol(), lhs, rhs)),
  }
}

fn int_binop(op: BinOp, a: i64, b: i64) -> Result<Value> {
  let v = match op {
    BinOp::Add => a.wrapping_add(b),
    BinOp::Sub => a.wrapping_sub(b),
    BinOp::Mul => a.wrapping_mul(b),
    BinOp::Div => {
      if b == 0 {
        return Err(Error::DivisionByZero);
      }
      a.wrapping_div(b)
    }
    BinOp::Rem => {
      if b == 0 {
        return Err(Error::DivisionByZero);
      }
      a.wrapping_rem(b)
    }
    BinOp::And => a & b,
    BinOp::Or => a | b,
    BinOp::Xor => a ^ b,
    BinOp::AndNot => a & !b,
    BinOp::Shl => {
      if b < 0 {
        return Err(Error::message("negative shift count"));
      } else if b >= 64 {
        0
      } else {
        ((a as u64) << b) as i64
      }
    }
    BinOp::Shr => {
      if b < 0 {
        return Err(Error::message("negative shift count"));
      } else if b >= 64 {
        if a < 0 {
          -1
        } else {
          0
        }
      } else {
        a >> b
      }
    }
    BinOp::Coalesce => unreachable!("?? is handled before dispatch"),
  };
  Ok(Value::Int(v))
}

fn float_binop(op: BinOp, a: f64, b: f64) -> Result<Value> {
  let v = match op {
    BinOp::Add => a + b,
    BinOp::Sub => a - b,
    BinOp::Mul => a * b,
    BinOp::Div => a / b,
    BinOp::Rem => a % b,
    _ => {
      return Err(Error::InvalidOperator {
        op: op.symbol(),
        lhs: "float".into(),
        rhs: Some("float".into()),
      })
    }
  };
  Ok(Value::Float(v))
}

fn char_offset(c: char, offset: i128) -> Result<Value> {
  u32::try_from(c as i128 + offset)
    .ok()
    .and_then(char::from_u32)
    .map(Value::Char)
    .ok_or_else(|| Error::message("character value out of range"))
}

fn str_concat(a: &str, b: &str) -> Result<Value> {
  if a.len() + b.len() > MAX_STRING_LEN {
    return Err(Error::message("string size limit exceeded"));
  }
  let mut out = String::with_capacity(a.len() + b.len());
  out.push_str(a);
  out.push_str(b);
  Ok(Value::from(out))
}

fn str_repeat(s: &Str, n: i64) -> Result<Value> {
  let n = usize::try_from(n).map_err(|_| Error::message("negative repeat count"))?;
  if s.as_str().len().saturating_mul(n) > MAX_STRING_LEN {
    return Err(Error::message("string size limit exceeded"));
  }
  Ok(Value::from(s.as_str().repeat(n)))
}

fn bytes_repeat(b: &crate::value::Bytes, n: i64) -> Result<Value> {
  let n = usize::try_from(n).map_err(|_| Error::message("negative repeat count"))?;
  if b.len().saturating_mul(n) > MAX_BYTES_LEN {
    return Err(Error::message("bytes size limit exceeded"));
  }
  Ok(Value::Bytes(b.as_slice().repeat(n).into()))
}

fn array_repeat(a: &Ptr<Array>, n: i64) -> Result<Value> {
  let n = usize::try_from(n).map_err(|_| Error::message("negative repeat count"))?;
  let src = a.borrow();
  let mut items = Vec::with_capacity(src.len().saturating_mul(n));
  for _ in 0..n {
    // repeated elements are clones, not shared handles
    items.extend(src.items().iter().map(Value::deep_clone));
  }
  Ok(Value::array(items))
}

pub fn unary_op(op: UnOp, operand: &Value) -> Result<Value> {
  use Value as V;
  match (op, operand) {
    // `!` is total
    (UnOp::Not, v) => Ok(V::Bool(v.is_falsy())),
    (UnOp::Pos, V::Int(_) | V::Float(_)) => Ok(operand.clone()),
    (UnOp::Neg, V::Int(v)) => Ok(V::Int(v.wrapping_neg())),
    (UnOp::Neg, V::Float(v)) => Ok(V::Float(-v)),
    (UnOp::BNot, V::Int(v)) => Ok(V::Int(!v)),
    _ => Err(Error::invalid_unop(op.symbol(), operand)),
  }
}

/// Total equality. Numeric kinds (int, float, char) unify; mutable
/// containers compare structurally; functions, errors, and type descriptors
/// compare by identity; mismatched kinds are unequal.
pub fn equal(lhs: &Value, rhs: &Value) -> bool {
  use Value as V;
  match (lhs, rhs) {
    (V::Nil, V::Nil) => true,
    (V::Bool(a), V::Bool(b)) => a == b,
    (V::Int(_) | V::Float(_) | V::Char(_), V::Int(_) | V::Float(_) | V::Char(_)) => {
      numeric_eq(lhs, rhs)
    }
    (V::Str(a), V::Str(b)) => a == b,
    (V::Bytes(a), V::Bytes(b)) => a == b,
    (V::Array(a), V::Array(b)) => {
      if a.ptr_eq(b) {
        return true;
      }
      let (a, b) = (a.borrow(), b.borrow());
      a.len() == b.len()
        && a
          .items()
          .iter()
          .zip(b.items().iter())
          .all(|(x, y)| equal(x, y))
    }
    (V::Map(a), V::Map(b)) => {
      if a.ptr_eq(b) {
        return true;
      }
      let (a, b) = (a.borrow(), b.borrow());
      a.len() == b.len()
        && a.iter().all(|(k, v)| {
          // keys in a live map are hashable
          matches!(b.get(k), Ok(Some(other)) if equal(v, &other))
        })
    }
    (V::Tuple(a), V::Tuple(b)) => {
      a.ptr_eq(b)
        || (a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| equal(x, y)))
    }
    (V::Range(a), V::Range(b)) => a == b,
    (V::Error(a), V::Error(b)) => std::rc::Rc::ptr_eq(a, b),
    (V::Native(a), V::Native(b)) => std::rc::Rc::ptr_eq(a, b),
    (V::Func(a), V::Func(b)) => std::rc::Rc::ptr_eq(a, b),
    (V::Type(a), V::Type(b)) => a == b,
    (V::Cell(a), V::Cell(b)) => a.ptr_eq(b),
    _ => false,
  }
}

fn numeric_eq(lhs: &Value, rhs: &Value) -> bool {
  use Value as V;
  match (lhs, rhs) {
    (V::Int(a), V::Int(b)) => a == b,
    (V::Float(a), V::Float(b)) => a == b,
    (V::Char(a), V::Char(b)) => a == b,
    (V::Int(a), V::Float(b)) | (V::Float(b), V::Int(a)) => float_to_int_exact(*b) == Some(*a),
    (V::Char(c), V::Int(i)) | (V::Int(i), V::Char(c)) => *c as i64 == *i,
    (V::Char(c), V::Float(f)) | (V::Float(f), V::Char(c)) => {
      float_to_int_exact(*f) == Some(*c as i64)
    }
    _ => false,
  }
}

/// Ordering as defined by the left operand, or `None` when it defines none
/// for this pair. The inner `None` marks an unordered result (NaN).
fn ordering(lhs: &Value, rhs: &Value) -> Option<Option<Ordering>> {
  use Value as V;
  match (lhs, rhs) {
    (V::Int(a), V::Int(b)) => Some(Some(a.cmp(b))),
    (V::Char(a), V::Char(b)) => Some(Some(a.cmp(b))),
    (V::Float(a), V::Float(b)) => Some(a.partial_cmp(b)),
    (V::Int(a), V::Float(b)) => Some((*a as f64).partial_cmp(b)),
    (V::Float(a), V::Int(b)) => Some(a.partial_cmp(&(*b as f64))),
    (V::Char(a), V::Int(b)) => Some(Some((*a as i64).cmp(b))),
    (V::Int(a), V::Char(b)) => Some(Some(a.cmp(&(*b as i64)))),
    (V::Char(a), V::Float(b)) => Some((*a as i64 as f64).partial_cmp(b)),
    (V::Float(a), V::Char(b)) => Some(a.partial_cmp(&(*b as i64 as f64))),
    (V::Str(a), V::Str(b)) => Some(Some(a.cmp(b))),
    (V::Bytes(a), V::Bytes(b)) => Some(Some(a.as_slice().cmp(b.as_slice()))),
    _ => None,
  }
}

pub fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool> {
  // equality has total fallbacks and never consults the ordering
  match op {
    CmpOp::Eq => return Ok(equal(lhs, rhs)),
    CmpOp::Ne => return Ok(!equal(lhs, rhs)),
    _ => {}
  }
  if lhs.is_nil() || rhs.is_nil() {
    return Err(Error::invalid_binop(op.symbol(), lhs, rhs));
  }
  if let Some(ord) = ordering(lhs, rhs) {
    return Ok(ord.map(|o| op.test(o)).unwrap_or(false));
  }
  // the left kind defines no ordering here; a same-kind pair fails
  // outright, otherwise the right kind answers the mirrored operator
  if lhs.type_of() != rhs.type_of() {
    if let Some(ord) = ordering(rhs, lhs) {
      return Ok(ord.map(|o| op.mirror().test(o)).unwrap_or(false));
    }
  }
  Err(Error::invalid_binop(op.symbol(), lhs, rhs))
}

/// Membership: substring/rune in string, byte in bytes, element in
/// array/tuple, key in map, integer in range, error in cause chain.
pub fn contains(container: &Value, needle: &Value) -> Result<bool> {
  use Value as V;
  match (container, needle) {
    (V::Str(s), V::Str(sub)) => Ok(s.as_str().contains(sub.as_str())),
    (V::Str(s), V::Char(c)) => Ok(s.as_str().contains(*c)),
    (V::Bytes(b), V::Int(i)) => {
      Ok(u8::try_from(*i).is_ok_and(|byte| b.as_slice().contains(&byte)))
    }
    (V::Array(a), _) => Ok(a.borrow().items().iter().any(|v| equal(v, needle))),
    (V::Tuple(t), _) => Ok(t.iter().any(|v| equal(v, needle))),
    (V::Map(m), _) => m.borrow().contains_key(needle),
    (V::Range(r), V::Int(i)) => Ok(r.contains_int(*i)),
    (V::Error(e), V::Error(_)) => {
      let mut link = Some(e.clone());
      while let Some(current) = link {
        if equal(&V::Error(current.clone()), needle) {
          return Ok(true);
        }
        link = current.cause().cloned();
      }
      Ok(false)
    }
    _ => Err(Error::InvalidOperator {
      op: "in",
      lhs: needle.type_name().into(),
      rhs: Some(container.type_name().into()),
    }),
  }
}

/// Indexed read. Returns `(value, found)`: an absent element reads as nil
/// with `found == false`, so callers can tell "absent" from
/// "present-but-nil". A key of the wrong type is an error.
pub fn index_get(container: &Value, key: &Value) -> Result<(Value, bool)> {
  use Value as V;
  match container {
    V::Array(a) => {
      let i = int_index(container, key)?;
      match usize::try_from(i).ok().and_then(|i| a.borrow().get(i)) {
        Some(v) => Ok((v, true)),
        None => Ok((V::Nil, false)),
      }
    }
    V::Tuple(t) => {
      let i = int_index(container, key)?;
      match usize::try_from(i).ok().and_then(|i| t.get(i).cloned()) {
        Some(v) => Ok((v, true)),
        None => Ok((V::Nil, false)),
      }
    }
    V::Str(s) => {
      let i = int_index(container, key)?;
      match usize::try_from(i).ok().and_then(|i| s.char_at(i)) {
        Some(c) => Ok((V::Char(c), true)),
        None => Ok((V::Nil, false)),
      }
    }
    V::Bytes(b) => {
      let i = int_index(container, key)?;
      match usize::try_from(i)
        .ok()
        .and_then(|i| b.as_slice().get(i).copied())
      {
        Some(byte) => Ok((V::Int(byte as i64), true)),
        None => Ok((V::Nil, false)),
      }
    }
    V::Range(r) => {
      let i = int_index(container, key)?;
      match usize::try_from(i).ok().and_then(|i| r.at(i)) {
        Some(v) => Ok((V::Int(v), true)),
        None => Ok((V::Nil, false)),
      }
    }
    V::Map(m) => match m.borrow().get(key)? {
      Some(v) => Ok((v, true)),
      None => Ok((V::Nil, false)),
    },
    other => Err(Error::message(format!(
      "{} is not indexable",
      other.type_name()
    ))),
  }
}

fn int_index(container: &Value, key: &Value) -> Result<i64> {
  match key {
    Value::Int(i) => Ok(*i),
    other => Err(Error::InvalidIndexType {
      sel: Some(container.type_name().into()),
      want: "int".into(),
      got: other.type_name().into(),
    }),
  }
}

/// Indexed write. Unlike reads, an out-of-range sequence index is an error.
pub fn index_set(container: &Value, key: &Value, value: Value) -> Result<()> {
  use Value as V;
  match container {
    V::Array(a) => {
      let i = int_index(container, key)?;
      a.borrow_mut().set(i, value)
    }
    V::Map(m) => {
      m.borrow_mut().insert(key.clone(), value)?;
      Ok(())
    }
    other => Err(Error::message(format!(
      "{} is not index-assignable",
      other.type_name()
    ))),
  }
}

/// Field read: kinds with native fields would answer first; everything else
/// falls back to indexing with the field name as a string key.
pub fn field_get(container: &Value, name: &str) -> Result<Value> {
  match container {
    Value::Map(m) => match m.borrow().get(&Value::from(name))? {
      Some(v) => Ok(v),
      None => Err(Error::NoSuchField {
        name: name.to_string().into(),
      }),
    },
    _ => Err(Error::NoSuchField {
      name: name.to_string().into(),
    }),
  }
}

pub fn field_set(container: &Value, name: &str, value: Value) -> Result<()> {
  match container {
    Value::Map(m) => {
      m.borrow_mut().insert(Value::from(name), value)?;
      Ok(())
    }
    _ => Err(Error::NoSuchField {
      name: name.to_string().into(),
    }),
  }
}

/// Slice `[lo, hi)` with bounds `0 <= lo <= hi <= len`.
pub fn slice(container: &Value, lo: Option<i64>, hi: Option<i64>) -> Result<Value> {
  use Value as V;
  let len = match container {
    V::Str(s) => s.char_len(),
    V::Bytes(b) => b.len(),
    V::Array(a) => a.borrow().len(),
    V::Tuple(t) => t.len(),
    other => {
      return Err(Error::message(format!(
        "{} is not sliceable",
        other.type_name()
      )))
    }
  };
  let lo = lo.unwrap_or(0);
  let hi = hi.unwrap_or(len as i64);
  if lo < 0 || hi < lo || hi as usize > len {
    return Err(Error::SliceOutOfRange { lo, hi, len });
  }
  let (lo, hi) = (lo as usize, hi as usize);
  Ok(match container {
    V::Str(s) => {
      let out: String = s.as_str().chars().skip(lo).take(hi - lo).collect();
      Value::from(out)
    }
    V::Bytes(b) => V::Bytes(b.as_slice()[lo..hi].into()),
    V::Array(a) => Value::array(a.borrow().items()[lo..hi].to_vec()),
    V::Tuple(t) => Value::tuple(t.as_slice()[lo..hi].to_vec()),
    _ => unreachable!("length was computed for this kind"),
  })
}

/// Convert `value` to the target type. Every kind converts to itself, to
/// bool (via falsiness), and to string (via display); the remaining pairs
/// are the numeric/text lattice.
pub fn convert(value: &Value, to: Type) -> Result<Value> {
  use Value as V;
  if value.type_of() == to {
    return Ok(value.clone());
  }
  let fail = || Error::NotConvertible {
    from: value.type_name(),
    to: to.name().into(),
  };
  match (to, value) {
    (Type::Bool, v) => Ok(V::Bool(!v.is_falsy())),

    // bytes -> string must be the lossless UTF-8 decode, not display
    (Type::Str, V::Bytes(b)) => match std::str::from_utf8(b.as_slice()) {
      Ok(s) => Ok(Value::from(s)),
      Err(_) => Err(fail()),
    },
    (Type::Str, v) => Ok(Value::from(format!("{v}"))),

    (Type::Int, V::Float(f)) => {
      if f.is_finite() {
        Ok(V::Int(*f as i64))
      } else {
        Err(fail())
      }
    }
    (Type::Int, V::Char(c)) => Ok(V::Int(*c as i64)),
    (Type::Int, V::Bool(b)) => Ok(V::Int(*b as i64)),
    (Type::Int, V::Str(s)) => s.as_str().parse::<i64>().map(V::Int).map_err(|_| fail()),

    (Type::Float, V::Int(i)) => Ok(V::Float(*i as f64)),
    (Type::Float, V::Str(s)) => s.as_str().parse::<f64>().map(V::Float).map_err(|_| fail()),

    (Type::Char, V::Int(i)) => u32::try_from(*i)
      .ok()
      .and_then(char::from_u32)
      .map(V::Char)
      .ok_or_else(fail),
    (Type::Char, V::Str(s)) => {
      let mut chars = s.as_str().chars();
      match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(V::Char(c)),
        _ => Err(fail()),
      }
    }

    (Type::Bytes, V::Str(s)) => Ok(V::Bytes(s.as_str().as_bytes().into())),

    (Type::Array, V::Tuple(t)) => Ok(Value::array(t.as_slice().to_vec())),
    (Type::Array, V::Str(_) | V::Bytes(_) | V::Range(_)) => {
      let mut iter = ValueIter::new(value)?;
      let mut items = vec![];
      while let Some((_, v)) = iter.next() {
        items.push(v);
      }
      Ok(Value::array(items))
    }

    (Type::Tuple, V::Array(a)) => Ok(Value::tuple(a.borrow().items().to_vec())),

    (Type::Error, v) => Ok(V::Error(std::rc::Rc::new(ErrorValue::new(Str::from(
      format!("{v}"),
    ))))),

    _ => Err(fail()),
  }
}

/// Stringify `parts` and concatenate them, optionally unindenting the
/// result (multiline string literals).
pub fn build_string(parts: &[Value], unindent: bool) -> Result<Value> {
  let mut out = String::new();
  for part in parts {
    use std::fmt::Write;
    write!(out, "{part}").expect("writing to a String cannot fail");
    if out.len() > MAX_STRING_LEN {
      return Err(Error::message("string size limit exceeded"));
    }
  }
  if unindent {
    out = crate::util::unindent(&out);
  }
  Ok(Value::from(out))
}
