//! Iterators over iterable values.
//!
//! An iterator holds its source open: for mutable containers the source's
//! iteration counter is incremented on creation and decremented when the
//! iterator is dropped, which is what lets every mutator detect iteration
//! and refuse to run.

use crate::error::{Error, Result};
use crate::value::{Array, Bytes, Map, Ptr, Range, Str, Tuple, Value};

pub struct ValueIter {
  kind: IterKind,
}

enum IterKind {
  Array { arr: Ptr<Array>, pos: usize },
  Map { map: Ptr<Map>, pos: usize },
  Str { s: Str, byte: usize, pos: usize },
  Bytes { b: Bytes, pos: usize },
  Tuple { t: Tuple, pos: usize },
  Range { r: Range, pos: usize },
}

impl ValueIter {
  /// Open an iterator over `value`, locking mutable sources against
  /// mutation.
  pub fn new(value: &Value) -> Result<ValueIter> {
    let kind = match value {
      Value::Array(arr) => {
        arr.borrow_mut().lock_iter();
        IterKind::Array {
          arr: arr.clone(),
          pos: 0,
        }
      }
      Value::Map(map) => {
        map.borrow_mut().lock_iter();
        IterKind::Map {
          map: map.clone(),
          pos: 0,
        }
      }
      Value::Str(s) => IterKind::Str {
        s: s.clone(),
        byte: 0,
        pos: 0,
      },
      Value::Bytes(b) => IterKind::Bytes { b: b.clone(), pos: 0 },
      Value::Tuple(t) => IterKind::Tuple { t: t.clone(), pos: 0 },
      Value::Range(r) => IterKind::Range { r: *r, pos: 0 },
      other => {
        return Err(Error::NotIterable {
          got: other.type_name(),
        })
      }
    };
    Ok(ValueIter { kind })
  }

  /// Produce the next `(key, value)` pair, or `None` when exhausted.
  ///
  /// Sequences yield their position as the key; maps yield their entry key.
  pub fn next(&mut self) -> Option<(Value, Value)> {
    match &mut self.kind {
      IterKind::Array { arr, pos } => {
        let item = arr.borrow().get(*pos)?;
        let key = Value::Int(*pos as i64);
        *pos += 1;
        Some((key, item))
      }
      IterKind::Map { map, pos } => {
        let map = map.borrow();
        while *pos < map.entries_len() {
          let entry = map.entry_at(*pos);
          *pos += 1;
          if let Some((key, value)) = entry {
            return Some((key, value));
          }
        }
        None
      }
      IterKind::Str { s, byte, pos } => {
        let c = s.as_str()[*byte..].chars().next()?;
        let key = Value::Int(*pos as i64);
        *byte += c.len_utf8();
        *pos += 1;
        Some((key, Value::Char(c)))
      }
      IterKind::Bytes { b, pos } => {
        let byte = *b.as_slice().get(*pos)?;
        let key = Value::Int(*pos as i64);
        *pos += 1;
        Some((key, Value::Int(byte as i64)))
      }
      IterKind::Tuple { t, pos } => {
        let item = t.get(*pos)?.clone();
        let key = Value::Int(*pos as i64);
        *pos += 1;
        Some((key, item))
      }
      IterKind::Range { r, pos } => {
        let item = r.at(*pos)?;
        let key = Value::Int(*pos as i64);
        *pos += 1;
        Some((key, Value::Int(item)))
      }
    }
  }
}

impl Drop for ValueIter {
  fn drop(&mut self) {
    match &self.kind {
      IterKind::Array { arr, .. } => arr.borrow_mut().unlock_iter(),
      IterKind::Map { map, .. } => map.borrow_mut().unlock_iter(),
      _ => {}
    }
  }
}
