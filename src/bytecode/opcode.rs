//! The instruction set.
//!
//! Encoding is a 1-byte opcode followed by fixed-width big-endian operands.
//! [`Opcode`] carries the operand width table used by the decoder and the
//! disassembler; [`Instr`] is the symbolic form the builder encodes.

use paste::paste;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
  U8,
  U16,
}

impl Width {
  pub fn size(self) -> usize {
    match self {
      Width::U8 => 1,
      Width::U16 => 2,
    }
  }
}

macro_rules! width_of {
  (u8) => {
    Width::U8
  };
  (u16) => {
    Width::U16
  };
}

macro_rules! instructions {
  (
    $(
      $(#[$meta:meta])*
      $name:ident $(( $($field:ident : $ty:tt),+ ))?
    ),* $(,)?
  ) => {
    paste! {
      #[repr(u8)]
      #[derive(Clone, Copy, Debug, PartialEq, Eq)]
      pub enum Opcode {
        $( $(#[$meta])* $name ),*
      }

      impl Opcode {
        pub fn name(self) -> &'static str {
          match self {
            $( Opcode::$name => stringify!([<$name:snake>]) ),*
          }
        }

        /// Operand widths, in encoding order.
        pub fn operands(self) -> &'static [Width] {
          match self {
            $( Opcode::$name => &[ $( $( width_of!($ty) ),+ )? ] ),*
          }
        }

        pub fn decode(byte: u8) -> Option<Opcode> {
          match byte {
            $( b if b == Opcode::$name as u8 => Some(Opcode::$name), )*
            _ => None,
          }
        }
      }

      /// Symbolic instructions, encoded by the bytecode builder.
      #[derive(Clone, Copy, Debug, PartialEq, Eq)]
      pub enum Instr {
        $( $name $(( $($ty),+ ))? ),*
      }

      impl Instr {
        pub fn opcode(self) -> Opcode {
          match self {
            $( Instr::$name { .. } => Opcode::$name ),*
          }
        }

        pub fn encode(self, buf: &mut Vec<u8>) {
          buf.push(self.opcode() as u8);
          match self {
            $(
              Instr::$name $(( $($field),+ ))? => {
                $( $( buf.extend_from_slice(&$field.to_be_bytes()); )+ )?
              }
            ),*
          }
        }
      }
    }
  };
}

instructions! {
  /// Push constant pool entry `idx`.
  Const(idx: u16),
  /// Push nil.
  Nil,
  /// Push `true`.
  True,
  /// Push `false`.
  False,
  /// Discard the top of the stack.
  Pop,
  /// Pop rhs and lhs, push `lhs op rhs`. `??` short-circuits here
  /// without entering operator dispatch.
  Binary(op: u8),
  /// Pop rhs and lhs, push the comparison result.
  Compare(op: u8),
  /// Pop a value, push `op value`.
  Unary(op: u8),
  /// Unconditional jump to an absolute code offset.
  Jump(target: u16),
  /// Pop a value, jump when it is falsy.
  JumpFalsy(target: u16),
  /// Jump when the top of the stack is falsy, keeping it; pop it
  /// otherwise.
  AndJump(target: u16),
  /// Jump when the top of the stack is truthy, keeping it; pop it
  /// otherwise.
  OrJump(target: u16),
  /// Push the global at `slot`.
  GetGlobal(slot: u16),
  /// Pop into the global at `slot`.
  SetGlobal(slot: u16),
  /// Push the local at `slot`, reading through a promoted cell.
  GetLocal(slot: u8),
  /// Pop into the local at `slot`, writing through a promoted cell.
  SetLocal(slot: u8),
  /// Pop into the local at `slot`, replacing any promoted cell.
  DefineLocal(slot: u8),
  /// Pop `n` stringifiable parts, push their concatenation. `unindent`
  /// strips the common leading whitespace (multiline literals).
  String(n: u16, unindent: u8),
  /// Pop `n` stack values (splat markers expand), push an array.
  Array(n: u16, splat: u8),
  /// Pop `n` stack values forming key/value pairs (mapping splat markers
  /// expand), push a map.
  Map(n: u16, splat: u8),
  /// Pop `n` stack values (splat markers expand), push a tuple.
  Tuple(n: u16, splat: u8),
  /// Pop key and container, push the element. With `with_ok`, also push
  /// whether the element was present.
  Index(with_ok: u8),
  /// Pop value, key and container, assign `container[key] = value`.
  SetIndex,
  /// Pop the present bounds (bit 0: low, bit 1: high) and the container,
  /// push the slice.
  Slice(flags: u8),
  /// Pop a value, push a splat marker over its items. `mapping` splats
  /// key/value pairs instead of sequence items.
  Splat(mapping: u8),
  /// Call the callee under `nargs` arguments.
  Call(nargs: u8, splat: u8),
  /// Run deferred calls, pop the frame, push the result. Zero results
  /// push nil, more than one fold into a tuple.
  Return(results: u8),
  /// Pop `nfree` cells, push a closure over the function constant.
  Closure(idx: u16, nfree: u8),
  /// Push the value held by capture cell `slot`.
  GetFree(slot: u8),
  /// Pop into capture cell `slot`.
  SetFree(slot: u8),
  /// Push capture cell `slot` itself.
  GetFreePtr(slot: u8),
  /// Promote local `slot` to a cell and push the cell.
  GetLocalPtr(slot: u8),
  /// Pop callee and `nargs` arguments, queue them on the current frame.
  /// `site` indexes the function's deferred-call position table.
  Defer(nargs: u8, splat: u8, site: u8),
  /// Call the callee under `nargs` arguments, catching any failure.
  /// Pushes `(result, status)`.
  Try(nargs: u8, splat: u8),
  /// Raise an exception carrying the popped value, or nil.
  Throw(count: u8),
  /// Assert that the top of the stack is an indexable sequence of
  /// exactly `n` elements.
  IdxAssignAssert(n: u8),
  /// Push element `i` of the sequence on top of the stack.
  IdxElem(i: u8),
  /// Pop an iterable, push a suspended iterator over it.
  IterInit,
  /// Step the iterator on top of the stack. Pushes the key (bit 0) and
  /// value (bit 1) as requested, then whether the iterator produced
  /// an element.
  IterNext(flags: u8),
  /// Pop and close the iterator, releasing its mutation lock.
  IterClose,
  /// Push builtin `idx` from the universe table.
  GetBuiltin(idx: u8),
}
