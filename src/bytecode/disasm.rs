//! Human-readable unit listings.

use std::fmt::Write;

use super::opcode::Opcode;
use super::Unit;
use crate::util::{num_digits, JoinIter};

/// Disassemble every function in the unit.
pub fn disassemble(unit: &Unit) -> String {
  let mut out = String::new();
  let f = &mut out;

  writeln!(f, "unit {}:", unit.name).unwrap();
  writeln!(f, "  globals: {}", unit.num_globals).unwrap();
  if unit.constants.is_empty() {
    writeln!(f, "  const: <empty>").unwrap();
  } else {
    writeln!(f, "  const (length={}):", unit.constants.len()).unwrap();
    for (i, constant) in unit.constants.iter().enumerate() {
      writeln!(f, "    {i}: {constant}").unwrap();
    }
  }

  for (i, proto) in unit.functions.iter().enumerate() {
    let main = if i == unit.main { " (main)" } else { "" };
    writeln!(f, "\nfunction {}{main}:", proto.name).unwrap();
    writeln!(
      f,
      "  params: {} (optional: {}, variadic: {})",
      proto.params.num_params, proto.params.num_optional, proto.params.variadic
    )
    .unwrap();
    writeln!(f, "  locals: {}", proto.num_locals).unwrap();
    writeln!(f, "  free: {}", proto.num_free).unwrap();
    writeln!(f, "  code:").unwrap();

    let offset_align = num_digits(proto.code.len());
    let mut pc = 0;
    while pc < proto.code.len() {
      let Some(opcode) = Opcode::decode(proto.code[pc]) else {
        writeln!(f, "    {pc:offset_align$} | ?? 0x{:02x}", proto.code[pc]).unwrap();
        pc += 1;
        continue;
      };
      let mut at = pc + 1;
      let mut operands = vec![];
      for width in opcode.operands() {
        operands.push(read_operand(&proto.code, at, width.size()));
        at += width.size();
      }
      write!(f, "    {pc:offset_align$} | {}", opcode.name()).unwrap();
      if operands.is_empty() {
        writeln!(f).unwrap();
      } else {
        writeln!(f, " {}", operands.iter().join(" ")).unwrap();
      }
      pc = at;
    }
  }

  out
}

fn read_operand(code: &[u8], at: usize, size: usize) -> u64 {
  let mut value = 0u64;
  for byte in &code[at..at + size] {
    value = (value << 8) | *byte as u64;
  }
  value
}
