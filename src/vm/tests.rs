use std::sync::Arc;

use super::*;
use crate::builtins;
use crate::bytecode::builder::{FuncBuilder, UnitBuilder};
use crate::bytecode::opcode::Instr;
use crate::span::Span;
use crate::value::ops::{BinOp, CmpOp};

fn run(unit: crate::bytecode::Unit) -> Result<Value> {
  Vm::new(Arc::new(unit), vec![]).run()
}

#[test]
fn literals_and_arithmetic() {
  let mut unit = UnitBuilder::new("test");
  let c2 = unit.int(2);
  let c3 = unit.int(3);
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(c2));
  main.emit(Instr::Const(c3));
  main.emit(Instr::Binary(BinOp::Mul as u8));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);
  assert_snapshot!(unit.disassemble());
  let result = run(unit).unwrap();
  assert_eq!(result.as_int(), Some(6));
}

#[test]
fn coalesce_is_special_cased() {
  let mut unit = UnitBuilder::new("test");
  let c9 = unit.int(9);
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Nil);
  main.emit(Instr::Const(c9));
  main.emit(Instr::Binary(BinOp::Coalesce as u8));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert_eq!(run(unit.finish(main)).unwrap().as_int(), Some(9));
}

#[test]
fn and_or_jumps_short_circuit() {
  // false && <unreachable garbage> -> false
  let mut unit = UnitBuilder::new("test");
  let mut main = FuncBuilder::new("main");
  let end = main.label();
  main.emit(Instr::False);
  main.jump(Opcode::AndJump, end);
  main.emit(Instr::True);
  main.bind(end);
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert_eq!(run(unit.finish(main)).unwrap().as_bool(), Some(false));

  // true || <skipped> -> true
  let mut unit = UnitBuilder::new("test");
  let mut main = FuncBuilder::new("main");
  let end = main.label();
  main.emit(Instr::True);
  main.jump(Opcode::OrJump, end);
  main.emit(Instr::False);
  main.bind(end);
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert_eq!(run(unit.finish(main)).unwrap().as_bool(), Some(true));
}

#[test]
fn string_construction_with_unindent() {
  let mut unit = UnitBuilder::new("test");
  let a = unit.str("x = ");
  let b = unit.int(7);
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(a));
  main.emit(Instr::Const(b));
  main.emit(Instr::String(2, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let out = run(unit.finish(main)).unwrap();
  assert_eq!(out.as_str().unwrap().as_str(), "x = 7");

  let mut unit = UnitBuilder::new("test");
  let text = unit.str("\n  a\n    b\n  c");
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(text));
  main.emit(Instr::String(1, 1));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let out = run(unit.finish(main)).unwrap();
  assert_eq!(out.as_str().unwrap().as_str(), "a\n  b\nc");
}

/// A closure pair shares `sum`/`mul` upvalue cells with the
/// frame that created them.
#[test]
fn closures_share_promoted_upvalues() {
  let mut unit = UnitBuilder::new("main.toy");
  let ga = unit.global("a");
  let gb = unit.global("b");
  let gc = unit.global("c");
  let gd = unit.global("d");
  let gsum = unit.global("sum");
  let gmul = unit.global("mul");
  let c0 = unit.int(0);
  let c1 = unit.int(1);

  // adder(x): sum = sum + x; mul = mul * x
  let mut adder = FuncBuilder::new("adder");
  adder.params(1, 0, false);
  adder.free(2);
  adder.emit(Instr::GetFree(0));
  adder.emit(Instr::GetLocal(0));
  adder.emit(Instr::Binary(BinOp::Add as u8));
  adder.emit(Instr::SetFree(0));
  adder.emit(Instr::GetFree(1));
  adder.emit(Instr::GetLocal(0));
  adder.emit(Instr::Binary(BinOp::Mul as u8));
  adder.emit(Instr::SetFree(1));
  adder.emit(Instr::Return(0));
  let adder = unit.add_function(adder.finish());
  let adder_const = unit.func(adder);

  // each(seq, f): for x in seq { f(x) }
  let mut each = FuncBuilder::new("each");
  each.params(2, 0, false);
  each.locals(3);
  each.emit(Instr::GetLocal(0));
  each.emit(Instr::IterInit);
  let top = each.label();
  let done = each.label();
  each.bind(top);
  each.emit(Instr::IterNext(0b10));
  each.jump(Opcode::JumpFalsy, done);
  each.emit(Instr::DefineLocal(2));
  each.emit(Instr::GetLocal(1));
  each.emit(Instr::GetLocal(2));
  each.emit(Instr::Call(1, 0));
  each.emit(Instr::Pop);
  each.jump(Opcode::Jump, top);
  each.bind(done);
  each.emit(Instr::Pop);
  each.emit(Instr::IterClose);
  each.emit(Instr::Return(0));
  let each = unit.add_function(each.finish());
  let each_const = unit.func(each);

  let mut main = FuncBuilder::new("main");
  main.locals(3);
  main.emit(Instr::Const(c0));
  main.emit(Instr::DefineLocal(0)); // sum
  main.emit(Instr::Const(c1));
  main.emit(Instr::DefineLocal(1)); // mul
  main.emit(Instr::Closure(each_const, 0));
  main.emit(Instr::DefineLocal(2));
  main.emit(Instr::GetLocal(2));
  main.emit(Instr::GetGlobal(ga));
  main.emit(Instr::GetGlobal(gb));
  main.emit(Instr::GetGlobal(gc));
  main.emit(Instr::GetGlobal(gd));
  main.emit(Instr::Array(4, 0));
  main.emit(Instr::GetLocalPtr(0));
  main.emit(Instr::GetLocalPtr(1));
  main.emit(Instr::Closure(adder_const, 2));
  main.emit(Instr::Call(2, 0));
  main.emit(Instr::Pop);
  main.emit(Instr::GetLocal(0));
  main.emit(Instr::SetGlobal(gsum));
  main.emit(Instr::GetLocal(1));
  main.emit(Instr::SetGlobal(gmul));
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let mut globals = vec![Value::Nil; 6];
  for (slot, v) in [(ga, 1), (gb, 9), (gc, 8), (gd, 4)] {
    globals[slot as usize] = Value::Int(v);
  }
  let mut vm = Vm::new(Arc::new(unit), globals);
  vm.run().unwrap();
  assert_eq!(vm.globals()[gsum as usize].as_int(), Some(22));
  assert_eq!(vm.globals()[gmul as usize].as_int(), Some(288));
}

/// Mutating a container inside a for loop over it fails on
/// the first mutation and leaves the container untouched.
#[test]
fn mutation_during_iteration_fails() {
  let mut unit = UnitBuilder::new("main.toy");
  let garr = unit.global("a");
  let c1 = unit.int(1);
  let c2 = unit.int(2);
  let c3 = unit.int(3);
  let c0 = unit.int(0);
  let c4 = unit.int(4);
  let insert = builtins::lookup("insert").unwrap() as u8;

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(c1));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Const(c3));
  main.emit(Instr::Array(3, 0));
  main.emit(Instr::SetGlobal(garr));
  main.emit(Instr::GetGlobal(garr));
  main.emit(Instr::IterInit);
  let top = main.label();
  let done = main.label();
  main.bind(top);
  main.emit(Instr::IterNext(0b10));
  main.jump(Opcode::JumpFalsy, done);
  main.emit(Instr::Pop);
  main.emit(Instr::GetBuiltin(insert));
  main.emit(Instr::GetGlobal(garr));
  main.emit(Instr::Const(c0));
  main.emit(Instr::Const(c4));
  main.emit(Instr::Call(3, 0));
  main.emit(Instr::Pop);
  main.jump(Opcode::Jump, top);
  main.bind(done);
  main.emit(Instr::Pop);
  main.emit(Instr::IterClose);
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let mut vm = Vm::new(Arc::new(unit), vec![]);
  let err = vm.run().unwrap_err();
  assert!(err.to_string().contains("during iteration"), "{err}");

  let arr = vm.globals()[garr as usize].as_array().unwrap().borrow();
  let items: Vec<i64> = arr.items().iter().map(|v| v.as_int().unwrap()).collect();
  assert_eq!(items, vec![1, 2, 3]);
  // the unwound iterator released its lock
  assert_eq!(arr.iter_count(), 0);
}

/// `try` yields `(nil, status)` on a throw and
/// `(value, nil)` on success; the status table is frozen.
#[test]
fn try_catches_thrown_values() {
  let mut unit = UnitBuilder::new("main.toy");
  let r1 = unit.global("r1");
  let r2 = unit.global("r2");
  let bad = unit.str("bad");
  let c42 = unit.int(42);

  let mut thrower = FuncBuilder::new("thrower");
  thrower.emit(Instr::Const(bad));
  thrower.emit(Instr::Throw(1));
  thrower.emit(Instr::Return(0));
  let thrower = unit.add_function(thrower.finish());
  let thrower_const = unit.func(thrower);

  let mut fine = FuncBuilder::new("fine");
  fine.emit(Instr::Const(c42));
  fine.emit(Instr::Return(1));
  let fine = unit.add_function(fine.finish());
  let fine_const = unit.func(fine);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(thrower_const, 0));
  main.emit(Instr::Try(0, 0));
  main.emit(Instr::SetGlobal(r1));
  main.emit(Instr::Closure(fine_const, 0));
  main.emit(Instr::Try(0, 0));
  main.emit(Instr::SetGlobal(r2));
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let mut vm = Vm::new(Arc::new(unit), vec![]);
  vm.run().unwrap();

  let caught = vm.globals()[r1 as usize].as_tuple().unwrap().clone();
  assert!(caught.get(0).unwrap().is_nil());
  let status = caught.get(1).unwrap().as_map().unwrap().borrow();
  assert!(status.is_frozen());
  let msg = status.get(&Value::from("msg")).unwrap().unwrap();
  assert_eq!(msg.as_str().unwrap().as_str(), "bad");
  let val = status.get(&Value::from("val")).unwrap().unwrap();
  assert_eq!(val.as_str().unwrap().as_str(), "bad");

  let ok = vm.globals()[r2 as usize].as_tuple().unwrap().clone();
  assert_eq!(ok.get(0).unwrap().as_int(), Some(42));
  assert!(ok.get(1).unwrap().is_nil());
}

#[test]
fn uncaught_throw_surfaces_as_runtime_error() {
  let mut unit = UnitBuilder::new("main.toy");
  let boom = unit.str("boom");
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(boom));
  main.emit(Instr::Throw(1));
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let err = run(unit.finish(main)).unwrap_err();
  match err.primary() {
    Error::Exception(value) => assert_eq!(value.as_str().unwrap().as_str(), "boom"),
    other => panic!("expected an exception, got {other}"),
  }
}

/// Two defers run LIFO on return; the second raises, its
/// error is carried, and the first still runs. The trace lists the frame
/// positions and the defer sites.
#[test]
fn defers_run_lifo_and_accumulate_errors() {
  let mut unit = UnitBuilder::new("main.toy");
  let glog = unit.global("log");
  let one = unit.int(1);
  let boom = unit.str("boom");
  let append = builtins::lookup("append").unwrap() as u8;

  // d1: log = append(log, 1)
  let mut d1 = FuncBuilder::new("d1");
  d1.emit(Instr::GetBuiltin(append));
  d1.emit(Instr::GetGlobal(glog));
  d1.emit(Instr::Const(one));
  d1.emit(Instr::Call(2, 0));
  d1.emit(Instr::SetGlobal(glog));
  d1.emit(Instr::Return(0));
  let d1 = unit.add_function(d1.finish());
  let d1_const = unit.func(d1);

  // d2: throw "boom"
  let mut d2 = FuncBuilder::new("d2");
  d2.at(Span::from(40..44));
  d2.emit(Instr::Const(boom));
  d2.emit(Instr::Throw(1));
  d2.emit(Instr::Return(0));
  let d2 = unit.add_function(d2.finish());
  let d2_const = unit.func(d2);

  let mut f = FuncBuilder::new("f");
  let site1 = f.defer_site(Span::from(10..15));
  let site2 = f.defer_site(Span::from(20..25));
  f.emit(Instr::Closure(d1_const, 0));
  f.emit(Instr::Defer(0, 0, site1));
  f.emit(Instr::Closure(d2_const, 0));
  f.emit(Instr::Defer(0, 0, site2));
  f.at(Span::from(30..31));
  f.emit(Instr::Return(0));
  let f = unit.add_function(f.finish());
  let f_const = unit.func(f);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Array(0, 0));
  main.emit(Instr::SetGlobal(glog));
  main.emit(Instr::Closure(f_const, 0));
  main.at(Span::from(50..56));
  main.emit(Instr::Call(0, 0));
  main.emit(Instr::Pop);
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let mut vm = Vm::new(Arc::new(unit), vec![]);
  let err = vm.run().unwrap_err();

  // d1 ran even though d2 failed first
  let log = vm.globals()[glog as usize].as_array().unwrap().borrow();
  assert_eq!(log.len(), 1);
  assert_eq!(log.get(0).unwrap().as_int(), Some(1));

  let Error::Runtime(rt) = err else {
    panic!("expected a runtime error")
  };
  match rt.primary() {
    Error::Exception(value) => assert_eq!(value.as_str().unwrap().as_str(), "boom"),
    other => panic!("expected d2's exception, got {other}"),
  }
  let names: Vec<&str> = rt.trace.iter().map(|t| &*t.name).collect();
  assert_eq!(names, ["d2", "f", "f", "main"]);
  // the second trace entry is the defer site of d2
  assert!(rt.trace[1].defer);
  assert_eq!(rt.trace[1].span, Span::from(20..25));
  assert!(!rt.trace[2].defer);
  assert_eq!(rt.trace[3].span, Span::from(50..56));
}

/// A self-recursive call in tail position reuses the frame
/// and survives `MAX_FRAMES + 1000` iterations.
#[test]
fn tail_recursion_reuses_the_frame() {
  let mut unit = UnitBuilder::new("main.toy");
  let gcount = unit.global("count");
  let c0 = unit.int(0);
  let c1 = unit.int(1);
  let depth = unit.int((MAX_FRAMES + 1000) as i64);

  let mut count = FuncBuilder::new("count");
  count.params(1, 0, false);
  let rec = count.label();
  count.emit(Instr::GetLocal(0));
  count.emit(Instr::Const(c0));
  count.emit(Instr::Compare(CmpOp::Eq as u8));
  count.jump(Opcode::JumpFalsy, rec);
  count.emit(Instr::Const(c0));
  count.emit(Instr::Return(1));
  count.bind(rec);
  count.emit(Instr::GetGlobal(gcount));
  count.emit(Instr::GetLocal(0));
  count.emit(Instr::Const(c1));
  count.emit(Instr::Binary(BinOp::Sub as u8));
  count.emit(Instr::Call(1, 0));
  count.emit(Instr::Return(1));
  let count = unit.add_function(count.finish());
  let count_const = unit.func(count);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(count_const, 0));
  main.emit(Instr::SetGlobal(gcount));
  main.emit(Instr::GetGlobal(gcount));
  main.emit(Instr::Const(depth));
  main.emit(Instr::Call(1, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let result = run(unit.finish(main)).unwrap();
  assert_eq!(result.as_int(), Some(0));
}

#[test]
fn deep_recursion_without_tail_position_overflows() {
  let mut unit = UnitBuilder::new("main.toy");
  let gcount = unit.global("count");
  let c0 = unit.int(0);
  let c1 = unit.int(1);
  let depth = unit.int((MAX_FRAMES + 10) as i64);

  // count(n): if n == 0 { return 0 } return count(n - 1) + 0
  let mut count = FuncBuilder::new("count");
  count.params(1, 0, false);
  let rec = count.label();
  count.emit(Instr::GetLocal(0));
  count.emit(Instr::Const(c0));
  count.emit(Instr::Compare(CmpOp::Eq as u8));
  count.jump(Opcode::JumpFalsy, rec);
  count.emit(Instr::Const(c0));
  count.emit(Instr::Return(1));
  count.bind(rec);
  count.emit(Instr::GetGlobal(gcount));
  count.emit(Instr::GetLocal(0));
  count.emit(Instr::Const(c1));
  count.emit(Instr::Binary(BinOp::Sub as u8));
  count.emit(Instr::Call(1, 0));
  count.emit(Instr::Const(c0));
  count.emit(Instr::Binary(BinOp::Add as u8));
  count.emit(Instr::Return(1));
  let count = unit.add_function(count.finish());
  let count_const = unit.func(count);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(count_const, 0));
  main.emit(Instr::SetGlobal(gcount));
  main.emit(Instr::GetGlobal(gcount));
  main.emit(Instr::Const(depth));
  main.emit(Instr::Call(1, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let err = run(unit.finish(main)).unwrap_err();
  assert!(err.to_string().contains("stack overflow"), "{err}");
}

/// Map updates preserve insertion order, and equality is
/// order-independent.
#[test]
fn map_insertion_order_and_equality() {
  let mut unit = UnitBuilder::new("main.toy");
  let gm = unit.global("m");
  let geq = unit.global("eq");
  let ka = unit.str("a");
  let kb = unit.str("b");
  let c1 = unit.int(1);
  let c2 = unit.int(2);
  let c3 = unit.int(3);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Map(0, 0));
  main.emit(Instr::SetGlobal(gm));
  for (k, v) in [(ka, c1), (kb, c2), (ka, c3)] {
    main.emit(Instr::GetGlobal(gm));
    main.emit(Instr::Const(k));
    main.emit(Instr::Const(v));
    main.emit(Instr::SetIndex);
  }
  // m == {"b": 2, "a": 3}, built in the other order
  main.emit(Instr::GetGlobal(gm));
  main.emit(Instr::Const(kb));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Const(ka));
  main.emit(Instr::Const(c3));
  main.emit(Instr::Map(4, 0));
  main.emit(Instr::Compare(CmpOp::Eq as u8));
  main.emit(Instr::SetGlobal(geq));
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let mut vm = Vm::new(Arc::new(unit), vec![]);
  vm.run().unwrap();

  assert_eq!(vm.globals()[geq as usize].as_bool(), Some(true));
  let m = vm.globals()[gm as usize].as_map().unwrap().borrow();
  let pairs: Vec<(String, i64)> = m
    .iter()
    .map(|(k, v)| (format!("{k}"), v.as_int().unwrap()))
    .collect();
  assert_eq!(pairs, vec![("a".into(), 3), ("b".into(), 2)]);
}

#[test]
fn splats_expand_in_calls_and_literals() {
  let mut unit = UnitBuilder::new("main.toy");
  let gout = unit.global("out");
  let c1 = unit.int(1);
  let c2 = unit.int(2);
  let c3 = unit.int(3);
  let c9 = unit.int(9);

  // sum3(a, b, c): return a + b + c
  let mut sum3 = FuncBuilder::new("sum3");
  sum3.params(3, 0, false);
  sum3.emit(Instr::GetLocal(0));
  sum3.emit(Instr::GetLocal(1));
  sum3.emit(Instr::Binary(BinOp::Add as u8));
  sum3.emit(Instr::GetLocal(2));
  sum3.emit(Instr::Binary(BinOp::Add as u8));
  sum3.emit(Instr::Return(1));
  let sum3 = unit.add_function(sum3.finish());
  let sum3_const = unit.func(sum3);

  let mut main = FuncBuilder::new("main");
  main.locals(1);
  // xs = [1, 2, 3]
  main.emit(Instr::Const(c1));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Const(c3));
  main.emit(Instr::Array(3, 0));
  main.emit(Instr::DefineLocal(0));
  // out = sum3(...xs)
  main.emit(Instr::Closure(sum3_const, 0));
  main.emit(Instr::GetLocal(0));
  main.emit(Instr::Splat(0));
  main.emit(Instr::Call(1, 1));
  main.emit(Instr::SetGlobal(gout));
  // return [9, ...xs]
  main.emit(Instr::Const(c9));
  main.emit(Instr::GetLocal(0));
  main.emit(Instr::Splat(0));
  main.emit(Instr::Array(2, 1));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let mut vm = Vm::new(Arc::new(unit), vec![]);
  let result = vm.run().unwrap();
  assert_eq!(vm.globals()[gout as usize].as_int(), Some(6));
  let items: Vec<i64> = result
    .as_array()
    .unwrap()
    .borrow()
    .items()
    .iter()
    .map(|v| v.as_int().unwrap())
    .collect();
  assert_eq!(items, vec![9, 1, 2, 3]);
}

#[test]
fn optional_parameters_pad_with_nil() {
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);

  // f(a, b?): return b
  let mut f = FuncBuilder::new("f");
  f.params(2, 1, false);
  f.emit(Instr::GetLocal(1));
  f.emit(Instr::Return(1));
  let f = unit.add_function(f.finish());
  let f_const = unit.func(f);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(f_const, 0));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Call(1, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert!(run(unit.finish(main)).unwrap().is_nil());
}

#[test]
fn variadic_parameters_fold_into_an_array() {
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);
  let c2 = unit.int(2);
  let c3 = unit.int(3);
  let len = builtins::lookup("len").unwrap() as u8;

  // f(a, ...rest): return len(rest)
  let mut f = FuncBuilder::new("f");
  f.params(2, 0, true);
  f.emit(Instr::GetBuiltin(len));
  f.emit(Instr::GetLocal(1));
  f.emit(Instr::Call(1, 0));
  f.emit(Instr::Return(1));
  let f = unit.add_function(f.finish());
  let f_const = unit.func(f);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(f_const, 0));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Const(c3));
  main.emit(Instr::Call(3, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert_eq!(run(unit.finish(main)).unwrap().as_int(), Some(2));
}

#[test]
fn arity_mismatch_reports_bounds() {
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);

  let mut f = FuncBuilder::new("f");
  f.params(2, 0, false);
  f.emit(Instr::Return(0));
  let f = unit.add_function(f.finish());
  let f_const = unit.func(f);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(f_const, 0));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Call(1, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let err = run(unit.finish(main)).unwrap_err();
  assert!(
    err
      .to_string()
      .contains("wrong number of arguments: want 2, got 1"),
    "{err}"
  );
}

#[test]
fn destructuring_asserts_shape() {
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);
  let c2 = unit.int(2);

  let mut main = FuncBuilder::new("main");
  main.locals(2);
  main.emit(Instr::Const(c1));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Tuple(2, 0));
  main.emit(Instr::IdxAssignAssert(2));
  main.emit(Instr::IdxElem(0));
  main.emit(Instr::DefineLocal(0));
  main.emit(Instr::IdxElem(1));
  main.emit(Instr::DefineLocal(1));
  main.emit(Instr::Pop);
  main.emit(Instr::GetLocal(1));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert_eq!(run(unit.finish(main)).unwrap().as_int(), Some(2));

  // shape mismatch
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(c1));
  main.emit(Instr::Tuple(1, 0));
  main.emit(Instr::IdxAssignAssert(2));
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let err = run(unit.finish(main)).unwrap_err();
  assert!(err.to_string().contains("cannot unpack 1 values into 2"), "{err}");
}

#[test]
fn index_with_ok_flag_pushes_presence() {
  let mut unit = UnitBuilder::new("main.toy");
  let ka = unit.str("a");
  let kb = unit.str("b");
  let c1 = unit.int(1);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(ka));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Map(2, 0));
  main.emit(Instr::Const(kb));
  main.emit(Instr::Index(1));
  main.emit(Instr::Tuple(2, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let result = run(unit.finish(main)).unwrap();
  let tuple = result.as_tuple().unwrap();
  assert!(tuple.get(0).unwrap().is_nil());
  assert_eq!(tuple.get(1).unwrap().as_bool(), Some(false));
}

#[test]
fn slices_respect_bound_flags() {
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);
  let c2 = unit.int(2);
  let c3 = unit.int(3);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(c1));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Const(c3));
  main.emit(Instr::Array(3, 0));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Slice(0b01)); // [1:]
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  let result = run(unit.finish(main)).unwrap();
  let items: Vec<i64> = result
    .as_array()
    .unwrap()
    .borrow()
    .items()
    .iter()
    .map(|v| v.as_int().unwrap())
    .collect();
  assert_eq!(items, vec![2, 3]);
}

#[test]
fn builtin_type_descriptors_construct() {
  let mut unit = UnitBuilder::new("main.toy");
  let s42 = unit.str("42");
  let int_ty = builtins::lookup("int").unwrap() as u8;

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::GetBuiltin(int_ty));
  main.emit(Instr::Const(s42));
  main.emit(Instr::Call(1, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());
  assert_eq!(run(unit.finish(main)).unwrap().as_int(), Some(42));
}

#[test]
fn fail_sets_the_pending_error() {
  let mut unit = UnitBuilder::new("main.toy");
  let fmt = unit.str("boom %d");
  let c42 = unit.int(42);
  let fail = builtins::lookup("fail").unwrap() as u8;

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::GetBuiltin(fail));
  main.emit(Instr::Const(fmt));
  main.emit(Instr::Const(c42));
  main.emit(Instr::Call(2, 0));
  main.emit(Instr::Pop);
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let err = run(unit.finish(main)).unwrap_err();
  assert!(err.to_string().contains("boom 42"), "{err}");
}

#[test]
fn abort_unwinds_at_the_next_dispatch() {
  let mut unit = UnitBuilder::new("main.toy");
  let mut main = FuncBuilder::new("main");
  let top = main.label();
  main.bind(top);
  main.emit(Instr::Nil);
  main.emit(Instr::Pop);
  main.jump(Opcode::Jump, top);
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let handle = AbortHandle::new();
  handle.abort();
  let mut vm = Vm::new(Arc::new(unit), vec![]).with_abort(&handle);
  let err = vm.run().unwrap_err();
  assert!(matches!(err.primary(), Error::Aborted));
}

#[test]
fn abort_still_runs_deferred_calls() {
  let mut unit = UnitBuilder::new("main.toy");
  let glog = unit.global("log");
  let gcancel = unit.global("cancel");
  let one = unit.int(1);
  let append = builtins::lookup("append").unwrap() as u8;

  let mut d = FuncBuilder::new("d");
  d.emit(Instr::GetBuiltin(append));
  d.emit(Instr::GetGlobal(glog));
  d.emit(Instr::Const(one));
  d.emit(Instr::Call(2, 0));
  d.emit(Instr::SetGlobal(glog));
  d.emit(Instr::Return(0));
  let d = unit.add_function(d.finish());
  let d_const = unit.func(d);

  // main: register the defer, ask the host to cancel, then spin
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Array(0, 0));
  main.emit(Instr::SetGlobal(glog));
  main.emit(Instr::Closure(d_const, 0));
  main.emit(Instr::Defer(0, 0, 0));
  main.emit(Instr::GetGlobal(gcancel));
  main.emit(Instr::Call(0, 0));
  main.emit(Instr::Pop);
  let top = main.label();
  main.bind(top);
  main.emit(Instr::Nil);
  main.emit(Instr::Pop);
  main.jump(Opcode::Jump, top);
  let main = unit.add_function(main.finish());
  let unit = unit.finish(main);

  let handle = AbortHandle::new();
  let trigger = handle.clone();
  let cancel = Value::Native(std::rc::Rc::new(crate::value::NativeFunction::new(
    "cancel",
    move |_, _| {
      trigger.abort();
      Ok(Value::Nil)
    },
  )));

  let mut globals = vec![Value::Nil; 2];
  globals[gcancel as usize] = cancel;
  let mut vm = Vm::new(Arc::new(unit), globals).with_abort(&handle);
  let err = vm.run().unwrap_err();
  assert!(matches!(err.primary(), Error::Aborted));
  let log = vm.globals()[glog as usize].as_array().unwrap().borrow();
  assert_eq!(log.len(), 1);
}

#[test]
fn native_panics_become_errors() {
  let mut unit = UnitBuilder::new("main.toy");
  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());
  let mut vm = Vm::new(Arc::new(unit.finish(main)), vec![]);

  let panicky = Value::Native(std::rc::Rc::new(crate::value::NativeFunction::new(
    "panicky",
    |_, _| panic!("native gave up"),
  )));
  let err = vm.call(panicky, &[]).unwrap_err();
  assert!(err.to_string().contains("native gave up"), "{err}");
}

#[test]
fn reentrant_call_runs_compiled_code() {
  let mut unit = UnitBuilder::new("main.toy");
  let c2 = unit.int(2);

  let mut double = FuncBuilder::new("double");
  double.params(1, 0, false);
  double.emit(Instr::GetLocal(0));
  double.emit(Instr::Const(c2));
  double.emit(Instr::Binary(BinOp::Mul as u8));
  double.emit(Instr::Return(1));
  let double = unit.add_function(double.finish());
  let double_const = unit.func(double);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(double_const, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let mut vm = Vm::new(Arc::new(unit.finish(main)), vec![]);
  let double = vm.run().unwrap();
  let result = vm.call(double, &[Value::Int(21)]).unwrap();
  assert_eq!(result.as_int(), Some(42));
}

/// Cells outlive the frame that promoted them: both closures produced by
/// the maker keep writing through the same cell after the maker returned.
#[test]
fn sibling_closures_observe_shared_cell_writes() {
  let mut unit = UnitBuilder::new("main.toy");
  let c0 = unit.int(0);
  let c1 = unit.int(1);

  // inc(): n = n + 1
  let mut inc = FuncBuilder::new("inc");
  inc.free(1);
  inc.emit(Instr::GetFree(0));
  inc.emit(Instr::Const(c1));
  inc.emit(Instr::Binary(BinOp::Add as u8));
  inc.emit(Instr::SetFree(0));
  inc.emit(Instr::Return(0));
  let inc = unit.add_function(inc.finish());
  let inc_const = unit.func(inc);

  // get(): return n
  let mut get = FuncBuilder::new("get");
  get.free(1);
  get.emit(Instr::GetFree(0));
  get.emit(Instr::Return(1));
  let get = unit.add_function(get.finish());
  let get_const = unit.func(get);

  // maker(): n = 0; return (inc, get)
  let mut maker = FuncBuilder::new("maker");
  maker.locals(1);
  maker.emit(Instr::Const(c0));
  maker.emit(Instr::DefineLocal(0));
  maker.emit(Instr::GetLocalPtr(0));
  maker.emit(Instr::Closure(inc_const, 1));
  maker.emit(Instr::GetLocalPtr(0));
  maker.emit(Instr::Closure(get_const, 1));
  maker.emit(Instr::Tuple(2, 0));
  maker.emit(Instr::Return(1));
  let maker = unit.add_function(maker.finish());
  let maker_const = unit.func(maker);

  let mut main = FuncBuilder::new("main");
  main.locals(2);
  main.emit(Instr::Closure(maker_const, 0));
  main.emit(Instr::Call(0, 0));
  main.emit(Instr::IdxAssignAssert(2));
  main.emit(Instr::IdxElem(0));
  main.emit(Instr::DefineLocal(0));
  main.emit(Instr::IdxElem(1));
  main.emit(Instr::DefineLocal(1));
  main.emit(Instr::Pop);
  for _ in 0..2 {
    main.emit(Instr::GetLocal(0));
    main.emit(Instr::Call(0, 0));
    main.emit(Instr::Pop);
  }
  main.emit(Instr::GetLocal(1));
  main.emit(Instr::Call(0, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  assert_eq!(run(unit.finish(main)).unwrap().as_int(), Some(2));
}

/// `define` introduces a fresh binding even when the old slot was promoted;
/// `set` keeps writing through the captured cell.
#[test]
fn define_replaces_a_promoted_cell() {
  let mut unit = UnitBuilder::new("main.toy");
  let c1 = unit.int(1);
  let c2 = unit.int(2);
  let c9 = unit.int(9);

  let mut get = FuncBuilder::new("get");
  get.free(1);
  get.emit(Instr::GetFree(0));
  get.emit(Instr::Return(1));
  let get = unit.add_function(get.finish());
  let get_const = unit.func(get);

  let mut main = FuncBuilder::new("main");
  main.locals(3);
  main.emit(Instr::Const(c1));
  main.emit(Instr::DefineLocal(0));
  main.emit(Instr::GetLocalPtr(0));
  main.emit(Instr::Closure(get_const, 1));
  main.emit(Instr::DefineLocal(1)); // captures the first binding
  main.emit(Instr::Const(c2));
  main.emit(Instr::DefineLocal(0)); // fresh binding, severs the old cell
  main.emit(Instr::GetLocalPtr(0));
  main.emit(Instr::Closure(get_const, 1));
  main.emit(Instr::DefineLocal(2)); // captures the second binding
  main.emit(Instr::Const(c9));
  main.emit(Instr::SetLocal(0)); // writes through the second cell
  main.emit(Instr::GetLocal(1));
  main.emit(Instr::Call(0, 0));
  main.emit(Instr::GetLocal(2));
  main.emit(Instr::Call(0, 0));
  main.emit(Instr::Tuple(2, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let result = run(unit.finish(main)).unwrap();
  let tuple = result.as_tuple().unwrap();
  assert_eq!(tuple.get(0).unwrap().as_int(), Some(1));
  assert_eq!(tuple.get(1).unwrap().as_int(), Some(9));
}

#[test]
fn mapping_splat_expands_into_map_literals() {
  let mut unit = UnitBuilder::new("main.toy");
  let ka = unit.str("a");
  let kb = unit.str("b");
  let c1 = unit.int(1);
  let c2 = unit.int(2);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(ka));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Map(2, 0));
  main.emit(Instr::Splat(1));
  main.emit(Instr::Const(kb));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Map(3, 1));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let result = run(unit.finish(main)).unwrap();
  let map = result.as_map().unwrap().borrow();
  assert_eq!(map.len(), 2);
  let keys: Vec<String> = map.keys().map(|k| format!("{k}")).collect();
  assert_eq!(keys, ["a", "b"]);
}

#[test]
fn iteration_can_request_keys_and_values() {
  let mut unit = UnitBuilder::new("main.toy");
  let empty = unit.str("");
  let ka = unit.str("a");
  let kb = unit.str("b");
  let c0 = unit.int(0);
  let c1 = unit.int(1);
  let c2 = unit.int(2);

  // keys = ""; sum = 0; for k, v in {"a": 1, "b": 2} { keys = k + keys; sum = v + sum }
  let mut main = FuncBuilder::new("main");
  main.locals(2);
  main.emit(Instr::Const(empty));
  main.emit(Instr::DefineLocal(0));
  main.emit(Instr::Const(c0));
  main.emit(Instr::DefineLocal(1));
  main.emit(Instr::Const(ka));
  main.emit(Instr::Const(c1));
  main.emit(Instr::Const(kb));
  main.emit(Instr::Const(c2));
  main.emit(Instr::Map(4, 0));
  main.emit(Instr::IterInit);
  let top = main.label();
  let done = main.label();
  main.bind(top);
  main.emit(Instr::IterNext(0b11));
  main.jump(Opcode::JumpFalsy, done);
  main.emit(Instr::GetLocal(1));
  main.emit(Instr::Binary(BinOp::Add as u8));
  main.emit(Instr::SetLocal(1));
  main.emit(Instr::GetLocal(0));
  main.emit(Instr::Binary(BinOp::Add as u8));
  main.emit(Instr::SetLocal(0));
  main.jump(Opcode::Jump, top);
  main.bind(done);
  main.emit(Instr::Pop);
  main.emit(Instr::Pop);
  main.emit(Instr::IterClose);
  main.emit(Instr::GetLocal(0));
  main.emit(Instr::GetLocal(1));
  main.emit(Instr::Tuple(2, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let result = run(unit.finish(main)).unwrap();
  let tuple = result.as_tuple().unwrap();
  assert_eq!(tuple.get(0).unwrap().as_str().unwrap().as_str(), "ba");
  assert_eq!(tuple.get(1).unwrap().as_int(), Some(3));
}

#[test]
fn throw_without_a_value_raises_nil() {
  let mut unit = UnitBuilder::new("main.toy");

  let mut thrower = FuncBuilder::new("thrower");
  thrower.emit(Instr::Throw(0));
  thrower.emit(Instr::Return(0));
  let thrower = unit.add_function(thrower.finish());
  let thrower_const = unit.func(thrower);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(thrower_const, 0));
  main.emit(Instr::Try(0, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let result = run(unit.finish(main)).unwrap();
  let tuple = result.as_tuple().unwrap();
  let status = tuple.get(1).unwrap().as_map().unwrap().borrow();
  assert!(status.get(&Value::from("val")).unwrap().unwrap().is_nil());
  let msg = status.get(&Value::from("msg")).unwrap().unwrap();
  assert_eq!(msg.as_str().unwrap().as_str(), "nil");
}

#[test]
fn try_forwards_arguments_to_the_thunk() {
  let mut unit = UnitBuilder::new("main.toy");
  let ce = unit.str("E");

  // rethrow(x): throw x
  let mut rethrow = FuncBuilder::new("rethrow");
  rethrow.params(1, 0, false);
  rethrow.emit(Instr::GetLocal(0));
  rethrow.emit(Instr::Throw(1));
  rethrow.emit(Instr::Return(0));
  let rethrow = unit.add_function(rethrow.finish());
  let rethrow_const = unit.func(rethrow);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Closure(rethrow_const, 0));
  main.emit(Instr::Const(ce));
  main.emit(Instr::Try(1, 0));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  let result = run(unit.finish(main)).unwrap();
  let tuple = result.as_tuple().unwrap();
  let status = tuple.get(1).unwrap().as_map().unwrap().borrow();
  let val = status.get(&Value::from("val")).unwrap().unwrap();
  assert_eq!(val.as_str().unwrap().as_str(), "E");
}

#[test]
fn trace_rendering_resolves_line_positions() {
  let source = "let x\nfail here\nrest";
  let mut unit = UnitBuilder::new("main.toy");
  unit.source(source);
  let fmt = unit.str("kaboom");
  let fail = builtins::lookup("fail").unwrap() as u8;

  let mut main = FuncBuilder::new("main");
  main.at(Span::from(6..15)); // the second line
  main.emit(Instr::GetBuiltin(fail));
  main.emit(Instr::Const(fmt));
  main.emit(Instr::Call(1, 0));
  main.emit(Instr::Pop);
  main.emit(Instr::Return(0));
  let main = unit.add_function(main.finish());

  let err = run(unit.finish(main)).unwrap_err();
  let rendered = err.to_string();
  assert!(rendered.contains("kaboom"), "{rendered}");
  assert!(rendered.contains("in main at 2:1"), "{rendered}");
}

#[test]
fn unary_operators_dispatch() {
  use crate::value::ops::UnOp;

  let mut unit = UnitBuilder::new("main.toy");
  let c5 = unit.int(5);

  let mut main = FuncBuilder::new("main");
  main.emit(Instr::Const(c5));
  main.emit(Instr::Unary(UnOp::Neg as u8));
  main.emit(Instr::Unary(UnOp::BNot as u8));
  main.emit(Instr::Unary(UnOp::Not as u8));
  main.emit(Instr::Return(1));
  let main = unit.add_function(main.finish());

  // !(^(-5)) == !(4) == false
  assert_eq!(run(unit.finish(main)).unwrap().as_bool(), Some(false));
}
