//! Shared handles for mutable values and upvalue cells.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use super::Value;

/// A shared, interior-mutable handle to a container value.
///
/// Cloning a `Ptr` produces another handle to the same container; script
/// assignment is handle assignment. The single-threaded VM guarantees
/// borrows never cross instruction boundaries.
pub struct Ptr<T> {
  inner: Rc<RefCell<T>>,
}

impl<T> Ptr<T> {
  pub fn new(value: T) -> Ptr<T> {
    Ptr {
      inner: Rc::new(RefCell::new(value)),
    }
  }

  pub fn borrow(&self) -> Ref<'_, T> {
    self.inner.borrow()
  }

  pub fn borrow_mut(&self) -> RefMut<'_, T> {
    self.inner.borrow_mut()
  }

  pub fn ptr_eq(&self, other: &Ptr<T>) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  /// Stable address of the allocation, used for cycle detection in display.
  pub fn addr(&self) -> usize {
    Rc::as_ptr(&self.inner) as *const () as usize
  }
}

impl<T> Clone for Ptr<T> {
  fn clone(&self) -> Self {
    Ptr {
      inner: Rc::clone(&self.inner),
    }
  }
}

/// A heap cell holding a captured local.
///
/// When a local is first captured, its stack slot is promoted to a `Cell`;
/// the closure and the frame then share the same cell, so writes through
/// either side are observed by both.
#[derive(Clone)]
pub struct Cell {
  inner: Rc<RefCell<Value>>,
}

impl Cell {
  pub fn new(value: Value) -> Cell {
    Cell {
      inner: Rc::new(RefCell::new(value)),
    }
  }

  pub fn get(&self) -> Value {
    self.inner.borrow().clone()
  }

  pub fn set(&self, value: Value) {
    *self.inner.borrow_mut() = value;
  }

  pub fn ptr_eq(&self, other: &Cell) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }
}
