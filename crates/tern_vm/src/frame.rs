use std::rc::Rc;

use crate::code::Instructions;
use crate::value::Closure;

/// One activation record on the call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    /// Stack index of the first argument; locals live at
    /// `base_pointer..base_pointer + num_locals`.
    pub base_pointer: usize,
}

impl Frame {
    pub fn new(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Self {
            closure,
            ip: 0,
            base_pointer,
        }
    }

    pub fn instructions(&self) -> &Instructions {
        &self.closure.function.instructions
    }
}
