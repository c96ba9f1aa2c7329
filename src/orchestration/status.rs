//! Per-subtask outcome vector of a composite task.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Integer outcome of one subtask. Zero is success; every other value is
/// an opaque failure code owned by the caller.
pub type SubtaskCode = i32;

/// The neutral code.
pub const SUBTASK_OK: SubtaskCode = 0;

/// Reported by the worker pool when a subtask body panics instead of
/// returning a code.
pub const SUBTASK_PANICKED: SubtaskCode = -1;

/// Ordered outcome codes, one per subtask, index-stable for the lifetime
/// of the composite task. The length is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    codes: Box<[SubtaskCode]>,
}

impl Status {
    /// A status for `len` subtasks, every slot neutral.
    pub fn new(len: usize) -> Self {
        Self {
            codes: vec![SUBTASK_OK; len].into_boxed_slice(),
        }
    }

    pub fn from_codes(codes: impl Into<Vec<SubtaskCode>>) -> Self {
        Self {
            codes: codes.into().into_boxed_slice(),
        }
    }

    pub(crate) fn record(&mut self, index: usize, code: SubtaskCode) {
        self.codes[index] = code;
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn code(&self, index: usize) -> Option<SubtaskCode> {
        self.codes.get(index).copied()
    }

    pub fn codes(&self) -> &[SubtaskCode] {
        &self.codes
    }

    /// True iff every code is neutral.
    pub fn successful(&self) -> bool {
        self.codes.iter().all(|&c| c == SUBTASK_OK)
    }

    /// `(index, code)` of every failed subtask, in index order.
    pub fn failures(&self) -> impl Iterator<Item = (usize, SubtaskCode)> + '_ {
        self.codes
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != SUBTASK_OK)
            .map(|(i, &c)| (i, c))
    }

    /// `Err(SubtaskFailure)` for the lowest failing index.
    pub fn to_result(&self) -> Result<()> {
        match self.failures().next() {
            Some((index, code)) => Err(Error::SubtaskFailure { index, code }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, code) in self.codes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", code)?;
        }
        write!(f, "]")
    }
}
