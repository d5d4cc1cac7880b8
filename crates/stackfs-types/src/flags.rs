//! Open-flag vocabulary.
//!
//! Flags follow the `r`/`w`/`a` grid: a base access mode, an optional `+`
//! for read-write, and an optional `x` for exclusive creation. What an
//! `open` does is fully determined by the two action queries: what to do
//! when the path exists, and what to do when it does not.

use serde::{Deserialize, Serialize};

/// Base access mode of an open flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessBase {
    /// `r`: read from the start of the file.
    Read,
    /// `w`: write, discarding existing content.
    Write,
    /// `a`: write at the end of the file.
    Append,
}

/// What `open` does when the path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsAction {
    /// Use the existing content as-is.
    UseExisting,
    /// Discard the existing content.
    Truncate,
    /// Fail with an already-exists error.
    Fail,
}

/// What `open` does when the path does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentAction {
    /// Create the file.
    Create,
    /// Fail with a not-found error.
    Fail,
}

/// A parsed open flag: one of `r`, `r+`, `w`, `wx`, `w+`, `wx+`, `a`,
/// `ax`, `a+`, `ax+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlag {
    base: AccessBase,
    plus: bool,
    exclusive: bool,
}

impl OpenFlag {
    /// Parse a flag string. Returns `None` for anything outside the
    /// supported vocabulary.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, plus, exclusive) = match s {
            "r" => (AccessBase::Read, false, false),
            "r+" => (AccessBase::Read, true, false),
            "w" => (AccessBase::Write, false, false),
            "wx" => (AccessBase::Write, false, true),
            "w+" => (AccessBase::Write, true, false),
            "wx+" => (AccessBase::Write, true, true),
            "a" => (AccessBase::Append, false, false),
            "ax" => (AccessBase::Append, false, true),
            "a+" => (AccessBase::Append, true, false),
            "ax+" => (AccessBase::Append, true, true),
            _ => return None,
        };
        Some(Self {
            base,
            plus,
            exclusive,
        })
    }

    /// The flag's string form.
    pub fn as_str(&self) -> &'static str {
        match (self.base, self.plus, self.exclusive) {
            (AccessBase::Read, false, _) => "r",
            (AccessBase::Read, true, _) => "r+",
            (AccessBase::Write, false, false) => "w",
            (AccessBase::Write, false, true) => "wx",
            (AccessBase::Write, true, false) => "w+",
            (AccessBase::Write, true, true) => "wx+",
            (AccessBase::Append, false, false) => "a",
            (AccessBase::Append, false, true) => "ax",
            (AccessBase::Append, true, false) => "a+",
            (AccessBase::Append, true, true) => "ax+",
        }
    }

    /// Action to take when the opened path exists.
    pub fn on_exists(&self) -> ExistsAction {
        if self.exclusive {
            ExistsAction::Fail
        } else if self.base == AccessBase::Write {
            ExistsAction::Truncate
        } else {
            ExistsAction::UseExisting
        }
    }

    /// Action to take when the opened path does not exist.
    pub fn on_absent(&self) -> AbsentAction {
        if self.base == AccessBase::Read {
            AbsentAction::Fail
        } else {
            AbsentAction::Create
        }
    }

    /// True if the handle permits writes.
    pub fn is_writable(&self) -> bool {
        self.plus || self.base != AccessBase::Read
    }

    /// True if the handle permits reads.
    pub fn is_readable(&self) -> bool {
        self.plus || self.base == AccessBase::Read
    }

    /// True for append-positioned writes.
    pub fn is_appending(&self) -> bool {
        self.base == AccessBase::Append
    }
}

impl std::fmt::Display for OpenFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
