//! Command dispatch by argument kind.
//!
//! A [`CommandRegistry`] maps `(command, argument kinds)` to a handler.
//! Kinds form a tree ([`Kind::parent`]); a signature accepts an argument when
//! the argument's kind is the signature kind or one of its descendants.
//! Lookup picks the signature that is at least as specific as every other
//! accepting signature on every position. Registration refuses a signature
//! that would make such a choice impossible, so lookup never guesses.

use crate::error::{CoreError, CoreResult, ErrorKind};
use std::collections::HashMap;
use std::fmt::Debug;

/// A node in a kind hierarchy.
pub trait Kind: Copy + Eq + Debug {
    /// The enclosing kind, `None` at the root.
    fn parent(self) -> Option<Self>;

    /// Whether `self` is `other` or a descendant of it.
    fn is_a(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

fn dominates<K: Kind>(a: &[K], b: &[K]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_a(*y))
}

fn overlaps<K: Kind>(a: &[K], b: &[K]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_a(*y) || y.is_a(*x))
}

/// A registered signature and its handler.
#[derive(Debug, Clone)]
struct Entry<K, H> {
    kinds: Vec<K>,
    handler: H,
}

/// Handlers keyed by command name and argument kinds.
#[derive(Debug, Clone)]
pub struct CommandRegistry<K, H> {
    commands: HashMap<String, Vec<Entry<K, H>>>,
}

impl<K, H> Default for CommandRegistry<K, H> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }
}

impl<K: Kind, H> CommandRegistry<K, H> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `command` over `kinds`.
    ///
    /// # Errors
    ///
    /// Returns an internal error for a duplicate signature, or for one that
    /// overlaps an existing signature without either being more specific.
    pub fn register(&mut self, command: &str, kinds: &[K], handler: H) -> CoreResult<()> {
        let entries = self.commands.entry(command.to_string()).or_default();
        for entry in entries.iter() {
            if entry.kinds == kinds {
                return Err(CoreError::internal(format!(
                    "{command}{kinds:?} is already registered"
                )));
            }
            if overlaps(&entry.kinds, kinds)
                && !dominates(&entry.kinds, kinds)
                && !dominates(kinds, &entry.kinds)
            {
                return Err(CoreError::internal(format!(
                    "{command}{kinds:?} is ambiguous with {command}{:?}",
                    entry.kinds
                )));
            }
        }
        entries.push(Entry {
            kinds: kinds.to_vec(),
            handler,
        });
        Ok(())
    }

    /// Whether any signature is registered for `command`.
    #[must_use]
    pub fn contains(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Finds the most specific handler for `command` over `args`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMethod` when no signature accepts the arguments.
    pub fn lookup(&self, command: &str, args: &[K]) -> CoreResult<&H> {
        let unknown = || -> CoreError {
            ErrorKind::UnknownMethod
                .err()
                .with("name", command)
                .with("expr", format!("{command}{args:?}"))
                .into()
        };
        let entries = self.commands.get(command).ok_or_else(unknown)?;
        let accepting: Vec<&Entry<K, H>> = entries
            .iter()
            .filter(|e| dominates(args, &e.kinds))
            .collect();
        accepting
            .iter()
            .find(|candidate| {
                accepting
                    .iter()
                    .all(|other| dominates(&candidate.kinds, &other.kinds))
            })
            .map(|e| &e.handler)
            .ok_or_else(unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Shape {
        Any,
        Number,
        Integer,
        Text,
    }

    impl Kind for Shape {
        fn parent(self) -> Option<Self> {
            match self {
                Self::Any => None,
                Self::Number | Self::Text => Some(Self::Any),
                Self::Integer => Some(Self::Number),
            }
        }
    }

    #[test]
    fn most_specific_wins() {
        let mut reg = CommandRegistry::new();
        reg.register("eq", &[Shape::Any, Shape::Any], "generic").unwrap();
        reg.register("eq", &[Shape::Number, Shape::Number], "numeric").unwrap();
        reg.register("eq", &[Shape::Integer, Shape::Integer], "integer").unwrap();

        assert_eq!(*reg.lookup("eq", &[Shape::Integer, Shape::Integer]).unwrap(), "integer");
        assert_eq!(*reg.lookup("eq", &[Shape::Integer, Shape::Number]).unwrap(), "numeric");
        assert_eq!(*reg.lookup("eq", &[Shape::Text, Shape::Integer]).unwrap(), "generic");
    }

    #[test]
    fn ambiguous_signatures_are_refused() {
        let mut reg = CommandRegistry::new();
        reg.register("f", &[Shape::Number, Shape::Any], 1).unwrap();
        let err = reg.register("f", &[Shape::Any, Shape::Number], 2).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        assert!(reg.register("f", &[Shape::Number, Shape::Any], 3).is_err());
        // Disjoint signatures never compete.
        reg.register("f", &[Shape::Text, Shape::Number], 4).unwrap();
    }

    #[test]
    fn unknown_commands_and_arities() {
        let mut reg = CommandRegistry::new();
        reg.register("lower", &[Shape::Text], ()).unwrap();
        assert_eq!(reg.lookup("upper", &[Shape::Text]).unwrap_err().code(), "UnknownMethod");
        assert_eq!(
            reg.lookup("lower", &[Shape::Number]).unwrap_err().code(),
            "UnknownMethod"
        );
        assert!(reg.lookup("lower", &[Shape::Text, Shape::Text]).is_err());
        assert!(reg.contains("lower"));
    }
}
