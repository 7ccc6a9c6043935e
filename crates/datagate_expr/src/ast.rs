//! The uniform expression tree.
//!
//! Every construct of the surface language becomes an [`Expr`] with a function
//! name and positional arguments:
//!
//! | Source | Tree |
//! |---|---|
//! | `name` | `bind("name")` |
//! | `a.b.c` | `bind("a.b.c")` |
//! | `a = 1` | `eq(bind("a"), 1)` |
//! | `a & b & c` | `and(a, b, c)` |
//! | `!a` | `not(a)` |
//! | `-count` | `negative(bind("count"))` |
//! | `name.lower()` | `lower(bind("name"))` |
//! | `f(x)[p]` | `filter(f(x), p)` |
//! | `f(x).y` | `getattr(f(x), bind("y"))` |
//! | `page(size: 6)` | `page(kwarg("size", 6))` |

use serde::{Deserialize, Serialize};
use std::fmt;

/// A literal value in an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Float literal. Always finite.
    Float(f64),
    /// Quoted string.
    String(String),
}

impl Literal {
    /// Returns the string content if this is a string literal.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts into the JSON value the literal denotes.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(n) => serde_json::Value::from(*n),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for Literal {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<f64> for Literal {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// An argument: either a nested expression or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    /// A nested `{name, args}` node.
    Expr(Expr),
    /// A literal value.
    Literal(Literal),
}

impl Node {
    /// Returns the expression if this node is one.
    #[must_use]
    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            Self::Expr(e) => Some(e),
            Self::Literal(_) => None,
        }
    }

    /// Returns the literal if this node is one.
    #[must_use]
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Literal(l) => Some(l),
            Self::Expr(_) => None,
        }
    }

    /// Serializes the tree into its `{name, args}` JSON form.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<Expr> for Node {
    fn from(e: Expr) -> Self {
        Self::Expr(e)
    }
}

impl From<Literal> for Node {
    fn from(l: Literal) -> Self {
        Self::Literal(l)
    }
}

/// A function application `{name, args}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Function name.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Node>,
}

impl Expr {
    /// Creates an expression node.
    pub fn new(name: impl Into<String>, args: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// `bind(name)`: a reference to a (possibly dotted) property name.
    pub fn bind(name: impl Into<String>) -> Self {
        Self::new("bind", vec![Node::Literal(Literal::String(name.into()))])
    }

    /// `kwarg(key, value)`: a keyword argument inside a call.
    pub fn kwarg(key: impl Into<String>, value: Node) -> Self {
        Self::new(
            "kwarg",
            vec![Node::Literal(Literal::String(key.into())), value],
        )
    }

    /// If this is `bind("x")`, returns `"x"`.
    #[must_use]
    pub fn bound_name(&self) -> Option<&str> {
        if self.name == "bind" && self.args.len() == 1 {
            self.args[0].as_literal().and_then(Literal::as_str)
        } else {
            None
        }
    }

    /// If this is `kwarg(key, value)`, returns the pair.
    #[must_use]
    pub fn as_kwarg(&self) -> Option<(&str, &Node)> {
        if self.name == "kwarg" && self.args.len() == 2 {
            let key = self.args[0].as_literal().and_then(Literal::as_str)?;
            Some((key, &self.args[1]))
        } else {
            None
        }
    }

    /// Splits arguments into positional ones and keyword ones.
    #[must_use]
    pub fn split_args(&self) -> (Vec<&Node>, Vec<(&str, &Node)>) {
        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        for arg in &self.args {
            match arg.as_expr().and_then(Expr::as_kwarg) {
                Some(kw) => keywords.push(kw),
                None => positional.push(arg),
            }
        }
        (positional, keywords)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::unparse::unparse_expr(self))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::unparse::unparse(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_helpers() {
        let e = Expr::bind("notes.note");
        assert_eq!(e.bound_name(), Some("notes.note"));
        assert_eq!(Expr::new("lower", vec![]).bound_name(), None);
    }

    #[test]
    fn split_args_separates_keywords() {
        let e = Expr::new(
            "page",
            vec![
                Node::Literal(Literal::Integer(1)),
                Node::Expr(Expr::kwarg("size", Node::Literal(Literal::Integer(6)))),
            ],
        );
        let (pos, kw) = e.split_args();
        assert_eq!(pos.len(), 1);
        assert_eq!(kw[0].0, "size");
    }

    #[test]
    fn json_shape() {
        let e = Node::Expr(Expr::new(
            "eq",
            vec![Node::Expr(Expr::bind("a")), Node::Literal(Literal::Integer(1))],
        ));
        assert_eq!(
            e.to_json(),
            serde_json::json!({"name": "eq", "args": [{"name": "bind", "args": ["a"]}, 1]})
        );
    }

    #[test]
    fn json_roundtrip_keeps_literal_kinds() {
        let node = Node::Expr(Expr::new(
            "f",
            vec![
                Node::Literal(Literal::Null),
                Node::Literal(Literal::Bool(true)),
                Node::Literal(Literal::Integer(3)),
                Node::Literal(Literal::Float(1.5)),
                Node::Literal(Literal::String("x".into())),
            ],
        ));
        let back: Node = serde_json::from_value(node.to_json()).unwrap();
        assert_eq!(back, node);
    }
}
