//! # datagate expr
//!
//! The filter/projection expression language used in URLs, manifests and
//! permission rules.
//!
//! Source text parses into a uniform tree of `{name, args}` nodes (see
//! [`ast`]). Operators, attribute access, method calls and filters are all
//! desugared into named function applications, so later stages only ever
//! dispatch on a function name.
//!
//! ## Usage
//!
//! ```
//! use datagate_expr::{parse, unparse};
//!
//! let tree = parse(r#"name="x"&count>10&sort(-count)&limit(20)"#).unwrap();
//! let text = unparse(&tree);
//! assert_eq!(parse(&text).unwrap(), tree);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ast;
mod error;
mod lexer;
mod parser;
mod unparse;

pub use ast::{Expr, Literal, Node};
pub use error::{ExprError, ExprResult};
pub use lexer::{tokenize, Span, Token, TokenKind};
pub use parser::parse;
pub use unparse::{unparse, unparse_expr};
