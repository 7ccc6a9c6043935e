//! Evaluation of resource parameter expressions.
//!
//! Resource params drive templated external reads. A param either lists
//! literal values or computes the next value from the previous read, e.g.
//! `read().next` for a paginated API. Only a small expression subset is
//! meaningful here: literals, `param(name)`, `read()` and attribute access.

use crate::error::{CoreResult, ErrorKind};
use datagate_expr::{unparse, Node};
use serde_json::Value;
use std::collections::BTreeMap;

/// Values visible to a param expression.
#[derive(Debug, Clone, Copy)]
pub struct ParamScope<'a> {
    /// Values of params evaluated so far.
    pub values: &'a BTreeMap<String, Value>,
    /// Last record read from the source, for `read()`.
    pub last_read: Option<&'a Value>,
}

/// Evaluates a param expression.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown params and `UnknownMethod` for
/// functions outside the param subset.
pub fn eval_param(node: &Node, scope: ParamScope<'_>) -> CoreResult<Value> {
    let expr = match node {
        Node::Literal(lit) => return Ok(lit.to_json()),
        Node::Expr(e) => e,
    };
    let lookup = |name: &str| -> CoreResult<Value> {
        scope.values.get(name).cloned().ok_or_else(|| {
            ErrorKind::InvalidValue
                .err()
                .with("param", name)
                .with("expr", unparse(node))
                .into()
        })
    };
    if let Some(name) = expr.bound_name() {
        return lookup(name);
    }
    match (expr.name.as_str(), expr.args.as_slice()) {
        ("param", [Node::Expr(arg)]) if arg.bound_name().is_some() => {
            lookup(arg.bound_name().unwrap_or_default())
        }
        ("param", [Node::Literal(lit)]) if lit.as_str().is_some() => {
            lookup(lit.as_str().unwrap_or_default())
        }
        ("read", []) => Ok(scope.last_read.cloned().unwrap_or(Value::Null)),
        ("getattr", [receiver, Node::Expr(attr)]) if attr.bound_name().is_some() => {
            let value = eval_param(receiver, scope)?;
            let key = attr.bound_name().unwrap_or_default();
            Ok(value.get(key).cloned().unwrap_or(Value::Null))
        }
        _ => Err(ErrorKind::UnknownMethod
            .err()
            .with("name", expr.name.as_str())
            .with("expr", unparse(node))
            .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(source: &str, values: &BTreeMap<String, Value>, last: Option<&Value>) -> CoreResult<Value> {
        let node = datagate_expr::parse(source).unwrap();
        eval_param(
            &node,
            ParamScope {
                values,
                last_read: last,
            },
        )
    }

    #[test]
    fn literals_and_params() {
        let mut values = BTreeMap::new();
        values.insert("year".to_string(), json!(2020));
        assert_eq!(eval("\"x\"", &values, None).unwrap(), json!("x"));
        assert_eq!(eval("param(year)", &values, None).unwrap(), json!(2020));
        assert_eq!(eval("year", &values, None).unwrap(), json!(2020));
        assert_eq!(eval("param(month)", &values, None).unwrap_err().code(), "InvalidValue");
    }

    #[test]
    fn read_walks_the_last_record() {
        let values = BTreeMap::new();
        let last = json!({"next": "page-2"});
        assert_eq!(eval("read().next", &values, Some(&last)).unwrap(), json!("page-2"));
        assert_eq!(eval("read().other", &values, Some(&last)).unwrap(), Value::Null);
        assert_eq!(eval("read()", &values, None).unwrap(), Value::Null);
        assert_eq!(eval("lower(x)", &values, None).unwrap_err().code(), "UnknownMethod");
    }
}
