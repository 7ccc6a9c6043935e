//! Renders trees back to source text.
//!
//! The output reparses to an equal tree for everything [`crate::parse`] can
//! produce. Operators are written infix when the node has the arity the
//! parser would give it; anything else falls back to call syntax, which the
//! parser accepts for every name.

use crate::ast::{Expr, Literal, Node};
use crate::lexer::{is_ident_continue, is_ident_start};
use std::fmt::Write;

const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_CMP: u8 = 4;
const PREC_UNARY: u8 = 5;
const PREC_POSTFIX: u8 = 6;

/// Renders a node as expression source.
#[must_use]
pub fn unparse(node: &Node) -> String {
    let mut out = String::new();
    write_node(&mut out, node, 0);
    out
}

/// Renders an expression as source.
#[must_use]
pub fn unparse_expr(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr);
    out
}

enum Form<'a> {
    Or,
    And,
    Not,
    Cmp(&'static str),
    Negative,
    Positive,
    Filter,
    GetAttr(&'a str),
    Bind(&'a str),
    Call,
}

fn form(expr: &Expr) -> Form<'_> {
    let args = &expr.args;
    match (expr.name.as_str(), args.len()) {
        ("or", n) if n >= 2 => Form::Or,
        ("and", n) if n >= 2 => Form::And,
        ("not", 1) => Form::Not,
        ("eq", 2) => Form::Cmp("="),
        ("ne", 2) => Form::Cmp("!="),
        ("lt", 2) => Form::Cmp("<"),
        ("le", 2) => Form::Cmp("<="),
        ("gt", 2) => Form::Cmp(">"),
        ("ge", 2) => Form::Cmp(">="),
        ("negative", 1) => Form::Negative,
        ("positive", 1) => Form::Positive,
        ("filter", 2) => Form::Filter,
        ("getattr", 2) => {
            let receiver_is_bind = args[0]
                .as_expr()
                .and_then(Expr::bound_name)
                .is_some();
            let attr = args[1]
                .as_expr()
                .and_then(Expr::bound_name)
                .filter(|a| is_ident(a));
            match attr {
                Some(attr) if !receiver_is_bind => Form::GetAttr(attr),
                _ => Form::Call,
            }
        }
        ("bind", 1) => match expr.bound_name() {
            Some(path) if is_bind_path(path) => Form::Bind(path),
            _ => Form::Call,
        },
        _ => Form::Call,
    }
}

fn precedence(node: &Node) -> u8 {
    match node {
        Node::Literal(Literal::Integer(n)) if *n < 0 => PREC_UNARY,
        Node::Literal(Literal::Float(f)) if f.is_sign_negative() => PREC_UNARY,
        Node::Literal(_) => PREC_POSTFIX,
        Node::Expr(e) => match form(e) {
            Form::Or => PREC_OR,
            Form::And => PREC_AND,
            Form::Not => PREC_NOT,
            Form::Cmp(_) => PREC_CMP,
            Form::Negative | Form::Positive => PREC_UNARY,
            Form::Filter | Form::GetAttr(_) | Form::Bind(_) | Form::Call => PREC_POSTFIX,
        },
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(is_ident_start) && chars.all(is_ident_continue)
}

fn is_bind_path(path: &str) -> bool {
    let mut segments = path.split('.');
    let first_ok = segments
        .next()
        .is_some_and(|s| is_ident(s) && !matches!(s, "null" | "true" | "false"));
    first_ok && segments.all(is_ident)
}

fn write_node(out: &mut String, node: &Node, min_prec: u8) {
    let wrap = precedence(node) < min_prec;
    if wrap {
        out.push('(');
    }
    match node {
        Node::Literal(lit) => write_literal(out, lit),
        Node::Expr(e) => write_expr(out, e),
    }
    if wrap {
        out.push(')');
    }
}

fn write_expr(out: &mut String, expr: &Expr) {
    let args = &expr.args;
    match form(expr) {
        Form::Or => write_joined(out, args, "|", PREC_OR + 1),
        Form::And => write_joined(out, args, "&", PREC_AND + 1),
        Form::Not => {
            out.push('!');
            write_node(out, &args[0], PREC_NOT);
        }
        Form::Cmp(op) => {
            write_node(out, &args[0], PREC_UNARY);
            out.push_str(op);
            write_node(out, &args[1], PREC_UNARY);
        }
        Form::Negative => {
            out.push('-');
            // `-5` would reparse as a literal.
            let unsigned_number = match &args[0] {
                Node::Literal(Literal::Integer(n)) => *n >= 0,
                Node::Literal(Literal::Float(f)) => !f.is_sign_negative(),
                _ => false,
            };
            let min = if unsigned_number { u8::MAX } else { PREC_UNARY };
            write_node(out, &args[0], min);
        }
        Form::Positive => {
            out.push('+');
            write_node(out, &args[0], PREC_UNARY);
        }
        Form::Filter => {
            write_node(out, &args[0], PREC_POSTFIX);
            out.push('[');
            write_node(out, &args[1], 0);
            out.push(']');
        }
        Form::GetAttr(attr) => {
            write_node(out, &args[0], PREC_POSTFIX);
            out.push('.');
            out.push_str(attr);
        }
        Form::Bind(path) => out.push_str(path),
        Form::Call => {
            out.push_str(&expr.name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_arg(out, arg);
            }
            out.push(')');
        }
    }
}

fn write_arg(out: &mut String, arg: &Node) {
    if let Some((key, value)) = arg.as_expr().and_then(Expr::as_kwarg) {
        if is_ident(key) {
            out.push_str(key);
            out.push(':');
            write_node(out, value, 0);
            return;
        }
    }
    write_node(out, arg, 0);
}

fn write_joined(out: &mut String, args: &[Node], sep: &str, min_prec: u8) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        write_node(out, arg, min_prec);
    }
}

fn write_literal(out: &mut String, lit: &Literal) {
    match lit {
        Literal::Null => out.push_str("null"),
        Literal::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Literal::Integer(n) => {
            let _ = write!(out, "{n}");
        }
        Literal::Float(f) => {
            let _ = write!(out, "{f:?}");
        }
        Literal::String(s) => write_string(out, s),
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn roundtrip(src: &str) -> String {
        let tree = parse(src).unwrap();
        let text = unparse(&tree);
        assert_eq!(parse(&text).unwrap(), tree, "reparse of {text:?}");
        text
    }

    #[test]
    fn compact_query_form() {
        assert_eq!(
            roundtrip(r#"name = "x" & count > 10 & select(name, count) & sort(-count) & limit(20)"#),
            r#"name="x"&count>10&select(name,count)&sort(-count)&limit(20)"#
        );
    }

    #[test]
    fn keeps_grouping() {
        assert_eq!(roundtrip("(a|b)&c"), "(a|b)&c");
        assert_eq!(roundtrip("(a&b)&c"), "(a&b)&c");
        assert_eq!(roundtrip("a|b&c"), "a|b&c");
        assert_eq!(roundtrip("!(a&b)"), "!(a&b)");
        assert_eq!(roundtrip("(a=1)=true"), "(a=1)=true");
    }

    #[test]
    fn postfix_forms() {
        assert_eq!(roundtrip("notes[note=1]"), "notes[note=1]");
        assert_eq!(roundtrip("f(x).y"), "f(x).y");
        assert_eq!(roundtrip(r#"name.lower()="x""#), r#"lower(name)="x""#);
        assert_eq!(roundtrip("(-5).y"), "(-5).y");
    }

    #[test]
    fn numeric_signs() {
        assert_eq!(roundtrip("-5"), "-5");
        assert_eq!(roundtrip("-(5)"), "-(5)");
        assert_eq!(roundtrip("--5"), "--5");
        assert_eq!(roundtrip("1.5"), "1.5");
        assert_eq!(roundtrip("-x"), "-x");
    }

    #[test]
    fn keywords_and_strings() {
        assert_eq!(roundtrip("page(size: 6)"), "page(size:6)");
        assert_eq!(roundtrip(r#""a\"b\n""#), r#""a\"b\n""#);
    }

    #[test]
    fn non_parser_shapes_use_call_syntax() {
        let odd = Node::Expr(Expr::new("and", vec![Node::Expr(Expr::bind("a"))]));
        assert_eq!(unparse(&odd), "and(a)");
        let keyword_bind = Node::Expr(Expr::bind("true"));
        assert_eq!(unparse(&keyword_bind), r#"bind("true")"#);
        assert_eq!(parse(&unparse(&keyword_bind)).unwrap(), keyword_bind);
        let getattr_on_bind = Node::Expr(Expr::new(
            "getattr",
            vec![Node::Expr(Expr::bind("a")), Node::Expr(Expr::bind("b"))],
        ));
        assert_eq!(parse(&unparse(&getattr_on_bind)).unwrap(), getattr_on_bind);
    }

    #[test]
    fn display_uses_unparse() {
        let tree = parse("count>=3").unwrap();
        assert_eq!(tree.to_string(), "count>=3");
    }
}
