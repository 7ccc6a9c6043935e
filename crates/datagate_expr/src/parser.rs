//! Expression grammar, built from chumsky combinators over the token
//! stream.
//!
//! Loosest binding first:
//!
//! ```text
//! expr    := or
//! or      := and ("|" and)*
//! and     := not ("&" not)*
//! not     := "!" not | cmp
//! cmp     := unary (("=" | "!=" | "<" | "<=" | ">" | ">=") unary)?
//! unary   := ("-" | "+") unary | postfix
//! postfix := primary ("." NAME ["(" args ")"] | "[" expr "]")*
//! primary := literal | NAME ["(" args ")"] | "(" expr ")"
//! args    := [arg ("," arg)*]
//! arg     := NAME ":" expr | expr
//! ```
//!
//! Numbers stay as text with their offsets until the tree is lowered to
//! [`Node`], so range errors point at the literal.

use crate::ast::{Expr, Literal, Node};
use crate::error::{ExprError, ExprResult};
use crate::lexer::{tokenize, Span, TokenKind};
use chumsky::prelude::*;
use chumsky::Stream;

/// Parse tree before number literals are checked.
#[derive(Debug, Clone)]
enum Syntax {
    Literal(Literal),
    Number { text: String, offset: usize },
    Call { name: String, args: Vec<Syntax> },
}

impl Syntax {
    fn call(name: impl Into<String>, args: Vec<Syntax>) -> Self {
        Self::Call {
            name: name.into(),
            args,
        }
    }

    fn bind(name: impl Into<String>) -> Self {
        Self::call("bind", vec![Self::Literal(Literal::String(name.into()))])
    }

    fn bound_name(&self) -> Option<&str> {
        match self {
            Self::Call { name, args } if name == "bind" => match args.as_slice() {
                [Self::Literal(Literal::String(bound))] => Some(bound.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Joins operands under `name` unless there is only one.
    fn chain(name: &str, first: Self, rest: Vec<Self>) -> Self {
        if rest.is_empty() {
            return first;
        }
        let mut args = vec![first];
        args.extend(rest);
        Self::call(name, args)
    }

    fn lower(self) -> ExprResult<Node> {
        match self {
            Self::Literal(literal) => Ok(Node::Literal(literal)),
            Self::Number { text, offset } => number_literal(&text, offset).map(Node::Literal),
            Self::Call { name, args } => {
                let args = args
                    .into_iter()
                    .map(Self::lower)
                    .collect::<ExprResult<Vec<_>>>()?;
                Ok(Node::Expr(Expr::new(name, args)))
            }
        }
    }
}

enum Postfix {
    Attr(String),
    Method(String, Vec<Syntax>),
    Filter(Syntax),
}

fn apply(node: Syntax, op: Postfix) -> Syntax {
    match op {
        Postfix::Method(name, args) => {
            let mut all = vec![node];
            all.extend(args);
            Syntax::call(name, all)
        }
        Postfix::Attr(attr) => match node.bound_name().map(|base| format!("{base}.{attr}")) {
            Some(path) => Syntax::bind(path),
            None => Syntax::call("getattr", vec![node, Syntax::bind(attr)]),
        },
        Postfix::Filter(predicate) => Syntax::call("filter", vec![node, predicate]),
    }
}

fn parser() -> impl Parser<TokenKind, Syntax, Error = Simple<TokenKind>> {
    let expr = recursive(|expr| {
        let ident = select! { TokenKind::Ident(name) => name };
        let number = select! { TokenKind::Number(text) => text }
            .map_with_span(|text, span: Span| Syntax::Number {
                text,
                offset: span.start,
            });

        let arg = ident
            .clone()
            .then_ignore(just(TokenKind::Colon))
            .then(expr.clone())
            .map(|(key, value)| {
                Syntax::call("kwarg", vec![Syntax::Literal(Literal::String(key)), value])
            })
            .or(expr.clone());
        let args = arg
            .separated_by(just(TokenKind::Comma))
            .delimited_by(just(TokenKind::LParen), just(TokenKind::RParen));

        let primary = choice((
            number.clone(),
            select! { TokenKind::Str(s) => Syntax::Literal(Literal::String(s)) },
            expr.clone()
                .delimited_by(just(TokenKind::LParen), just(TokenKind::RParen)),
            ident
                .clone()
                .then(args.clone())
                .map(|(name, args)| Syntax::call(name, args)),
            ident.clone().map(|name| match name.as_str() {
                "null" => Syntax::Literal(Literal::Null),
                "true" => Syntax::Literal(Literal::Bool(true)),
                "false" => Syntax::Literal(Literal::Bool(false)),
                _ => Syntax::bind(name),
            }),
        ));

        let postfix_op = choice((
            just(TokenKind::Dot)
                .ignore_then(ident)
                .then(args.or_not())
                .map(|(name, args)| match args {
                    Some(args) => Postfix::Method(name, args),
                    None => Postfix::Attr(name),
                }),
            expr.clone()
                .delimited_by(just(TokenKind::LBracket), just(TokenKind::RBracket))
                .map(Postfix::Filter),
        ));
        let postfix = primary.then(postfix_op.repeated()).foldl(apply);

        // `-5` is a literal, not negative(5), unless a postfix follows.
        let no_postfix = one_of([TokenKind::Dot, TokenKind::LBracket])
            .not()
            .rewind()
            .ignored()
            .or(end());
        let unary = recursive(|unary| {
            let negative_literal = just(TokenKind::Minus)
                .ignore_then(number)
                .then_ignore(no_postfix)
                .map(|number| match number {
                    Syntax::Number { text, offset } => Syntax::Number {
                        text: format!("-{text}"),
                        offset,
                    },
                    other => other,
                });
            let signed = choice((
                just(TokenKind::Minus).to("negative"),
                just(TokenKind::Plus).to("positive"),
            ))
            .then(unary)
            .map(|(name, operand)| Syntax::call(name, vec![operand]));
            choice((negative_literal, signed, postfix))
        });

        let comparison = choice((
            just(TokenKind::Eq).to("eq"),
            just(TokenKind::Ne).to("ne"),
            just(TokenKind::Lt).to("lt"),
            just(TokenKind::Le).to("le"),
            just(TokenKind::Gt).to("gt"),
            just(TokenKind::Ge).to("ge"),
        ));
        let cmp = unary
            .clone()
            .then(comparison.then(unary).or_not())
            .map(|(left, right)| match right {
                Some((name, right)) => Syntax::call(name, vec![left, right]),
                None => left,
            });

        let not = recursive(|not| {
            just(TokenKind::Bang)
                .ignore_then(not)
                .map(|operand| Syntax::call("not", vec![operand]))
                .or(cmp)
        });

        let and = not
            .clone()
            .then(just(TokenKind::Amp).ignore_then(not).repeated())
            .map(|(first, rest)| Syntax::chain("and", first, rest));

        and.clone()
            .then(just(TokenKind::Pipe).ignore_then(and).repeated())
            .map(|(first, rest)| Syntax::chain("or", first, rest))
    });

    expr.then_ignore(end())
}

fn syntax_error(error: &Simple<TokenKind>, source_len: usize) -> ExprError {
    let mut expected: Vec<String> = error
        .expected()
        .map(|kind| kind.as_ref().map_or_else(|| "end of input".to_string(), TokenKind::describe))
        .collect();
    expected.sort();
    let expected = match expected.len() {
        0 => "expression".to_string(),
        1 => expected.remove(0),
        _ => format!("one of {}", expected.join(", ")),
    };
    match error.found() {
        Some(found) => ExprError::unexpected(error.span().start, expected, found.describe()),
        None => ExprError::UnexpectedEnd {
            offset: source_len,
            expected,
        },
    }
}

/// Parses a complete expression.
///
/// # Errors
///
/// Returns a syntax error with the byte offset where it was detected.
///
/// # Example
///
/// ```
/// use datagate_expr::{parse, Expr, Literal, Node};
///
/// let tree = parse("count>10").unwrap();
/// assert_eq!(
///     tree,
///     Node::Expr(Expr::new(
///         "gt",
///         vec![Node::Expr(Expr::bind("count")), Node::Literal(Literal::Integer(10))],
///     ))
/// );
/// ```
pub fn parse(source: &str) -> ExprResult<Node> {
    let len = source.len();
    let tokens = tokenize(source)?
        .into_iter()
        .map(|token| (token.kind, token.span));
    let syntax = parser()
        .parse(Stream::from_iter(len..len, tokens))
        .map_err(|errors| match errors.first() {
            Some(error) => syntax_error(error, len),
            None => ExprError::UnexpectedEnd {
                offset: len,
                expected: "expression".to_string(),
            },
        })?;
    syntax.lower()
}

fn number_literal(text: &str, offset: usize) -> ExprResult<Literal> {
    let invalid = || ExprError::InvalidNumber {
        offset,
        text: text.to_string(),
    };
    if text.contains(['.', 'e', 'E']) {
        let f: f64 = text.parse().map_err(|_| invalid())?;
        if !f.is_finite() {
            return Err(invalid());
        }
        Ok(Literal::Float(f))
    } else {
        text.parse::<i64>().map(Literal::Integer).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(name: &str) -> Node {
        Node::Expr(Expr::bind(name))
    }

    fn lit<T: Into<Literal>>(v: T) -> Node {
        Node::Literal(v.into())
    }

    fn call(name: &str, args: Vec<Node>) -> Node {
        Node::Expr(Expr::new(name, args))
    }

    #[test]
    fn query_string_example() {
        let tree =
            parse(r#"name="x"&count>10&select(name,count)&sort(-count)&limit(20)"#).unwrap();
        assert_eq!(
            tree,
            call(
                "and",
                vec![
                    call("eq", vec![bind("name"), lit("x")]),
                    call("gt", vec![bind("count"), lit(10)]),
                    call("select", vec![bind("name"), bind("count")]),
                    call("sort", vec![call("negative", vec![bind("count")])]),
                    call("limit", vec![lit(20)]),
                ]
            )
        );
    }

    #[test]
    fn dotted_names_and_methods() {
        assert_eq!(parse("a.b.c").unwrap(), bind("a.b.c"));
        assert_eq!(
            parse(r#"name.lower()="x""#).unwrap(),
            call("eq", vec![call("lower", vec![bind("name")]), lit("x")])
        );
        assert_eq!(
            parse(r#"notes.note.contains("foo")"#).unwrap(),
            call("contains", vec![bind("notes.note"), lit("foo")])
        );
    }

    #[test]
    fn getattr_and_filter() {
        assert_eq!(
            parse("f(x).y").unwrap(),
            call("getattr", vec![call("f", vec![bind("x")]), bind("y")])
        );
        assert_eq!(
            parse("notes[note=1]").unwrap(),
            call(
                "filter",
                vec![bind("notes"), call("eq", vec![bind("note"), lit(1)])]
            )
        );
    }

    #[test]
    fn keyword_arguments() {
        assert_eq!(
            parse(r#"page(size: 6, key: "abc")"#).unwrap(),
            call(
                "page",
                vec![
                    Node::Expr(Expr::kwarg("size", lit(6))),
                    Node::Expr(Expr::kwarg("key", lit("abc"))),
                ]
            )
        );
    }

    #[test]
    fn precedence() {
        assert_eq!(
            parse("a=1|b=2&c=3").unwrap(),
            call(
                "or",
                vec![
                    call("eq", vec![bind("a"), lit(1)]),
                    call(
                        "and",
                        vec![
                            call("eq", vec![bind("b"), lit(2)]),
                            call("eq", vec![bind("c"), lit(3)])
                        ]
                    ),
                ]
            )
        );
        assert_eq!(
            parse("!a=1").unwrap(),
            call("not", vec![call("eq", vec![bind("a"), lit(1)])])
        );
        assert_eq!(
            parse("(a & b) & c").unwrap(),
            call(
                "and",
                vec![call("and", vec![bind("a"), bind("b")]), bind("c")]
            )
        );
    }

    #[test]
    fn literals() {
        assert_eq!(parse("null").unwrap(), lit(Literal::Null));
        assert_eq!(parse("true").unwrap(), lit(true));
        assert_eq!(parse("-5").unwrap(), lit(-5));
        assert_eq!(parse("-2.5").unwrap(), lit(-2.5));
        assert_eq!(parse("-9223372036854775808").unwrap(), lit(i64::MIN));
        assert_eq!(
            parse("-x").unwrap(),
            call("negative", vec![bind("x")])
        );
        assert_eq!(
            parse("+x").unwrap(),
            call("positive", vec![bind("x")])
        );
    }

    #[test]
    fn point_call() {
        assert_eq!(
            parse("point(1.5, -2)").unwrap(),
            call("point", vec![lit(1.5), lit(-2)])
        );
    }

    #[test]
    fn syntax_errors_report_offsets() {
        assert_eq!(parse("a = ").unwrap_err().offset(), 4);
        assert_eq!(parse("f(a,").unwrap_err().offset(), 4);
        assert_eq!(parse("a b").unwrap_err().offset(), 2);
        assert_eq!(parse("(a").unwrap_err().offset(), 2);
        assert!(matches!(
            parse("99999999999999999999"),
            Err(ExprError::InvalidNumber { offset: 0, .. })
        ));
        assert!(matches!(parse("1e999"), Err(ExprError::InvalidNumber { .. })));
    }

    #[test]
    fn signs_fold_only_into_bare_numbers() {
        assert_eq!(
            parse("-5.lower()").unwrap(),
            call("negative", vec![call("lower", vec![lit(5)])])
        );
        assert_eq!(parse("- -5").unwrap(), call("negative", vec![lit(-5)]));
        assert_eq!(parse("-(5)").unwrap(), call("negative", vec![lit(5)]));
        assert_eq!(parse("+5").unwrap(), call("positive", vec![lit(5)]));
    }

    #[test]
    fn offsets_count_bytes() {
        let err = parse("'Š' b").unwrap_err();
        assert!(matches!(err, ExprError::UnexpectedToken { offset: 5, .. }), "{err:?}");
    }

    #[test]
    fn comparisons_do_not_chain() {
        assert!(parse("a = b = c").is_err());
    }
}
