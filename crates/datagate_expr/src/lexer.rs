//! Tokenizer for the expression language.
//!
//! The chumsky lexer never fails: characters that start no token, broken
//! escapes and unclosed strings come out as error lexemes, and [`tokenize`]
//! turns the first of them into an [`ExprError`] with its exact offset.

use crate::error::{ExprError, ExprResult};
use chumsky::prelude::*;
use chumsky::Stream;
use std::ops::Range;

/// Byte range of a token in the source.
pub type Span = Range<usize>;

/// Token kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Identifier (letters, digits, `_`, `@`; not starting with a digit).
    Ident(String),
    /// Unsigned numeric literal, kept as text until the parser knows the sign.
    Number(String),
    /// Quoted string with escapes already resolved.
    Str(String),
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `.`
    Dot,
    /// `&`
    Amp,
    /// `|`
    Pipe,
    /// `!`
    Bang,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl TokenKind {
    /// Short human-readable description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("identifier {s:?}"),
            Self::Number(n) => format!("number {n}"),
            Self::Str(s) => format!("string {s:?}"),
            other => format!("{:?}", symbol(other)),
        }
    }
}

fn symbol(kind: &TokenKind) -> &'static str {
    match kind {
        TokenKind::LParen => "(",
        TokenKind::RParen => ")",
        TokenKind::LBracket => "[",
        TokenKind::RBracket => "]",
        TokenKind::Comma => ",",
        TokenKind::Colon => ":",
        TokenKind::Dot => ".",
        TokenKind::Amp => "&",
        TokenKind::Pipe => "|",
        TokenKind::Bang => "!",
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Eq => "=",
        TokenKind::Ne => "!=",
        TokenKind::Lt => "<",
        TokenKind::Le => "<=",
        TokenKind::Gt => ">",
        TokenKind::Ge => ">=",
        TokenKind::Ident(_) | TokenKind::Number(_) | TokenKind::Str(_) => "",
    }
}

/// A token with its byte span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// What the token is.
    pub kind: TokenKind,
    /// Bytes it covers.
    pub span: Span,
}

impl Token {
    /// Byte offset of its first character.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.span.start
    }
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

pub(crate) fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '@'
}

/// One piece of a string literal body.
#[derive(Debug, Clone)]
enum Piece {
    Char(char),
    BadEscape(usize),
}

#[derive(Debug, Clone)]
enum Lexeme {
    Token(TokenKind),
    Str { pieces: Vec<Piece>, closed: bool },
    Stray(char),
}

fn unescape(c: char, hex: Option<&str>) -> Option<char> {
    match (c, hex) {
        ('"' | '\'' | '\\' | '/', None) => Some(c),
        ('n', None) => Some('\n'),
        ('r', None) => Some('\r'),
        ('t', None) => Some('\t'),
        ('u', Some(hex)) if hex.len() == 4 => {
            u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
        }
        _ => None,
    }
}

fn string(quote: char) -> impl Parser<char, Lexeme, Error = Simple<char>> + Clone {
    let hex = filter(char::is_ascii_hexdigit)
        .repeated()
        .at_most(4)
        .collect::<String>();
    let escape = just('\\')
        .ignore_then(
            just('u')
                .ignore_then(hex)
                .map(|hex| ('u', Some(hex)))
                .or(any().map(|c| (c, None)))
                .or_not(),
        )
        .map_with_span(|body, span: Span| {
            body.and_then(|(c, hex)| unescape(c, hex.as_deref()))
                .map_or(Piece::BadEscape(span.start), Piece::Char)
        });

    just(quote)
        .ignore_then(none_of([quote, '\\']).map(Piece::Char).or(escape).repeated())
        .then(just(quote).or_not())
        .map(|(pieces, close)| Lexeme::Str {
            pieces,
            closed: close.is_some(),
        })
}

fn lexer() -> impl Parser<char, Vec<(Lexeme, Span)>, Error = Simple<char>> {
    let ident = filter(|c: &char| is_ident_start(*c))
        .then(filter(|c: &char| is_ident_continue(*c)).repeated())
        .map(|(first, rest)| {
            let mut name = String::from(first);
            name.extend(rest);
            TokenKind::Ident(name)
        });

    // A fraction needs a digit after the dot, otherwise the dot belongs to a
    // method call or attribute access: `5.lower()`.
    let number = text::digits(10)
        .then(just('.').ignore_then(text::digits(10)).or_not())
        .then(
            one_of("eE")
                .then(one_of("+-").or_not())
                .then(text::digits(10))
                .or_not(),
        )
        .map(|((int, frac), exp): ((String, Option<String>), _)| {
            let mut text = int;
            if let Some(frac) = frac {
                text.push('.');
                text.push_str(&frac);
            }
            if let Some(((e, sign), digits)) = exp {
                text.push(e);
                text.extend(sign);
                text.push_str(&digits);
            }
            TokenKind::Number(text)
        });

    let operator = choice((
        just("!=").to(TokenKind::Ne),
        just("<=").to(TokenKind::Le),
        just(">=").to(TokenKind::Ge),
        just('!').to(TokenKind::Bang),
        just('<').to(TokenKind::Lt),
        just('>').to(TokenKind::Gt),
        just('=').to(TokenKind::Eq),
        just('&').to(TokenKind::Amp),
        just('|').to(TokenKind::Pipe),
        just('+').to(TokenKind::Plus),
        just('-').to(TokenKind::Minus),
    ));

    let punctuation = choice((
        just('(').to(TokenKind::LParen),
        just(')').to(TokenKind::RParen),
        just('[').to(TokenKind::LBracket),
        just(']').to(TokenKind::RBracket),
        just(',').to(TokenKind::Comma),
        just(':').to(TokenKind::Colon),
        just('.').to(TokenKind::Dot),
    ));

    let lexeme = choice((
        string('"'),
        string('\''),
        number.or(ident).or(operator).or(punctuation).map(Lexeme::Token),
        any().map(Lexeme::Stray),
    ));

    text::whitespace()
        .ignore_then(
            lexeme
                .map_with_span(|lexeme, span| (lexeme, span))
                .then_ignore(text::whitespace())
                .repeated(),
        )
        .then_ignore(end())
}

/// Splits `source` into tokens.
///
/// # Errors
///
/// Returns an error for characters that start no token, unterminated
/// strings and bad escapes.
pub fn tokenize(source: &str) -> ExprResult<Vec<Token>> {
    let len = source.len();
    let chars = source
        .char_indices()
        .map(|(i, c)| (c, i..i + c.len_utf8()));
    let lexemes = lexer()
        .parse(Stream::from_iter(len..len, chars))
        .map_err(|errors| match errors.into_iter().next() {
            Some(error) => match error.found() {
                Some(&ch) => ExprError::UnexpectedChar {
                    offset: error.span().start,
                    ch,
                },
                None => ExprError::UnexpectedEnd {
                    offset: len,
                    expected: "token".to_string(),
                },
            },
            None => ExprError::UnexpectedEnd {
                offset: len,
                expected: "token".to_string(),
            },
        })?;

    lexemes
        .into_iter()
        .map(|(lexeme, span)| {
            let kind = match lexeme {
                Lexeme::Token(kind) => kind,
                Lexeme::Stray(ch) => {
                    return Err(ExprError::UnexpectedChar {
                        offset: span.start,
                        ch,
                    })
                }
                Lexeme::Str { closed: false, .. } => {
                    return Err(ExprError::UnterminatedString { offset: span.start })
                }
                Lexeme::Str { pieces, .. } => TokenKind::Str(
                    pieces
                        .into_iter()
                        .map(|piece| match piece {
                            Piece::Char(c) => Ok(c),
                            Piece::BadEscape(offset) => Err(ExprError::InvalidEscape { offset }),
                        })
                        .collect::<ExprResult<String>>()?,
                ),
            };
            Ok(Token { kind, span })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(s: &str) -> Vec<TokenKind> {
        tokenize(s).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators() {
        assert_eq!(
            kinds("a!=1&b>=2|c<=3"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Ne,
                TokenKind::Number("1".into()),
                TokenKind::Amp,
                TokenKind::Ident("b".into()),
                TokenKind::Ge,
                TokenKind::Number("2".into()),
                TokenKind::Pipe,
                TokenKind::Ident("c".into()),
                TokenKind::Le,
                TokenKind::Number("3".into()),
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("1.5e3"), vec![TokenKind::Number("1.5e3".into())]);
        assert_eq!(kinds("2E-7"), vec![TokenKind::Number("2E-7".into())]);
        assert_eq!(
            kinds("5.lower"),
            vec![
                TokenKind::Number("5".into()),
                TokenKind::Dot,
                TokenKind::Ident("lower".into())
            ]
        );
        assert_eq!(
            kinds("1e"),
            vec![TokenKind::Number("1".into()), TokenKind::Ident("e".into())]
        );
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n" 'cA'"#),
            vec![TokenKind::Str("a\"b\n".into()), TokenKind::Str("cA".into())]
        );
    }

    #[test]
    fn multilingual_identifier() {
        assert_eq!(kinds("title@lt"), vec![TokenKind::Ident("title@lt".into())]);
    }

    #[test]
    fn spans_are_byte_ranges() {
        let tokens = tokenize("miestas=\"Šiauliai\" & x").unwrap();
        let offsets: Vec<usize> = tokens.iter().map(Token::offset).collect();
        assert_eq!(offsets, vec![0, 7, 8, 20, 22]);
        assert_eq!(tokens[2].span, 8..19);
    }

    #[test]
    fn blank_input_has_no_tokens() {
        assert!(tokenize("").unwrap().is_empty());
        assert!(tokenize("  \t").unwrap().is_empty());
    }

    #[test]
    fn errors_carry_offsets() {
        assert_eq!(tokenize("a = #").unwrap_err().offset(), 4);
        assert_eq!(tokenize("x = \"abc").unwrap_err().offset(), 4);
        assert!(matches!(
            tokenize(r#""\q""#),
            Err(ExprError::InvalidEscape { offset: 1 })
        ));
        assert!(matches!(
            tokenize(r#"'ab\u12'"#),
            Err(ExprError::InvalidEscape { offset: 3 })
        ));
        assert!(matches!(
            tokenize("'ab\\"),
            Err(ExprError::UnterminatedString { offset: 0 })
        ));
    }
}
