//! Minimal S-expression reader and writer.
//!
//! Grammar: `expr := atom | "quoted" | ( expr* )`. Quoted strings support
//! `\"` and `\\`. Anything that is not whitespace, a paren or a quote is atom
//! text.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Atom(String),
    Quoted(String),
    List(Vec<Expr>),
}

impl Expr {
    /// Text as an atom when it reads back as the same text, quoted otherwise.
    pub fn text(value: &str) -> Self {
        if needs_quotes(value) {
            Expr::Quoted(value.to_string())
        } else {
            Expr::Atom(value.to_string())
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Expr::Atom(text) | Expr::Quoted(text) => Some(text),
            Expr::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Expr]> {
        match self {
            Expr::List(items) => Some(items),
            _ => None,
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || c == '(' || c == ')' || c == '"'
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty() || value.chars().any(|c| is_delimiter(c) || c == '\\')
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Atom(text) => f.write_str(text),
            Expr::Quoted(text) => {
                f.write_str("\"")?;
                for c in text.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
            Expr::List(items) => {
                f.write_str("(")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Parses exactly one expression; surrounding whitespace is ignored.
pub fn parse(input: &str) -> Result<Expr> {
    let mut chars = input.chars().peekable();
    let expr = parse_expr(&mut chars)?;
    skip_whitespace(&mut chars);
    if let Some(c) = chars.next() {
        return Err(Error::Codec(format!("trailing input at {c:?}")));
    }
    Ok(expr)
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
}

fn parse_expr(chars: &mut Peekable<Chars<'_>>) -> Result<Expr> {
    skip_whitespace(chars);
    match chars.next() {
        None => Err(Error::Codec("unexpected end of input".to_string())),
        Some(')') => Err(Error::Codec("unbalanced ')'".to_string())),
        Some('(') => {
            let mut items = Vec::new();
            loop {
                skip_whitespace(chars);
                match chars.peek() {
                    None => return Err(Error::Codec("unterminated list".to_string())),
                    Some(')') => {
                        chars.next();
                        return Ok(Expr::List(items));
                    }
                    Some(_) => items.push(parse_expr(chars)?),
                }
            }
        }
        Some('"') => {
            let mut text = String::new();
            loop {
                match chars.next() {
                    None => return Err(Error::Codec("unterminated string".to_string())),
                    Some('"') => return Ok(Expr::Quoted(text)),
                    Some('\\') => match chars.next() {
                        Some(c @ ('"' | '\\')) => text.push(c),
                        Some(c) => {
                            return Err(Error::Codec(format!("unknown escape \\{c}")));
                        }
                        None => return Err(Error::Codec("unterminated string".to_string())),
                    },
                    Some(c) => text.push(c),
                }
            }
        }
        Some(first) => {
            let mut text = String::from(first);
            while let Some(c) = chars.next_if(|c| !is_delimiter(*c)) {
                text.push(c);
            }
            Ok(Expr::Atom(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(text: &str) -> Expr {
        Expr::Atom(text.to_string())
    }

    #[test]
    fn parses_nested_lists() {
        let expr = parse(" (share topic/in 300 (a b.c)) ").unwrap();
        assert_eq!(
            expr,
            Expr::List(vec![
                atom("share"),
                atom("topic/in"),
                atom("300"),
                Expr::List(vec![atom("a"), atom("b.c")]),
            ])
        );
    }

    #[test]
    fn quoted_strings_round_trip_escapes() {
        let expr = Expr::List(vec![atom("update"), Expr::text("say \"hi\" \\ (x)")]);
        let wire = expr.to_string();
        assert_eq!(wire, r#"(update "say \"hi\" \\ (x)")"#);
        assert_eq!(parse(&wire).unwrap(), expr);
    }

    #[test]
    fn empty_text_is_quoted() {
        assert_eq!(Expr::text("").to_string(), "\"\"");
        assert_eq!(Expr::text("plain").to_string(), "plain");
    }

    #[test]
    fn malformed_input_rejected() {
        for bad in ["", "(a", "a)", "(a))", "\"open", "(a \"\\n\")", "a b"] {
            assert!(
                matches!(parse(bad), Err(Error::Codec(_))),
                "{bad:?} should fail"
            );
        }
    }
}
