//! Lexical analysis of assembly source.
//!
//! The lexer has no failing path: whitespace and `;` comments disappear,
//! anything it cannot classify comes out as [Token::Other]. End of input is
//! the end of the token iterator.

use logos::{Lexer, Logos};

pub type Span = std::ops::Range<usize>;

/// One lexical token. Identifiers and numbers borrow their text from the
/// source; string literals own theirs because escape processing rewrites
/// them.
#[derive(Logos, Debug, Clone, PartialEq)]
pub enum Token<'a> {
    /// A byte the lexer could not classify. Also the logos error variant,
    /// so illegal input degrades to `Other` tokens instead of failing.
    #[error]
    #[regex(r"[ \t\r\f]+", logos::skip)]
    #[regex(r";[^\n]*", logos::skip)]
    Other,

    #[token("\n")]
    Newline,

    /// Identifier. `.` and `@` are identifier-start characters in this
    /// dialect, which is how `.text`-style directive names arrive.
    #[regex(r"[A-Za-z_.@][A-Za-z0-9_.@$]*", Lexer::slice)]
    Ident(&'a str),

    /// Number literal, consumed greedily over hex digits and the radix
    /// marker characters; interpretation happens in the parser.
    #[regex(r"[0-9][0-9a-fA-Fxboh.]*", Lexer::slice)]
    Number(&'a str),

    /// String literal in double or single quotes. A backslash escapes the
    /// next character verbatim.
    #[regex(r#""([^"\\\n]|\\.)*""#, unescape)]
    #[regex(r"'([^'\\\n]|\\.)*'", unescape)]
    Str(String),

    #[token(":")]
    Colon,

    #[token(",")]
    Comma,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("/")]
    Slash,

    #[token("%")]
    Percent,

    #[token("#")]
    Hash,
}

fn unescape<'a>(lex: &mut Lexer<'a, Token<'a>>) -> String {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
            continue;
        }
        out.push(c);
    }

    out
}

impl<'a> Token<'a> {
    /// The literal text of the token, used when a directive records the raw
    /// rest of its line.
    pub fn literal(&self) -> String {
        match self {
            Token::Other => String::new(),
            Token::Newline => "\n".to_string(),
            Token::Ident(s) => (*s).to_string(),
            Token::Number(s) => (*s).to_string(),
            Token::Str(s) => s.clone(),
            Token::Colon => ":".to_string(),
            Token::Comma => ",".to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Percent => "%".to_string(),
            Token::Hash => "#".to_string(),
        }
    }
}

impl<'a> std::fmt::Display for Token<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Token::Other => write!(f, "OTHER"),
            Token::Newline => write!(f, "NEWLINE"),
            Token::Ident(s) => write!(f, "identifier '{}'", s),
            Token::Number(s) => write!(f, "number '{}'", s),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            other => write!(f, "'{}'", other.literal()),
        }
    }
}

/// Maps byte offsets back to 1-based line/column pairs.
///
/// Tokens carry byte spans; positions are only materialized for AST nodes
/// and diagnostics.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> LineIndex {
        let mut line_starts = vec![0];

        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }

        LineIndex { line_starts }
    }

    /// Returns the 1-based (line, column) of a byte offset.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };

        (line + 1, offset - self.line_starts[line] + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Token::lexer(input).collect()
    }

    #[test]
    fn punctuation_and_idents() {
        assert_eq!(
            lex("foo: mov rax, 1"),
            vec![
                Token::Ident("foo"),
                Token::Colon,
                Token::Ident("mov"),
                Token::Ident("rax"),
                Token::Comma,
                Token::Number("1"),
            ]
        );
    }

    #[test]
    fn comments_are_skipped_but_newline_survives() {
        assert_eq!(
            lex("nop ; does nothing\nret"),
            vec![Token::Ident("nop"), Token::Newline, Token::Ident("ret")]
        );
    }

    #[test]
    fn dot_starts_an_identifier() {
        assert_eq!(lex(".text"), vec![Token::Ident(".text")]);
    }

    #[test]
    fn number_literal_forms() {
        assert_eq!(
            lex("10 0x1F 0b101 777o 0FFh"),
            vec![
                Token::Number("10"),
                Token::Number("0x1F"),
                Token::Number("0b101"),
                Token::Number("777o"),
                Token::Number("0FFh"),
            ]
        );
    }

    #[test]
    fn string_escapes_are_verbatim() {
        assert_eq!(
            lex(r#""a\"b" 'c\\d'"#),
            vec![
                Token::Str("a\"b".to_string()),
                Token::Str("c\\d".to_string()),
            ]
        );
    }

    #[test]
    fn illegal_bytes_become_other() {
        assert_eq!(lex("&"), vec![Token::Other]);
    }

    #[test]
    fn line_index_maps_offsets() {
        let idx = LineIndex::new("ab\ncd\n");

        assert_eq!(idx.line_col(0), (1, 1));
        assert_eq!(idx.line_col(1), (1, 2));
        assert_eq!(idx.line_col(3), (2, 1));
        assert_eq!(idx.line_col(4), (2, 2));
    }
}
