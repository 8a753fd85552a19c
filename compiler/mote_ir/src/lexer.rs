//! Tokenizer for the textual IR.
//!
//! `RawToken` is the logos-derived output; [`lex`] converts it into owned
//! [`Token`]s with unquoted names and unescaped strings.

use logos::Logos;

use crate::parse::ParseError;

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"([ \t\r\n\f]+|;[^\n]*)")]
enum RawToken {
    #[token("=")]
    Eq,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("!")]
    Bang,

    #[regex(r"%[-A-Za-z0-9_.$]+")]
    Local,
    #[regex(r#"%"[^"\n]*""#)]
    QuotedLocal,
    #[regex(r"@[-A-Za-z0-9_.$]+")]
    Global,
    #[regex(r#"@"[^"\n]*""#)]
    QuotedGlobal,

    #[regex(r"-?[0-9]+")]
    Int,

    #[regex(r#""([^"\\\n]|\\.)*""#)]
    Str,

    // Block label: `name:`
    #[regex(r"[-A-Za-z0-9_.$]+:")]
    Label,

    // Keywords, opcodes, type names and method names
    #[regex(r"[A-Za-z_][A-Za-z0-9_.$]*")]
    Word,
}

/// A lexed token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Eq,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Bang,
    /// `%name`, sigil stripped.
    Local(String),
    /// `@name`, sigil stripped.
    Global(String),
    Int(i64),
    Str(String),
    Label(String),
    Word(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Eq => f.write_str("'='"),
            Token::Comma => f.write_str("','"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::LBrace => f.write_str("'{'"),
            Token::RBrace => f.write_str("'}'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Bang => f.write_str("'!'"),
            Token::Local(name) => write!(f, "'%{name}'"),
            Token::Global(name) => write!(f, "'@{name}'"),
            Token::Int(n) => write!(f, "'{n}'"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Label(name) => write!(f, "label '{name}:'"),
            Token::Word(word) => write!(f, "'{word}'"),
        }
    }
}

/// A token with its byte range in the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Lex `source` into tokens. Stops at the first unrecognized character.
pub fn lex(source: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut out = Vec::new();
    let mut logos = RawToken::lexer(source);

    while let Some(result) = logos.next() {
        let span = logos.span();
        let slice = logos.slice();
        let Ok(raw) = result else {
            return Err(ParseError::at(
                source,
                span.start,
                format!("unexpected character sequence `{slice}`"),
            ));
        };
        let token = match raw {
            RawToken::Eq => Token::Eq,
            RawToken::Comma => Token::Comma,
            RawToken::LParen => Token::LParen,
            RawToken::RParen => Token::RParen,
            RawToken::LBrace => Token::LBrace,
            RawToken::RBrace => Token::RBrace,
            RawToken::LBracket => Token::LBracket,
            RawToken::RBracket => Token::RBracket,
            RawToken::Bang => Token::Bang,
            RawToken::Local => Token::Local(slice[1..].to_owned()),
            RawToken::QuotedLocal => Token::Local(slice[2..slice.len() - 1].to_owned()),
            RawToken::Global => Token::Global(slice[1..].to_owned()),
            RawToken::QuotedGlobal => Token::Global(slice[2..slice.len() - 1].to_owned()),
            RawToken::Int => match slice.parse::<i64>() {
                Ok(n) => Token::Int(n),
                Err(_) => {
                    return Err(ParseError::at(
                        source,
                        span.start,
                        format!("integer literal `{slice}` out of range"),
                    ))
                }
            },
            RawToken::Str => Token::Str(unescape(&slice[1..slice.len() - 1])),
            RawToken::Label => Token::Label(slice[..slice.len() - 1].to_owned()),
            RawToken::Word => Token::Word(slice.to_owned()),
        };
        out.push(Spanned {
            token,
            start: span.start,
            end: span.end,
        });
    }

    Ok(out)
}

fn unescape(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
