//! Directive file parser.
//!
//! The command language is a sequence of directives. A directive is a
//! name followed by parameters and ends either with `;` (instruction) or
//! with a `{ ... }` block of nested directives:
//!
//! ```text
//! # comment
//! http {
//!     http_listen 127.0.0.1 8080 128;
//!     http_backend 10.0.0.1 80;
//! }
//! ```
//!
//! Parsing is purely syntactic. Which names exist, and whether they are
//! blocks or instructions, is decided by the plugin host.

use std::iter::Peekable;
use std::vec::IntoIter;

/// One parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub params: Vec<String>,
    /// 1-based line of the directive name.
    pub line: usize,
    /// Nested directives for block syntax, `None` for `;`-terminated ones.
    pub children: Option<Vec<Directive>>,
}

impl Directive {
    pub fn is_block(&self) -> bool {
        self.children.is_some()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct DirectiveError {
    pub line: usize,
    pub message: String,
}

impl DirectiveError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Open,
    Close,
    Semi,
}

/// Parse a directive file.
pub fn parse_directives(source: &str) -> Result<Vec<Directive>, DirectiveError> {
    let mut tokens = tokenize(source)?.into_iter().peekable();
    parse_block(&mut tokens, None)
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, DirectiveError> {
    let mut tokens = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let mut chars = raw.chars().peekable();
        let mut word = String::new();

        while let Some(c) = chars.next() {
            match c {
                '#' => break,
                '{' | '}' | ';' => {
                    flush(&mut word, &mut tokens, line);
                    let token = match c {
                        '{' => Token::Open,
                        '}' => Token::Close,
                        _ => Token::Semi,
                    };
                    tokens.push((token, line));
                }
                '"' => {
                    flush(&mut word, &mut tokens, line);
                    let mut quoted = String::new();
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some(c) => quoted.push(c),
                            None => return Err(DirectiveError::new(line, "unterminated quoted string")),
                        }
                    }
                    tokens.push((Token::Word(quoted), line));
                }
                c if c.is_whitespace() => flush(&mut word, &mut tokens, line),
                c => word.push(c),
            }
        }
        flush(&mut word, &mut tokens, line);
    }

    Ok(tokens)
}

fn flush(word: &mut String, tokens: &mut Vec<(Token, usize)>, line: usize) {
    if !word.is_empty() {
        tokens.push((Token::Word(std::mem::take(word)), line));
    }
}

/// Parse directives until the matching `}` (or end of input at top level).
fn parse_block(
    tokens: &mut Peekable<IntoIter<(Token, usize)>>,
    opened_at: Option<usize>,
) -> Result<Vec<Directive>, DirectiveError> {
    let mut directives = Vec::new();

    loop {
        let (name, line) = match tokens.next() {
            None => {
                return match opened_at {
                    Some(line) => Err(DirectiveError::new(line, "block is never closed")),
                    None => Ok(directives),
                };
            }
            Some((Token::Close, line)) => {
                return match opened_at {
                    Some(_) => Ok(directives),
                    None => Err(DirectiveError::new(line, "unexpected `}`")),
                };
            }
            Some((Token::Semi, line)) => return Err(DirectiveError::new(line, "empty directive")),
            Some((Token::Open, line)) => return Err(DirectiveError::new(line, "block has no name")),
            Some((Token::Word(name), line)) => (name, line),
        };

        let mut params = Vec::new();
        loop {
            match tokens.next() {
                Some((Token::Word(param), _)) => params.push(param),
                Some((Token::Semi, _)) => {
                    directives.push(Directive {
                        name,
                        params,
                        line,
                        children: None,
                    });
                    break;
                }
                Some((Token::Open, open_line)) => {
                    let children = parse_block(tokens, Some(open_line))?;
                    directives.push(Directive {
                        name,
                        params,
                        line,
                        children: Some(children),
                    });
                    break;
                }
                Some((Token::Close, _)) | None => {
                    return Err(DirectiveError::new(line, format!("missing `;` after `{name}`")));
                }
            }
        }
    }
}
