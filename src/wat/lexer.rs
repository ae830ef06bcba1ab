//! Tokenizer for the wasm text format subset.
//!
//! Produces parens, atoms and byte strings with source positions. `;;`
//! line comments and `(; ... ;)` block comments are whitespace.

use crate::error::{Error, Result};

/// A source position within the text being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    /// 1-based line.
    pub line: usize,
    /// 0-based column.
    pub col: usize,
}

impl Pos {
    pub(crate) fn err(self, message: impl Into<String>) -> Error {
        Error::parse(self.line, self.col, message)
    }
}

/// One token of wasm text.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// A bare word: keyword, `$identifier`, number, `offset=8`, ...
    Atom(String),
    /// A quoted string, already unescaped to bytes.
    Str(Vec<u8>),
}

/// The lexer: source bytes in, `(Pos, Token)` pairs out.
pub struct Lexer<'a> {
    buf: &'a [u8],
    offset: usize,
    pos: Pos,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `text`.
    pub fn new(text: &'a str) -> Lexer<'a> {
        Lexer {
            buf: text.as_bytes(),
            offset: 0,
            pos: Pos { line: 1, col: 0 },
        }
    }

    /// Tokenize the whole input.
    pub fn tokenize(mut self) -> Result<Vec<(Pos, Token)>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.buf.get(self.offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.peek_byte()?;
        self.offset += 1;
        if byte == b'\n' {
            self.pos.line += 1;
            self.pos.col = 0;
        } else {
            self.pos.col += 1;
        }
        Some(byte)
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b';') if self.buf.get(self.offset + 1) == Some(&b';') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(b'(') if self.buf.get(self.offset + 1) == Some(&b';') => {
                    let start = self.pos;
                    self.advance();
                    self.advance();
                    loop {
                        match self.advance() {
                            Some(b';') if self.peek_byte() == Some(b')') => {
                                self.advance();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(start.err("unterminated block comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<(Pos, Token)>> {
        self.skip_trivia()?;
        let start = self.pos;
        let byte = match self.peek_byte() {
            Some(byte) => byte,
            None => return Ok(None),
        };
        match byte {
            b'(' => {
                self.advance();
                Ok(Some((start, Token::LParen)))
            }
            b')' => {
                self.advance();
                Ok(Some((start, Token::RParen)))
            }
            b'"' => {
                self.advance();
                let bytes = self.lex_string(start)?;
                Ok(Some((start, Token::Str(bytes))))
            }
            _ => {
                let mut atom = String::new();
                while let Some(b) = self.peek_byte() {
                    if b.is_ascii_whitespace() || b == b'(' || b == b')' || b == b'"' || b == b';' {
                        break;
                    }
                    atom.push(b as char);
                    self.advance();
                }
                if atom.is_empty() {
                    return Err(start.err(format!("unexpected character `{}`", byte as char)));
                }
                Ok(Some((start, Token::Atom(atom))))
            }
        }
    }

    fn lex_string(&mut self, start: Pos) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        loop {
            let byte = self
                .advance()
                .ok_or_else(|| start.err("unterminated string"))?;
            match byte {
                b'"' => return Ok(bytes),
                b'\\' => {
                    let escape = self
                        .advance()
                        .ok_or_else(|| start.err("unterminated escape"))?;
                    match escape {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'"' => bytes.push(b'"'),
                        b'\'' => bytes.push(b'\''),
                        b'\\' => bytes.push(b'\\'),
                        hi if hi.is_ascii_hexdigit() => {
                            let lo = self
                                .advance()
                                .ok_or_else(|| start.err("unterminated hex escape"))?;
                            if !lo.is_ascii_hexdigit() {
                                return Err(start.err("bad hex escape in string"));
                            }
                            let hex = [hi, lo];
                            let hex = std::str::from_utf8(&hex).unwrap();
                            bytes.push(u8::from_str_radix(hex, 16).unwrap());
                        }
                        other => {
                            return Err(
                                start.err(format!("unknown string escape `\\{}`", other as char))
                            );
                        }
                    }
                }
                other => bytes.push(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atoms(text: &str) -> Vec<Token> {
        Lexer::new(text)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|(_, t)| t)
            .collect()
    }

    #[test]
    fn basic_tokens() {
        assert_eq!(
            atoms("(func $f (result i32))"),
            vec![
                Token::LParen,
                Token::Atom("func".to_string()),
                Token::Atom("$f".to_string()),
                Token::LParen,
                Token::Atom("result".to_string()),
                Token::Atom("i32".to_string()),
                Token::RParen,
                Token::RParen,
            ],
        );
    }

    #[test]
    fn comments_are_whitespace() {
        assert_eq!(
            atoms("a ;; trailing\nb (;5;) c"),
            vec![
                Token::Atom("a".to_string()),
                Token::Atom("b".to_string()),
                Token::Atom("c".to_string()),
            ],
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            atoms(r#""h\69\\\"!""#),
            vec![Token::Str(b"hi\\\"!".to_vec())],
        );
    }

    #[test]
    fn offset_pseudo_op_splits_cleanly() {
        assert_eq!(
            atoms("i32.const offset($d)"),
            vec![
                Token::Atom("i32.const".to_string()),
                Token::Atom("offset".to_string()),
                Token::LParen,
                Token::Atom("$d".to_string()),
                Token::RParen,
            ],
        );
    }

    #[test]
    fn positions_track_lines() {
        let tokens = Lexer::new("a\n  b").tokenize().unwrap();
        assert_eq!(tokens[0].0, Pos { line: 1, col: 0 });
        assert_eq!(tokens[1].0, Pos { line: 2, col: 2 });
    }
}
