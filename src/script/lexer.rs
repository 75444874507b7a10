//! Tokenizer for guest source, including indentation tracking.

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is",
    "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

// Longest operators first so that prefix matching picks the longest one.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", "**", "//", "==", "!=", "<=", ">=", "<<", ">>", "+=",
    "-=", "*=", "/=", "%=", "&=", "|=", "^=", "+", "-", "*", "/", "%", "&", "|", "^", "~", "<",
    ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=", "@",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    indents: Vec<usize>,
    depth: usize,
    tokens: Vec<Token>,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
        indents: vec![0],
        depth: 0,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn error<T>(&self, msg: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError::new(msg, self.line))
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(&mut self) -> Result<(), ParseError> {
        let mut line_start = true;
        loop {
            if line_start && self.depth == 0 {
                line_start = false;
                if !self.indentation()? {
                    break;
                }
            }
            let Some(c) = self.peek_at(0) else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline);
                        }
                        line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek_at(1) == Some('\r') && self.peek_at(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                '"' | '\'' => {
                    let s = self.string(false)?;
                    self.push(Tok::Str(s));
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word()?,
                _ => self.operator()?,
            }
        }
        if !self.last_is_newline() {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek_at(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Measure the indentation of a logical line and emit INDENT/DEDENT.
    /// Blank and comment-only lines are consumed. Returns false at end of input.
    fn indentation(&mut self) -> Result<bool, ParseError> {
        loop {
            let mut width = 0;
            while let Some(c) = self.peek_at(0) {
                match c {
                    ' ' => width += 1,
                    '\t' => width = (width / 8 + 1) * 8,
                    '\x0c' | '\r' => {}
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek_at(0) {
                None => return Ok(false),
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                    continue;
                }
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                Some(_) => {}
            }
            let current = *self.indents.last().unwrap_or(&0);
            if width > current {
                self.indents.push(width);
                self.push(Tok::Indent);
            } else {
                while width < *self.indents.last().unwrap_or(&0) {
                    self.indents.pop();
                    self.push(Tok::Dedent);
                }
                if width != *self.indents.last().unwrap_or(&0) {
                    return self.error("unindent does not match any outer indentation level");
                }
            }
            return Ok(true);
        }
    }

    fn word(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek_at(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        if matches!(self.peek_at(0), Some('"') | Some('\'')) {
            let lower = word.to_ascii_lowercase();
            let (raw, bytes) = match lower.as_str() {
                "r" => (true, false),
                "b" => (false, true),
                "u" => (false, false),
                "rb" | "br" => (true, true),
                "f" | "rf" | "fr" => return self.error("formatted string literals are not supported"),
                _ => return self.ident(word),
            };
            let s = self.string(raw)?;
            if bytes {
                let mut out = Vec::with_capacity(s.len());
                for c in s.chars() {
                    if (c as u32) > 0xff {
                        return self.error("bytes can only contain ASCII literal characters");
                    }
                    out.push(c as u32 as u8);
                }
                self.push(Tok::Bytes(out));
            } else {
                self.push(Tok::Str(s));
            }
            return Ok(());
        }
        self.ident(word)
    }

    fn ident(&mut self, word: String) -> Result<(), ParseError> {
        self.push(Tok::Name(word));
        Ok(())
    }

    fn number(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        if self.peek_at(0) == Some('0')
            && let Some(p) = self.peek_at(1)
            && matches!(p, 'x' | 'X' | 'o' | 'O' | 'b' | 'B')
        {
            let radix = match p.to_ascii_lowercase() {
                'x' => 16,
                'o' => 8,
                _ => 2,
            };
            self.pos += 2;
            let digits_start = self.pos;
            while let Some(c) = self.peek_at(0) {
                if c.is_digit(radix) || c == '_' {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            let digits: String = self.chars[digits_start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            return match i64::from_str_radix(&digits, radix) {
                Ok(v) => {
                    self.push(Tok::Int(v));
                    Ok(())
                }
                Err(_) => self.error("invalid integer literal"),
            };
        }

        let mut is_float = false;
        while let Some(c) = self.peek_at(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if c == 'e' || c == 'E' {
                let sign = matches!(self.peek_at(1), Some('+') | Some('-'));
                let digit_at = if sign { 2 } else { 1 };
                if !self.peek_at(digit_at).is_some_and(|d| d.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                self.pos += digit_at;
                while self.peek_at(0).is_some_and(|d| d.is_ascii_digit()) {
                    self.pos += 1;
                }
                break;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.push(Tok::Float(v)),
                Err(_) => return self.error(format!("invalid float literal '{text}'")),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => self.push(Tok::Int(v)),
                Err(_) => return self.error("integer literal too large"),
            }
        }
        Ok(())
    }

    fn string(&mut self, raw: bool) -> Result<String, ParseError> {
        let quote = self.chars[self.pos];
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut out = String::new();
        loop {
            let Some(c) = self.peek_at(0) else {
                return self.error("unterminated string literal");
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }
            if c == '\n' {
                if !triple {
                    return self.error("unterminated string literal");
                }
                self.line += 1;
            }
            if c == '\\' {
                let Some(next) = self.peek_at(1) else {
                    return self.error("unterminated string literal");
                };
                if raw {
                    out.push('\\');
                    out.push(next);
                    if next == '\n' {
                        self.line += 1;
                    }
                    self.pos += 2;
                    continue;
                }
                self.pos += 2;
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    'a' => out.push('\x07'),
                    'b' => out.push('\x08'),
                    'f' => out.push('\x0c'),
                    'v' => out.push('\x0b'),
                    '\n' => self.line += 1,
                    'x' => out.push(self.hex_escape(2)?),
                    'u' => out.push(self.hex_escape(4)?),
                    'U' => out.push(self.hex_escape(8)?),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }
            out.push(c);
            self.pos += 1;
        }
    }

    fn hex_escape(&mut self, len: usize) -> Result<char, ParseError> {
        let end = self.pos + len;
        if end > self.chars.len() {
            return self.error("truncated escape sequence");
        }
        let digits: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .map_or_else(|| self.error("invalid escape sequence"), Ok)
    }

    fn operator(&mut self) -> Result<(), ParseError> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                self.pos += len;
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.chars[self.pos];
        self.error(format!("invalid character '{c}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_indentation_tokens() {
        let t = toks("if x:\n    y = 1\nz\n");
        assert!(t.contains(&Tok::Indent));
        assert!(t.contains(&Tok::Dedent));
        assert_eq!(t.last(), Some(&Tok::Eof));
    }

    #[test]
    fn test_no_newlines_inside_brackets() {
        let t = toks("f(1,\n  2)\n");
        let newlines = t.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!t.contains(&Tok::Indent));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("0x1f")[0], Tok::Int(31));
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
        assert_eq!(toks("2.5")[0], Tok::Float(2.5));
        assert_eq!(toks("1e3")[0], Tok::Float(1000.0));
        assert_eq!(toks(".5")[0], Tok::Float(0.5));
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(toks(r#""a\nb""#)[0], Tok::Str("a\nb".into()));
        assert_eq!(toks(r#"r"a\nb""#)[0], Tok::Str("a\\nb".into()));
        assert_eq!(toks("b'hi'")[0], Tok::Bytes(b"hi".to_vec()));
        assert_eq!(toks("'''x\ny'''")[0], Tok::Str("x\ny".into()));
    }

    #[test]
    fn test_bad_dedent_is_an_error() {
        assert!(tokenize("if x:\n    a\n  b\n").is_err());
    }

    #[test]
    fn test_fstrings_rejected() {
        assert!(tokenize("f'{x}'").is_err());
    }
}
