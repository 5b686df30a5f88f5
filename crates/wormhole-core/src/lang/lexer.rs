//! Indentation-aware tokenizer.

use super::ast::Pos;
use super::SyntaxError;

pub const KEYWORDS: &[&str] = &[
    "def", "return", "if", "elif", "else", "for", "in", "while", "break", "continue", "pass",
    "import", "from", "as", "and", "or", "not", "is", "None", "True", "False", "lambda", "raise",
    "try", "except", "finally", "global", "nonlocal", "del", "with", "class", "yield", "assert",
    "async", "await",
];

/// Longest operators first so that `**=` wins over `**` and `*`.
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+",
    "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tok::Name(name) => write!(f, "name '{name}'"),
            Tok::Keyword(kw) => write!(f, "'{kw}'"),
            Tok::Int(i) => write!(f, "integer {i}"),
            Tok::Float(x) => write!(f, "number {x}"),
            Tok::Str(_) => write!(f, "string literal"),
            Tok::Op(op) => write!(f, "'{op}'"),
            Tok::Newline => write!(f, "end of line"),
            Tok::Indent => write!(f, "indent"),
            Tok::Dedent => write!(f, "dedent"),
            Tok::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub pos: Pos,
}

struct Lexer {
    chars: Vec<char>,
    i: usize,
    line: u32,
    col: u32,
    depth: usize,
    indents: Vec<String>,
    tokens: Vec<Token>,
}

/// Tokenize `source`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        i: 0,
        line: 1,
        col: 1,
        depth: 0,
        indents: vec![String::new()],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.i).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.i + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.i += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, pos: Pos, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(pos, message)
    }

    fn push(&mut self, tok: Tok, pos: Pos) {
        self.tokens.push(Token { tok, pos });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(&mut self) -> Result<(), SyntaxError> {
        let mut at_line_start = true;
        while self.i < self.chars.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if !self.indentation()? {
                    at_line_start = true;
                    continue;
                }
            }
            let Some(c) = self.peek() else { break };
            let pos = self.pos();
            match c {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    if self.bump() != Some('\n') {
                        return Err(self.error(pos, "unexpected character after line continuation"));
                    }
                }
                '\n' => {
                    self.bump();
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline, pos);
                        }
                        at_line_start = true;
                    }
                }
                '"' | '\'' => {
                    let s = self.string(false)?;
                    self.push(Tok::Str(s), pos);
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c == '_' || c.is_alphabetic() => self.word()?,
                _ => self.operator()?,
            }
        }

        let end = self.pos();
        if !self.last_is_newline() {
            self.push(Tok::Newline, end);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, end);
        }
        self.push(Tok::Eof, end);
        Ok(())
    }

    /// Handle leading whitespace of a logical line. Returns `false` when the
    /// line was blank or comment-only and has been consumed.
    fn indentation(&mut self) -> Result<bool, SyntaxError> {
        let pos = self.pos();
        let mut indent = String::new();
        while let Some(c @ (' ' | '\t')) = self.peek() {
            indent.push(c);
            self.bump();
        }
        match self.peek() {
            None => return Ok(false),
            Some('\n') | Some('#') | Some('\r') => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        self.bump();
                        break;
                    }
                    self.bump();
                }
                return Ok(false);
            }
            _ => {}
        }
        if indent.contains(' ') && indent.contains('\t') {
            return Err(self.error(pos, "inconsistent use of tabs and spaces in indentation"));
        }

        let current = self.indents.last().cloned().unwrap_or_default();
        if indent == current {
            return Ok(true);
        }
        if indent.starts_with(&current) {
            self.indents.push(indent);
            self.push(Tok::Indent, pos);
            return Ok(true);
        }
        while self
            .indents
            .last()
            .is_some_and(|level| level.len() > indent.len())
        {
            self.indents.pop();
            self.push(Tok::Dedent, pos);
        }
        if self.indents.last().map(String::as_str) != Some(indent.as_str()) {
            return Err(self.error(pos, "unindent does not match any outer indentation level"));
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn word(&mut self) -> Result<(), SyntaxError> {
        let pos = self.pos();
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let is_prefix = word.len() <= 2 && word.chars().all(|c| "rRbBfFuU".contains(c));
        if is_prefix && matches!(self.peek(), Some('"' | '\'')) {
            match word.as_str() {
                "u" | "U" => {
                    let s = self.string(false)?;
                    self.push(Tok::Str(s), pos);
                    return Ok(());
                }
                "r" | "R" => {
                    let s = self.string(true)?;
                    self.push(Tok::Str(s), pos);
                    return Ok(());
                }
                _ => {
                    return Err(self.error(pos, format!("unsupported string prefix '{word}'")));
                }
            }
        }
        let tok = match KEYWORDS.iter().copied().find(|kw| *kw == word) {
            Some(kw) => Tok::Keyword(kw),
            None => Tok::Name(word),
        };
        self.push(tok, pos);
        Ok(())
    }

    fn digits(&mut self, text: &mut String, radix: u32) {
        while let Some(c) = self.peek() {
            if c.is_digit(radix) {
                text.push(c);
                self.bump();
            } else if c == '_' && self.peek_at(1).is_some_and(|d| d.is_digit(radix)) {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let pos = self.pos();
        let mut text = String::new();

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.bump();
                self.bump();
                self.digits(&mut text, radix);
                let value = i64::from_str_radix(&text, radix)
                    .map_err(|_| self.error(pos, "invalid integer literal"))?;
                self.push(Tok::Int(value), pos);
                return Ok(());
            }
        }

        self.digits(&mut text, 10);
        let mut is_float = false;
        let fraction_follows = self
            .peek_at(1)
            .map_or(true, |c| !c.is_alphabetic() || c == 'e' || c == 'E');
        if self.peek() == Some('.') && fraction_follows {
            is_float = true;
            text.push('.');
            self.bump();
            self.digits(&mut text, 10);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = self.peek_at(1);
            let has_digits = match sign {
                Some('+' | '-') => self.peek_at(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if has_digits {
                is_float = true;
                text.push('e');
                self.bump();
                if let Some(s @ ('+' | '-')) = self.peek() {
                    text.push(s);
                    self.bump();
                }
                self.digits(&mut text, 10);
            }
        }
        if self.peek().is_some_and(|c| c == '_' || c.is_alphanumeric()) {
            return Err(self.error(pos, "invalid number literal"));
        }

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(pos, "invalid float literal"))?;
            if !value.is_finite() {
                return Err(self.error(pos, "float literal out of range"));
            }
            self.push(Tok::Float(value), pos);
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(pos, "integer literal too large"))?;
            self.push(Tok::Int(value), pos);
        }
        Ok(())
    }

    fn string(&mut self, raw: bool) -> Result<String, SyntaxError> {
        let pos = self.pos();
        let Some(quote) = self.bump() else {
            return Err(self.error(pos, "expected string"));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(pos, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    return Ok(out);
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    return Ok(out);
                }
                out.push(c);
                continue;
            }
            if c == '\n' && !triple {
                return Err(self.error(pos, "unterminated string literal"));
            }
            if c != '\\' {
                out.push(c);
                continue;
            }

            let esc_pos = self.pos();
            let Some(e) = self.bump() else {
                return Err(self.error(pos, "unterminated string literal"));
            };
            if raw {
                out.push('\\');
                out.push(e);
                continue;
            }
            match e {
                '\n' => {}
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                'x' | 'u' => {
                    let width = if e == 'x' { 2 } else { 4 };
                    let mut hex = String::new();
                    for _ in 0..width {
                        match self.bump() {
                            Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                            _ => return Err(self.error(esc_pos, "truncated escape sequence")),
                        }
                    }
                    let ch = u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.error(esc_pos, "invalid escape sequence"))?;
                    out.push(ch);
                }
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
    }

    fn operator(&mut self) -> Result<(), SyntaxError> {
        let pos = self.pos();
        let found = OPERATORS.iter().copied().find(|op| {
            op.chars()
                .enumerate()
                .all(|(k, ch)| self.peek_at(k) == Some(ch))
        });
        let Some(op) = found else {
            let c = self.peek().unwrap_or(' ');
            return Err(self.error(pos, format!("unexpected character '{c}'")));
        };
        for _ in 0..op.chars().count() {
            self.bump();
        }
        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                if self.depth == 0 {
                    return Err(self.error(pos, format!("unmatched '{op}'")));
                }
                self.depth -= 1;
            }
            _ => {}
        }
        self.push(Tok::Op(op), pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let got = toks("def f():\n    return 1\n");
        assert_eq!(
            got,
            vec![
                Tok::Keyword("def"),
                Tok::Name("f".into()),
                Tok::Op("("),
                Tok::Op(")"),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Keyword("return"),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn blank_and_comment_lines_are_ignored() {
        let got = toks("x = 1\n\n    # indented comment\ny = 2  # trailing\n");
        assert!(!got.contains(&Tok::Indent));
        assert_eq!(got.iter().filter(|t| **t == Tok::Newline).count(), 2);
    }

    #[test]
    fn brackets_join_lines() {
        let got = toks("x = [1,\n     2]\n");
        assert_eq!(got.iter().filter(|t| **t == Tok::Newline).count(), 1);
        assert!(!got.contains(&Tok::Indent));
    }

    #[test]
    fn numbers_and_strings() {
        let got = toks("a = 1_000 + 2.5e3 + 0x1f + .5\nb = 'it\\'s' + \"\"\"x\ny\"\"\" + r'\\d+'\n");
        assert!(got.contains(&Tok::Int(1000)));
        assert!(got.contains(&Tok::Float(2500.0)));
        assert!(got.contains(&Tok::Int(31)));
        assert!(got.contains(&Tok::Float(0.5)));
        assert!(got.contains(&Tok::Str("it's".into())));
        assert!(got.contains(&Tok::Str("x\ny".into())));
        assert!(got.contains(&Tok::Str("\\d+".into())));
    }

    #[test]
    fn lexical_errors_carry_position() {
        let err = tokenize("x = 'open\n").unwrap_err();
        assert_eq!((err.line, err.col), (1, 5));
        assert!(err.message.contains("unterminated"));

        let err = tokenize("def f():\n        x = 1\n    y = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));

        let err = tokenize("x = 1 $ 2\n").unwrap_err();
        assert!(err.message.contains("unexpected character"));

        let err = tokenize("x = 99999999999999999999\n").unwrap_err();
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn mixed_tabs_and_spaces_rejected() {
        let err = tokenize("if x:\n \tpass\n").unwrap_err();
        assert!(err.message.contains("tabs and spaces"));
    }
}
