//! Condition tokenizer

use eddievent::{Value, parse_value};

use super::ast::{BinOp, CmpOp, Reference};
use super::error::{FilterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpKind {
    Op(CmpOp),
    Match,
    NotMatch,
}

#[derive(Debug, Clone)]
pub(crate) enum Token {
    Not,
    LParen,
    RParen,
    Bin(BinOp),
    Ref(Reference),
    Cmp { kind: CmpKind, case_sensitive: bool },
    Literal(Value),
    Default,
    Prev,
    Last,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
}

/// Split a condition into tokens
pub(crate) fn tokenize(src: &str, line: usize) -> Result<Vec<Token>> {
    let mut lexer = Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
        line,
    };
    let mut tokens = Vec::new();
    loop {
        lexer.skip_ws();
        let Some(c) = lexer.peek() else {
            return Ok(tokens);
        };
        let token = match tokens.last() {
            Some(Token::Cmp { kind, .. }) => lexer.literal(matches!(kind, CmpKind::Match | CmpKind::NotMatch))?,
            _ => lexer.token(c)?,
        };
        tokens.push(token);
    }
}

/// Parse a literal outside a condition (action values)
pub(crate) fn literal_value(src: &str, line: usize) -> Result<Value> {
    let src = src.trim();
    if src.starts_with('"') || src.starts_with('&') {
        return parse_value(src).map_err(|e| FilterError::syntax(line, format!("bad value {}: {}", src, e)));
    }
    Ok(bare_value(src))
}

fn bare_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if raw.bytes().any(|c| c.is_ascii_digit())
        && let Ok(f) = raw.parse::<f64>()
    {
        return Value::Float(f);
    }
    Value::str(raw)
}

impl Lexer<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn fail(&self, message: impl Into<String>) -> FilterError {
        FilterError::syntax(self.line, format!("column {}: {}", self.pos + 1, message.into()))
    }

    fn token(&mut self, c: u8) -> Result<Token> {
        let next = self.peek_at(1);
        let (token, len) = match (c, next) {
            (b'(', _) => (Token::LParen, 1),
            (b')', _) => (Token::RParen, 1),
            (b'&', Some(b'&')) => (Token::Bin(BinOp::And), 2),
            (b'|', Some(b'|')) => (Token::Bin(BinOp::Or), 2),
            (b'^', Some(b'^')) => (Token::Bin(BinOp::Xor), 2),
            (b'^', _) => {
                self.pos += 1;
                return self.comparison(true);
            }
            (b'!', Some(b'=' | b'#')) | (b'=' | b'>' | b'<' | b'#', _) => return self.comparison(false),
            (b'!', _) => (Token::Not, 1),
            (c, _) if c.is_ascii_alphabetic() => return self.word(),
            _ => return Err(self.fail(format!("unexpected '{}'", char::from(c)))),
        };
        self.pos += len;
        Ok(token)
    }

    fn comparison(&mut self, case_sensitive: bool) -> Result<Token> {
        let (kind, len) = match (self.peek(), self.peek_at(1)) {
            (Some(b'='), Some(b'=')) => (CmpKind::Op(CmpOp::Eq), 2),
            (Some(b'!'), Some(b'=')) => (CmpKind::Op(CmpOp::Ne), 2),
            (Some(b'>'), Some(b'=')) => (CmpKind::Op(CmpOp::Ge), 2),
            (Some(b'<'), Some(b'=')) => (CmpKind::Op(CmpOp::Le), 2),
            (Some(b'!'), Some(b'#')) => (CmpKind::NotMatch, 2),
            (Some(b'>'), _) => (CmpKind::Op(CmpOp::Gt), 1),
            (Some(b'<'), _) => (CmpKind::Op(CmpOp::Lt), 1),
            (Some(b'#'), _) => (CmpKind::Match, 1),
            _ => return Err(self.fail("expected a comparison operator")),
        };
        self.pos += len;
        Ok(Token::Cmp { kind, case_sensitive })
    }

    fn ident(&mut self) -> &str {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'/' | b'.'))
        {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn word(&mut self) -> Result<Token> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        let word = self.src[start..self.pos].to_ascii_lowercase();
        match word.as_str() {
            "name" => Ok(Token::Ref(Reference::Name)),
            "arg" => {
                let idx = if self.peek() == Some(b'[') {
                    self.pos += 1;
                    let idx = self.number()?;
                    self.expect(b']')?;
                    idx as usize
                } else {
                    0
                };
                Ok(Token::Ref(Reference::Arg(idx)))
            }
            "attr" => {
                self.expect(b'{')?;
                let key = self.ident().to_string();
                if key.is_empty() {
                    return Err(self.fail("empty attribute key"));
                }
                self.expect(b'}')?;
                Ok(Token::Ref(Reference::Attr(key)))
            }
            "var" => self.var_ref().map(Token::Ref),
            "default" => Ok(Token::Default),
            "prev" => Ok(Token::Prev),
            "last" => Ok(Token::Last),
            _ => Err(FilterError::syntax(self.line, format!("unknown reference '{}'", word))),
        }
    }

    /// `{name[.idx1][[idx2]]}`
    fn var_ref(&mut self) -> Result<Reference> {
        self.expect(b'{')?;
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-'))
        {
            self.pos += 1;
        }
        let name = self.src[start..self.pos].to_string();
        if name.is_empty() {
            return Err(self.fail("empty variable name"));
        }
        let idx1 = if self.peek() == Some(b'.') {
            self.pos += 1;
            Some(self.number()?)
        } else {
            None
        };
        let idx2 = if self.peek() == Some(b'[') {
            self.pos += 1;
            let idx = self.number()?;
            self.expect(b']')?;
            Some(idx)
        } else {
            None
        };
        self.expect(b'}')?;
        Ok(Reference::Var { name, idx1, idx2 })
    }

    fn number(&mut self) -> Result<u32> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.fail("expected an index"))
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(format!("expected '{}'", char::from(c))))
        }
    }

    fn at_operator(&self) -> bool {
        matches!(
            (self.peek(), self.peek_at(1)),
            (Some(b'&'), Some(b'&')) | (Some(b'|'), Some(b'|')) | (Some(b'^'), Some(b'^'))
        )
    }

    /// Literal after a comparison; regex patterns keep their backslashes
    fn literal(&mut self, pattern: bool) -> Result<Token> {
        let start = self.pos;
        if self.peek() == Some(b'"') {
            self.pos += 1;
            loop {
                match self.peek() {
                    None => return Err(self.fail("unterminated string")),
                    Some(b'\\') => self.pos += 2,
                    Some(b'"') => break,
                    Some(_) => self.pos += 1,
                }
            }
            self.pos += 1;
            let quoted = &self.src[start..self.pos];
            if pattern {
                let inner = &quoted[1..quoted.len() - 1];
                return Ok(Token::Literal(Value::str(&inner.replace("\\\"", "\""))));
            }
            return parse_value(quoted)
                .map(Token::Literal)
                .map_err(|e| self.fail(format!("bad string literal: {}", e)));
        }

        while self
            .peek()
            .is_some_and(|c| !c.is_ascii_whitespace() && c != b')')
            && !self.at_operator()
        {
            self.pos += 1;
        }
        let raw = &self.src[start..self.pos];
        if raw.is_empty() {
            return Err(self.fail("missing value after comparison"));
        }
        if pattern {
            return Ok(Token::Literal(Value::str(raw)));
        }
        literal_value(raw, self.line).map(Token::Literal)
    }
}
