//! Wire text to event
//!
//! The parser works on a shared buffer and slices it for every name, key and
//! unescaped string, so a parsed event holds references into the input rather
//! than per-field copies. Only names that need case folding and strings that
//! contain escapes get buffers of their own.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::trace;

use crate::error::{EventError, Result};
use crate::event::{Event, Target};
use crate::name::{is_valid_key, normalize_name};
use crate::quote::{hex_digit, unescape};
use crate::text::Text;
use crate::value::Value;

/// Which bytes end a bare field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// Names and positional arguments
    Colon,
    /// Attribute and variable values
    Attr,
    /// A standalone token
    End,
}

impl Terminator {
    fn matches(self, c: u8) -> bool {
        match self {
            Terminator::Colon => c == b':',
            Terminator::Attr => c == b',' || c == b'}',
            Terminator::End => false,
        }
    }
}

struct Parser<'a> {
    buf: &'a Arc<str>,
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(buf: &'a Arc<str>) -> Self {
        Self {
            buf,
            src: buf.as_bytes(),
            pos: 0,
        }
    }

    fn fail(&self, reason: &'static str) -> EventError {
        EventError::InvalidFormat { pos: self.pos, reason }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c == b' ' || c == b'\t') {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: u8, reason: &'static str) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(reason))
        }
    }

    fn slice(&self, start: usize, end: usize) -> Result<Text> {
        Text::slice(self.buf, start, end).ok_or(EventError::InvalidFormat {
            pos: start,
            reason: "field splits a UTF-8 sequence",
        })
    }

    /// Advance to the next terminator byte, returning the raw field range
    fn scan_bare(&mut self, term: Terminator) -> (usize, usize) {
        let start = self.pos;
        while self.peek().is_some_and(|c| !term.matches(c)) {
            self.pos += 1;
        }
        let mut end = self.pos;
        while end > start && matches!(self.src[end - 1], b' ' | b'\t') {
            end -= 1;
        }
        (start, end)
    }

    /// A name terminated by `:`
    fn name_field(&mut self) -> Result<Text> {
        self.skip_ws();
        let (start, end) = self.scan_bare(Terminator::Colon);
        self.expect(b':', "missing ':' after name")?;
        let raw = self.slice(start, end)?;
        match normalize_name(&raw)? {
            Cow::Borrowed(_) => Ok(raw),
            Cow::Owned(folded) => Ok(Text::from(folded)),
        }
    }

    /// `(value ":")* ":"`
    fn arg_list(&mut self) -> Result<Vec<Value>> {
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b':') {
                self.pos += 1;
                return Ok(args);
            }
            if self.peek().is_none() {
                return Err(self.fail("unterminated argument list"));
            }
            args.push(self.value(Terminator::Colon)?);
            self.expect(b':', "missing ':' after argument")?;
        }
    }

    fn value(&mut self, term: Terminator) -> Result<Value> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(b'&') => self.prefixed(term),
            _ => {
                let (start, end) = self.scan_bare(term);
                Ok(Value::Str(self.slice(start, end)?))
            }
        }
    }

    fn quoted(&mut self) -> Result<Value> {
        let open = self.pos;
        self.pos += 1;
        let start = self.pos;
        let mut escaped = false;
        loop {
            match self.peek() {
                None => {
                    return Err(EventError::InvalidFormat {
                        pos: open,
                        reason: "unterminated string",
                    });
                }
                Some(b'\\') => {
                    escaped = true;
                    self.pos += 2;
                }
                Some(b'"') => break,
                Some(_) => self.pos += 1,
            }
        }
        let end = self.pos;
        self.pos += 1;
        self.skip_ws();

        let text = self.slice(start, end)?;
        if !escaped {
            return Ok(Value::Str(text));
        }
        match unescape(&text) {
            Ok(s) => Ok(Value::Str(Text::from(s))),
            Err((offset, reason)) => Err(EventError::InvalidFormat {
                pos: start + offset,
                reason,
            }),
        }
    }

    fn prefixed(&mut self, term: Terminator) -> Result<Value> {
        let at = self.pos;
        self.pos += 1;
        let Some(kind) = self.peek() else {
            return Err(self.fail("truncated '&' value"));
        };
        self.pos += 1;

        if kind == b's' {
            let start = self.pos;
            while self.peek().is_some_and(|c| !term.matches(c)) {
                self.pos += 1;
            }
            return Ok(Value::Str(self.slice(start, self.pos)?));
        }

        let nano = kind == b'n';
        let kind = if nano {
            let Some(k) = self.peek() else {
                return Err(self.fail("truncated '&n' value"));
            };
            self.pos += 1;
            k
        } else {
            kind
        };

        let (start, end) = self.scan_bare(term);
        let digits = &self.src[start..end];
        let bad = |reason| EventError::InvalidFormat { pos: at, reason };

        let value = match (nano, kind) {
            (false, b'r') if digits.is_empty() => Value::Remove,
            (false, b'v') if digits.is_empty() => Value::Void,
            (false, b'i') => Value::Int(parse_signed_hex(digits).ok_or(bad("bad &i value"))?),
            (false, b'd') => Value::Date(parse_signed_hex(digits).ok_or(bad("bad &d value"))?),
            (false, b't') => Value::Time(parse_signed_hex(digits).ok_or(bad("bad &t value"))?),
            (true, b'd') => Value::NanoDate(parse_signed_hex(digits).ok_or(bad("bad &nd value"))?),
            (true, b't') => Value::NanoTime(parse_signed_hex(digits).ok_or(bad("bad &nt value"))?),
            (false, b'f') => Value::Float(f64::from_bits(parse_hex(digits).ok_or(bad("bad &f value"))?)),
            _ => return Err(bad("unknown '&' value prefix")),
        };
        Ok(value)
    }

    fn attr_block(&mut self, ev: &mut Event) -> Result<()> {
        self.skip_ws();
        self.expect(b'{', "missing '{' before attributes")?;
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            self.skip_ws();
            let key_start = self.pos;
            while self.peek().is_some_and(|c| !matches!(c, b'=' | b',' | b'}')) {
                self.pos += 1;
            }
            let mut key_end = self.pos;
            while key_end > key_start && matches!(self.src[key_end - 1], b' ' | b'\t') {
                key_end -= 1;
            }
            self.expect(b'=', "missing '=' in attribute")?;
            self.skip_ws();
            let value = self.value(Terminator::Attr)?;
            self.store_attr(ev, key_start, key_end, value)?;

            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Err(self.fail("expected ',' or '}' after attribute")),
            }
        }
    }

    fn store_attr(&self, ev: &mut Event, start: usize, end: usize, value: Value) -> Result<()> {
        let key = &self.src[start..end];
        if key.len() >= 4 && key[..4].eq_ignore_ascii_case(b"var/") {
            return self.store_var(ev, start + 4, end, value);
        }
        let key = self.slice(start, end)?;
        if !is_valid_key(&key) {
            return Err(EventError::InvalidName(key.to_string()));
        }
        ev.put_attr_raw(key, value);
        Ok(())
    }

    /// `var/<name>[/<idx1>[/<idx2>]]`, empty index = unset
    fn store_var(&self, ev: &mut Event, start: usize, end: usize, value: Value) -> Result<()> {
        let path = &self.src[start..end];
        let mut parts = path.split(|&c| c == b'/');
        let name_len = parts.next().map_or(0, <[u8]>::len);
        let name = self.slice(start, start + name_len)?;
        if !is_valid_key(&name) {
            return Err(EventError::InvalidName(name.to_string()));
        }
        let idx = |part: Option<&[u8]>| -> Result<Option<u32>> {
            match part {
                None | Some(b"") => Ok(None),
                Some(digits) => std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .map(Some)
                    .ok_or(EventError::InvalidFormat {
                        pos: start,
                        reason: "bad variable index",
                    }),
            }
        };
        let idx1 = idx(parts.next())?;
        let idx2 = idx(parts.next())?;
        if parts.next().is_some() {
            return Err(EventError::InvalidFormat {
                pos: start,
                reason: "too many variable indices",
            });
        }
        ev.put_var_raw(name, idx1, idx2, value);
        Ok(())
    }

    fn event(&mut self) -> Result<Event> {
        let mut ev = Event::default();

        self.skip_ws();
        let has_target = match self.peek() {
            Some(b'*') => false,
            Some(b'#') => true,
            _ => return Err(self.fail("missing '*' or '#' sentinel")),
        };
        self.pos += 1;

        if has_target {
            let name = self.name_field()?;
            let args = self.arg_list()?;
            ev.set_target_raw(Some(Target { name, args }));
        }

        let name = self.name_field()?;
        ev.set_name_text(name);
        let args = self.arg_list()?;
        ev.set_args_raw(args);
        self.attr_block(&mut ev)?;

        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
        if self.pos != self.src.len() {
            return Err(self.fail("trailing data after '}'"));
        }
        Ok(ev)
    }
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    digits
        .iter()
        .try_fold(0u64, |acc, &c| Some(acc << 4 | u64::from(hex_digit(c)?)))
}

fn parse_signed_hex(digits: &[u8]) -> Option<i64> {
    match digits.split_first() {
        Some((b'-', rest)) => {
            let v = parse_hex(rest)?;
            if v > i64::MAX as u64 + 1 {
                return None;
            }
            Some((v as i64).wrapping_neg())
        }
        _ => i64::try_from(parse_hex(digits)?).ok(),
    }
}

/// Parse one event from a shared buffer without copying it
pub fn parse_shared(buf: Arc<str>) -> Result<Event> {
    let result = Parser::new(&buf).event();
    if let Err(e) = &result {
        trace!(error = %e, "parse_shared: rejected input");
    }
    result
}

/// Parse a single value token such as `"text"`, `&i2a` or `plain`
pub fn parse_value(token: &str) -> Result<Value> {
    let buf: Arc<str> = Arc::from(token.trim());
    let mut parser = Parser::new(&buf);
    let value = parser.value(Terminator::End)?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.fail("trailing data after value"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;
    use crate::write::WriteOptions;

    fn canonical(s: &str) -> String {
        Event::parse(s).unwrap().serialize(&WriteOptions::default()).unwrap()
    }

    #[test]
    fn test_parse_basic() {
        let ev = Event::parse(r#"* ping:42::{reason="health"}"#).unwrap();
        assert_eq!(ev.name(), Some("ping"));
        assert_eq!(ev.arg_str(0).unwrap(), "42");
        assert_eq!(ev.attr_str("reason").unwrap(), "health");
        assert!(ev.target().is_none());
    }

    #[test]
    fn test_parse_no_args_no_attrs() {
        let ev = Event::parse("* tick::{}").unwrap();
        assert_eq!(ev.name(), Some("tick"));
        assert!(ev.args().is_empty());
        assert!(ev.attrs().is_empty());
    }

    #[test]
    fn test_parse_target() {
        let ev = Event::parse("# replyto:&i7::pong:&i1::{}").unwrap();
        let target = ev.target().unwrap();
        assert_eq!(target.name, "replyto");
        assert_eq!(target.args, vec![Value::Int(7)]);
        assert_eq!(ev.name(), Some("pong"));
        assert_eq!(ev.arg_int(0).unwrap(), 1);
    }

    #[test]
    fn test_parse_prefixed_values() {
        let ev = Event::parse("* v:&i-2A:&d10:&t1:&ndff:&nt-1:&f3ff0000000000000:&r:&v:&sraw text::{}").unwrap();
        let kinds: Vec<_> = ev.args().iter().map(Value::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ValueKind::Int,
                ValueKind::Date,
                ValueKind::Time,
                ValueKind::NanoDate,
                ValueKind::NanoTime,
                ValueKind::Float,
                ValueKind::Remove,
                ValueKind::Void,
                ValueKind::Str,
            ]
        );
        assert_eq!(ev.arg_int(0).unwrap(), -42);
        assert_eq!(ev.args()[3], Value::NanoDate(255));
        assert_eq!(ev.arg_float(5).unwrap(), 1.0);
        assert_eq!(ev.arg_str(8).unwrap(), "raw text");
    }

    #[test]
    fn test_parse_variables() {
        let ev = Event::parse("* x::{var/load/1/2=&i3, VAR/load/1=&i4, var/w=\"s\", var/z//5=&i6}").unwrap();
        assert_eq!(ev.var_int("load", Some(1), Some(2)).unwrap(), 3);
        assert_eq!(ev.var_int("load", Some(1), None).unwrap(), 4);
        assert_eq!(ev.var_str("w", None, None).unwrap(), "s");
        assert_eq!(ev.var_int("z", None, Some(5)).unwrap(), 6);
        assert!(ev.attrs().is_empty());
    }

    #[test]
    fn test_parse_is_zero_copy() {
        let buf: Arc<str> = Arc::from(r#"* ping:"abc"::{reason="health"}"#);
        let ev = Event::parse_shared(Arc::clone(&buf)).unwrap();
        let arg = ev.args()[0].as_text().unwrap();
        assert!(arg.shares_buffer(&Text::from_buffer(Arc::clone(&buf))));
        // name, arg, key, value and our own handle
        assert_eq!(Arc::strong_count(&buf), 5);
    }

    #[test]
    fn test_escaped_string_gets_own_buffer() {
        let ev = Event::parse(r#"* msg:"a\nb"::{}"#).unwrap();
        assert_eq!(ev.arg_str(0).unwrap(), "a\nb");
        let name = ev.name_text().unwrap();
        assert!(!name.shares_buffer(ev.args()[0].as_text().unwrap()));
    }

    #[test]
    fn test_name_normalized() {
        let ev = Event::parse("* Net__Link/Up::{}").unwrap();
        assert_eq!(ev.name(), Some("net_link/up"));
    }

    #[test]
    fn test_round_trip_canonical() {
        for text in [
            "* ping:&i2a::{}",
            r#"* ping:"42"::{reason="health"}"#,
            r#"# replyto:"a b"::pong:&v:&i1::{_date=&d5f5e100, var/load/0=&f3fe0000000000000}"#,
            r#"* quote:"say \"hi\"\t\$x"::{k="é"}"#,
            "* rm::{gone=&r, var/x//3=&r}",
        ] {
            assert_eq!(canonical(text), text);
        }
    }

    #[test]
    fn test_canonical_rewrites() {
        assert_eq!(canonical("* ping:&i2A::{}"), "* ping:&i2a::{}");
        assert_eq!(canonical("*ping:42::{ b = x ,a=&sy}"), r#"* ping:"42"::{a="y", b="x"}"#);
        assert_eq!(canonical("* p::{}\r\n"), "* p::{}");
    }

    #[test]
    fn test_invalid_format() {
        for bad in [
            "",
            "ping::{}",
            "* ping:{}",
            "* ping::",
            "* ping::{a=1",
            "* ping::{a}",
            "* ping::{} extra",
            "* ping:\"open::{}",
            "* ping:&q1::{}",
            "* ping:&i::{}",
            "* ping:&i10000000000000000::{}",
            "* ping::{var/x/a=1}",
            "# tgt:ping::{}",
        ] {
            assert!(
                matches!(Event::parse(bad), Err(EventError::InvalidFormat { .. })),
                "expected InvalidFormat for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_name() {
        assert!(matches!(Event::parse("* pi ng::{}"), Err(EventError::InvalidName(_))));
        assert!(matches!(Event::parse("* ::{}"), Err(EventError::InvalidName(_))));
        assert!(matches!(Event::parse("* p::{a b=1}"), Err(EventError::InvalidName(_))));
    }

    #[test]
    fn test_parse_value_token() {
        assert_eq!(parse_value("&i2a").unwrap(), Value::Int(42));
        assert_eq!(parse_value(r#" "a\tb" "#).unwrap().as_str(), Some("a\tb"));
        assert_eq!(parse_value("plain words").unwrap().as_str(), Some("plain words"));
        assert_eq!(parse_value("&r").unwrap(), Value::Remove);
        assert!(parse_value(r#""x" y"#).is_err());
        assert!(parse_value("&z").is_err());
    }

    #[test]
    fn test_signed_hex_bounds() {
        assert_eq!(parse_signed_hex(b"-8000000000000000"), Some(i64::MIN));
        assert_eq!(parse_signed_hex(b"7fffffffffffffff"), Some(i64::MAX));
        assert_eq!(parse_signed_hex(b"8000000000000000"), None);
        assert_eq!(parse_signed_hex(b"-"), None);
    }
}
