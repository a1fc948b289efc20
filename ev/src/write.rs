//! Event to wire text
//!
//! Serialization is two-pass: [`output_size`] computes the exact length with
//! the same per-field length functions the writer uses, then [`write_out`]
//! fills a buffer of that size once. `Value::repr_len` and
//! `Value::write_repr` are a pair; a change to the value encoding must touch
//! both.

use crate::error::{EventError, Result};
use crate::event::{Event, Var};
use crate::quote::{escaped_len, write_escaped};
use crate::value::Value;

/// Serialization switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Write bytes >= 0x80 inside strings as `\xHH`
    pub hex_escapes: bool,
    /// Write `*` even when the event carries a target
    pub omit_target: bool,
    /// Terminate with `\n` (socket framing)
    pub newline: bool,
}

impl WriteOptions {
    /// Options for one newline-terminated socket frame
    pub fn frame() -> Self {
        Self {
            newline: true,
            ..Self::default()
        }
    }
}

/// Byte sink for the write pass
pub(crate) trait Sink {
    fn put(&mut self, bytes: &[u8]) -> Result<()>;
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Fixed-size output; overflowing it is an error, never a panic
struct SliceSink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Sink for SliceSink<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        let Some(dst) = self.buf.get_mut(self.pos..end) else {
            return Err(EventError::Full {
                needed: end,
                available: self.buf.len(),
            });
        };
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn hex_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.div_ceil(4).max(1)
}

fn write_hex<S: Sink>(v: u64, out: &mut S) -> Result<()> {
    let len = hex_len(v);
    let mut digits = [0u8; 16];
    for (i, d) in digits[..len].iter_mut().enumerate() {
        let shift = 4 * (len - 1 - i);
        *d = HEX[((v >> shift) & 0xf) as usize];
    }
    out.put(&digits[..len])
}

fn signed_hex_len(v: i64) -> usize {
    usize::from(v < 0) + hex_len(v.unsigned_abs())
}

fn write_signed_hex<S: Sink>(v: i64, out: &mut S) -> Result<()> {
    if v < 0 {
        out.put(b"-")?;
    }
    write_hex(v.unsigned_abs(), out)
}

fn dec_len(mut v: u32) -> usize {
    let mut len = 1;
    while v >= 10 {
        v /= 10;
        len += 1;
    }
    len
}

fn write_dec<S: Sink>(v: u32, out: &mut S) -> Result<()> {
    let len = dec_len(v);
    let mut digits = [0u8; 10];
    let mut rest = v;
    for d in digits[..len].iter_mut().rev() {
        *d = b'0' + (rest % 10) as u8;
        rest /= 10;
    }
    out.put(&digits[..len])
}

impl Value {
    /// Encoded length of this value
    pub(crate) fn repr_len(&self, opts: &WriteOptions) -> usize {
        match self {
            Value::Void | Value::Remove => 2,
            Value::Int(v) | Value::Date(v) | Value::Time(v) => 2 + signed_hex_len(*v),
            Value::NanoDate(v) | Value::NanoTime(v) => 3 + signed_hex_len(*v),
            Value::Float(f) => 2 + hex_len(f.to_bits()),
            Value::Str(t) => 2 + escaped_len(t, opts.hex_escapes),
        }
    }

    /// Write the encoding measured by `repr_len`
    pub(crate) fn write_repr<S: Sink>(&self, opts: &WriteOptions, out: &mut S) -> Result<()> {
        match self {
            Value::Void => out.put(b"&v"),
            Value::Remove => out.put(b"&r"),
            Value::Int(v) => {
                out.put(b"&i")?;
                write_signed_hex(*v, out)
            }
            Value::Date(v) => {
                out.put(b"&d")?;
                write_signed_hex(*v, out)
            }
            Value::Time(v) => {
                out.put(b"&t")?;
                write_signed_hex(*v, out)
            }
            Value::NanoDate(v) => {
                out.put(b"&nd")?;
                write_signed_hex(*v, out)
            }
            Value::NanoTime(v) => {
                out.put(b"&nt")?;
                write_signed_hex(*v, out)
            }
            Value::Float(f) => {
                out.put(b"&f")?;
                write_hex(f.to_bits(), out)
            }
            Value::Str(t) => {
                out.put(b"\"")?;
                write_escaped(t, opts.hex_escapes, out)?;
                out.put(b"\"")
            }
        }
    }
}

fn var_key_len(var: &Var) -> usize {
    let idx = match (var.idx1, var.idx2) {
        (None, None) => 0,
        (Some(a), None) => 1 + dec_len(a),
        (None, Some(b)) => 2 + dec_len(b),
        (Some(a), Some(b)) => 2 + dec_len(a) + dec_len(b),
    };
    "var/".len() + var.name.len() + idx
}

fn write_var_key<S: Sink>(var: &Var, out: &mut S) -> Result<()> {
    out.put(b"var/")?;
    out.put(var.name.as_bytes())?;
    if var.idx1.is_none() && var.idx2.is_none() {
        return Ok(());
    }
    out.put(b"/")?;
    if let Some(a) = var.idx1 {
        write_dec(a, out)?;
    }
    if let Some(b) = var.idx2 {
        out.put(b"/")?;
        write_dec(b, out)?;
    }
    Ok(())
}

fn args_len(args: &[Value], opts: &WriteOptions) -> usize {
    args.iter().map(|v| v.repr_len(opts) + 1).sum()
}

fn write_args<S: Sink>(args: &[Value], opts: &WriteOptions, out: &mut S) -> Result<()> {
    for v in args {
        v.write_repr(opts, out)?;
        out.put(b":")?;
    }
    Ok(())
}

/// Exact length of the serialized event
pub fn output_size(ev: &Event, opts: &WriteOptions) -> usize {
    // sentinel and space
    let mut size = 2;
    if let Some(target) = ev.target().filter(|_| !opts.omit_target) {
        size += target.name.len() + 1 + args_len(&target.args, opts) + 1;
    }
    size += ev.name().map_or(0, str::len) + 1 + args_len(ev.args(), opts) + 1;

    let items = ev.attrs().len() + ev.vars().len();
    size += 2 + 2 * items.saturating_sub(1);
    size += ev
        .attrs()
        .iter()
        .map(|a| a.key.len() + 1 + a.value.repr_len(opts))
        .sum::<usize>();
    size += ev
        .vars()
        .iter()
        .map(|v| var_key_len(v) + 1 + v.value.repr_len(opts))
        .sum::<usize>();

    if opts.newline {
        size += 1;
    }
    size
}

fn write_event<S: Sink>(ev: &Event, opts: &WriteOptions, out: &mut S) -> Result<()> {
    let name = ev.name().ok_or_else(|| EventError::Param("event has no name".to_string()))?;
    match ev.target().filter(|_| !opts.omit_target) {
        Some(target) => {
            out.put(b"# ")?;
            out.put(target.name.as_bytes())?;
            out.put(b":")?;
            write_args(&target.args, opts, out)?;
            out.put(b":")?;
        }
        None => out.put(b"* ")?,
    }

    out.put(name.as_bytes())?;
    out.put(b":")?;
    write_args(ev.args(), opts, out)?;
    out.put(b":{")?;

    let mut first = true;
    for attr in ev.attrs() {
        if !first {
            out.put(b", ")?;
        }
        first = false;
        out.put(attr.key.as_bytes())?;
        out.put(b"=")?;
        attr.value.write_repr(opts, out)?;
    }
    for var in ev.vars() {
        if !first {
            out.put(b", ")?;
        }
        first = false;
        write_var_key(var, out)?;
        out.put(b"=")?;
        var.value.write_repr(opts, out)?;
    }
    out.put(b"}")?;

    if opts.newline {
        out.put(b"\n")?;
    }
    Ok(())
}

/// Serialize into `buf`, returning the number of bytes written
///
/// Fails with `Full` if `buf` is shorter than [`output_size`] and with
/// `Param` if the event has no name; never writes past the end of `buf`.
pub fn write_out(ev: &Event, opts: &WriteOptions, buf: &mut [u8]) -> Result<usize> {
    let mut sink = SliceSink { buf, pos: 0 };
    write_event(ev, opts, &mut sink)?;
    Ok(sink.pos)
}

/// Serialize into a freshly allocated string of exactly the right size
///
/// A nameless event has no wire form and fails with `Param`.
pub fn serialize(ev: &Event, opts: &WriteOptions) -> Result<String> {
    let size = output_size(ev, opts);
    let mut out = Vec::with_capacity(size);
    write_event(ev, opts, &mut out)?;
    debug_assert_eq!(out.len(), size, "output_size and write_event disagree");
    // Only whole UTF-8 sequences and ASCII escapes are ever written
    Ok(String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Target;
    use proptest::prelude::*;

    #[test]
    fn test_hex_len() {
        assert_eq!(hex_len(0), 1);
        assert_eq!(hex_len(0xf), 1);
        assert_eq!(hex_len(0x10), 2);
        assert_eq!(hex_len(u64::MAX), 16);
    }

    #[test]
    fn test_value_encodings() {
        let opts = WriteOptions::default();
        let cases = [
            (Value::Int(42), "&i2a"),
            (Value::Int(-1), "&i-1"),
            (Value::Int(i64::MIN), "&i-8000000000000000"),
            (Value::Date(0), "&d0"),
            (Value::Time(255), "&tff"),
            (Value::NanoDate(16), "&nd10"),
            (Value::NanoTime(-16), "&nt-10"),
            (Value::Float(1.0), "&f3ff0000000000000"),
            (Value::Void, "&v"),
            (Value::Remove, "&r"),
            (Value::str("a:b"), "\"a:b\""),
        ];
        for (value, expected) in cases {
            let mut out = Vec::new();
            value.write_repr(&opts, &mut out).unwrap();
            assert_eq!(String::from_utf8(out).unwrap(), expected);
            assert_eq!(value.repr_len(&opts), expected.len());
        }
    }

    #[test]
    fn test_serialize_full_event() {
        let mut ev = Event::new("ping").unwrap();
        ev.set_target(Target::new("replyto", vec![Value::Int(1)]).unwrap());
        ev.push_arg(Value::Int(42));
        ev.add_attr("reason", "health", false).unwrap();
        ev.add_var("vname", Some(1), Some(2), Value::Int(3), false).unwrap();
        ev.add_var("w", None, Some(2), Value::Int(4), false).unwrap();
        let out = ev.serialize(&WriteOptions::default()).unwrap();
        assert_eq!(
            out,
            r#"# replyto:&i1::ping:&i2a::{reason="health", var/vname/1/2=&i3, var/w//2=&i4}"#
        );
        let untargeted = ev
            .serialize(&WriteOptions {
                omit_target: true,
                ..WriteOptions::default()
            })
            .unwrap();
        assert!(untargeted.starts_with("* ping:"));
    }

    #[test]
    fn test_empty_event_frame() {
        let ev = Event::new("tick").unwrap();
        assert_eq!(ev.serialize(&WriteOptions::frame()).unwrap(), "* tick::{}\n");
    }

    #[test]
    fn test_nameless_event_has_no_wire_form() {
        let mut ev = Event::default();
        ev.push_arg(Value::Int(1));
        assert!(matches!(ev.serialize(&WriteOptions::default()), Err(EventError::Param(_))));
        let mut buf = vec![0u8; 64];
        assert!(matches!(
            ev.write_out(&WriteOptions::default(), &mut buf),
            Err(EventError::Param(_))
        ));
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(ev.to_string(), "<unnamed event>");
    }

    #[test]
    fn test_write_out_short_buffer_fails() {
        let ev = Event::new("tick").unwrap();
        let opts = WriteOptions::default();
        let size = ev.output_size(&opts);
        let mut buf = vec![0u8; size - 1];
        assert!(matches!(ev.write_out(&opts, &mut buf), Err(EventError::Full { .. })));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Void),
            Just(Value::Remove),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            any::<i64>().prop_map(Value::Date),
            any::<i64>().prop_map(Value::NanoTime),
            ".{0,40}".prop_map(|s: String| Value::str(&s)),
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(|b| Value::from(String::from_utf8_lossy(&b).into_owned())),
            Just(Value::str("\0\0embedded\0nul")),
        ]
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        (
            "[a-z][a-z0-9_/.]{0,12}",
            proptest::collection::vec(arb_value(), 0..6),
            proptest::collection::vec(("[a-zA-Z_][a-zA-Z0-9_.-]{0,8}", arb_value()), 0..6),
            proptest::collection::vec(
                ("[a-z][a-z0-9_]{0,6}", proptest::option::of(0u32..5000), proptest::option::of(0u32..50), arb_value()),
                0..6,
            ),
        )
            .prop_map(|(name, args, attrs, vars)| {
                let mut ev = Event::new(&name).unwrap();
                for v in args {
                    ev.push_arg(v);
                }
                for (k, v) in attrs {
                    if !v.is_remove() {
                        let _ = ev.add_attr(k.as_str(), v, true);
                    }
                }
                for (n, i1, i2, v) in vars {
                    if !v.is_remove() {
                        let _ = ev.add_var(n.as_str(), i1, i2, v, true);
                    }
                }
                ev
            })
    }

    proptest! {
        #[test]
        fn prop_size_then_write_fills_exactly(ev in arb_event(), hex in any::<bool>(), newline in any::<bool>()) {
            let opts = WriteOptions { hex_escapes: hex, newline, ..WriteOptions::default() };
            let size = ev.output_size(&opts);
            let mut buf = vec![0u8; size];
            let written = ev.write_out(&opts, &mut buf).unwrap();
            prop_assert_eq!(written, size);
            prop_assert!(std::str::from_utf8(&buf).is_ok());
        }
    }
}
