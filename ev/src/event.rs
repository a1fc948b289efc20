//! The event record
//!
//! Attributes and variables are kept in sorted vectors and located by binary
//! search; lookups never allocate. Attribute keys and variable names compare
//! ASCII-case-insensitively, so `Reason` and `reason` are the same key.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{EventError, Result};
use crate::name::{check_key, normalize_name};
use crate::text::{Text, cmp_ignore_case};
use crate::value::{Value, ValueKind};
use crate::write::WriteOptions;

/// Routing target carried on a `#` line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub name: Text,
    pub args: Vec<Value>,
}

impl Target {
    /// Build a target, normalizing the name
    pub fn new(name: &str, args: Vec<Value>) -> Result<Self> {
        let name = Text::new(&normalize_name(name)?);
        Ok(Self { name, args })
    }
}

/// Named attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attr {
    pub key: Text,
    pub value: Value,
}

/// Indexed variable; an index of `None` is unset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Var {
    pub name: Text,
    pub idx1: Option<u32>,
    pub idx2: Option<u32>,
    pub value: Value,
}

impl Var {
    fn cmp_key(&self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> Ordering {
        cmp_ignore_case(&self.name, name)
            .then(self.idx1.cmp(&idx1))
            .then(self.idx2.cmp(&idx2))
    }
}

/// A named record of arguments, attributes and variables
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Event {
    name: Option<Text>,
    target: Option<Target>,
    args: Vec<Value>,
    attrs: Vec<Attr>,
    vars: Vec<Var>,
}

fn expect_kind<'a, T>(value: &'a Value, expected: ValueKind, get: impl Fn(&'a Value) -> Option<T>) -> Result<T> {
    get(value).ok_or(EventError::InvalidType {
        expected,
        found: value.kind(),
    })
}

impl Event {
    /// Create an event with a (normalized) name
    pub fn new(name: &str) -> Result<Self> {
        let mut ev = Self::default();
        ev.set_name(name)?;
        Ok(ev)
    }

    // === Name and target ===

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn name_text(&self) -> Option<&Text> {
        self.name.as_ref()
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.name = Some(Text::new(&normalize_name(name)?));
        Ok(())
    }

    /// Set an already-normalized name (used by the parser)
    pub(crate) fn set_name_text(&mut self, name: Text) {
        self.name = Some(name);
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub fn clear_target(&mut self) -> Option<Target> {
        self.target.take()
    }

    // === Positional arguments ===

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Argument at `idx`; a `Void` hole counts as absent
    pub fn arg(&self, idx: usize) -> Result<&Value> {
        self.args
            .get(idx)
            .filter(|v| !v.is_void())
            .ok_or_else(|| EventError::NotFound(format!("arg[{}]", idx)))
    }

    pub fn arg_int(&self, idx: usize) -> Result<i64> {
        expect_kind(self.arg(idx)?, ValueKind::Int, Value::as_int)
    }

    pub fn arg_float(&self, idx: usize) -> Result<f64> {
        expect_kind(self.arg(idx)?, ValueKind::Float, Value::as_float)
    }

    pub fn arg_str(&self, idx: usize) -> Result<&str> {
        expect_kind(self.arg(idx)?, ValueKind::Str, Value::as_str)
    }

    /// Set argument `idx`, padding any gap with `Void`
    ///
    /// Assigning `Remove` clears the position.
    pub fn set_arg(&mut self, idx: usize, value: impl Into<Value>) {
        let mut value = value.into();
        if value.is_remove() {
            value = Value::Void;
        }
        if idx >= self.args.len() {
            if value.is_void() {
                return;
            }
            self.args.resize(idx + 1, Value::Void);
        }
        self.args[idx] = value;
        while self.args.last().is_some_and(Value::is_void) {
            self.args.pop();
        }
    }

    pub fn push_arg(&mut self, value: impl Into<Value>) {
        self.args.push(value.into());
    }

    // === Attributes ===

    fn attr_pos(&self, key: &str) -> std::result::Result<usize, usize> {
        self.attrs.binary_search_by(|a| cmp_ignore_case(&a.key, key))
    }

    /// Attributes in key order
    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Result<&Value> {
        match self.attr_pos(key) {
            Ok(pos) => Ok(&self.attrs[pos].value),
            Err(_) => Err(EventError::NotFound(format!("attr {}", key))),
        }
    }

    pub fn attr_int(&self, key: &str) -> Result<i64> {
        expect_kind(self.attr(key)?, ValueKind::Int, Value::as_int)
    }

    pub fn attr_float(&self, key: &str) -> Result<f64> {
        expect_kind(self.attr(key)?, ValueKind::Float, Value::as_float)
    }

    pub fn attr_str(&self, key: &str) -> Result<&str> {
        expect_kind(self.attr(key)?, ValueKind::Str, Value::as_str)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attr_pos(key).is_ok()
    }

    /// Insert an attribute
    ///
    /// With `overwrite` an existing entry is replaced, otherwise a duplicate
    /// key fails with `Exists`. A `Remove` value deletes the key.
    pub fn add_attr(&mut self, key: impl Into<Text>, value: impl Into<Value>, overwrite: bool) -> Result<()> {
        let key = key.into();
        check_key(&key)?;
        let value = value.into();
        if value.is_remove() {
            self.remove_attr(&key);
            return Ok(());
        }
        match self.attr_pos(&key) {
            Ok(pos) if overwrite => {
                self.attrs[pos] = Attr { key, value };
                Ok(())
            }
            Ok(_) => Err(EventError::Exists(format!("attr {}", key))),
            Err(pos) => {
                self.attrs.insert(pos, Attr { key, value });
                Ok(())
            }
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<Value> {
        let pos = self.attr_pos(key).ok()?;
        Some(self.attrs.remove(pos).value)
    }

    // === Variables ===

    fn var_pos(&self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> std::result::Result<usize, usize> {
        self.vars.binary_search_by(|v| v.cmp_key(name, idx1, idx2))
    }

    /// Variables in (name, idx1, idx2) order
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Look up a variable
    ///
    /// Tries the exact key first, then the same name and `idx1` with `idx2`
    /// unset.
    pub fn var(&self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> Result<&Value> {
        let found = match self.var_pos(name, idx1, idx2) {
            Ok(pos) => Some(pos),
            Err(_) if idx2.is_some() => self.var_pos(name, idx1, None).ok(),
            Err(_) => None,
        };
        found
            .map(|pos| &self.vars[pos].value)
            .ok_or_else(|| EventError::NotFound(format!("var {}", var_label(name, idx1, idx2))))
    }

    pub fn var_int(&self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> Result<i64> {
        expect_kind(self.var(name, idx1, idx2)?, ValueKind::Int, Value::as_int)
    }

    pub fn var_float(&self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> Result<f64> {
        expect_kind(self.var(name, idx1, idx2)?, ValueKind::Float, Value::as_float)
    }

    pub fn var_str(&self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> Result<&str> {
        expect_kind(self.var(name, idx1, idx2)?, ValueKind::Str, Value::as_str)
    }

    /// Insert a variable
    ///
    /// Entries with the same name but different indices coexist. An exact
    /// duplicate is replaced with `overwrite`, otherwise fails with `Exists`.
    /// A `Remove` value deletes the exact key.
    pub fn add_var(
        &mut self,
        name: impl Into<Text>,
        idx1: Option<u32>,
        idx2: Option<u32>,
        value: impl Into<Value>,
        overwrite: bool,
    ) -> Result<()> {
        let name = name.into();
        check_key(&name)?;
        let value = value.into();
        if value.is_remove() {
            self.remove_var(&name, idx1, idx2);
            return Ok(());
        }
        match self.var_pos(&name, idx1, idx2) {
            Ok(pos) if overwrite => {
                self.vars[pos].value = value;
                Ok(())
            }
            Ok(_) => Err(EventError::Exists(format!("var {}", var_label(&name, idx1, idx2)))),
            Err(pos) => {
                self.vars.insert(
                    pos,
                    Var {
                        name,
                        idx1,
                        idx2,
                        value,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn remove_var(&mut self, name: &str, idx1: Option<u32>, idx2: Option<u32>) -> Option<Value> {
        let pos = self.var_pos(name, idx1, idx2).ok()?;
        Some(self.vars.remove(pos).value)
    }

    // === Parser hooks: keep `Remove` values as they appear on the wire ===

    pub(crate) fn put_attr_raw(&mut self, key: Text, value: Value) {
        match self.attr_pos(&key) {
            Ok(pos) => self.attrs[pos] = Attr { key, value },
            Err(pos) => self.attrs.insert(pos, Attr { key, value }),
        }
    }

    pub(crate) fn put_var_raw(&mut self, name: Text, idx1: Option<u32>, idx2: Option<u32>, value: Value) {
        match self.var_pos(&name, idx1, idx2) {
            Ok(pos) => self.vars[pos].value = value,
            Err(pos) => self.vars.insert(
                pos,
                Var {
                    name,
                    idx1,
                    idx2,
                    value,
                },
            ),
        }
    }

    pub(crate) fn set_target_raw(&mut self, target: Option<Target>) {
        self.target = target;
    }

    pub(crate) fn set_args_raw(&mut self, args: Vec<Value>) {
        self.args = args;
    }

    // === Whole-event operations ===

    /// Reset to an empty event, keeping allocations for reuse
    pub fn clear(&mut self) {
        self.name = None;
        self.target = None;
        self.args.clear();
        self.attrs.clear();
        self.vars.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.target.is_none() && self.args.is_empty() && self.attrs.is_empty() && self.vars.is_empty()
    }

    /// Replace this event with a copy of `src`
    ///
    /// String data is shared with `src` by reference, not duplicated; the
    /// copy stays valid after `src` is dropped. Existing allocations are
    /// reused.
    pub fn copy_from(&mut self, src: &Event) {
        self.clear();
        self.name = src.name.clone();
        self.target = src.target.clone();
        self.args.extend(src.args.iter().cloned());
        self.attrs.extend(src.attrs.iter().cloned());
        self.vars.extend(src.vars.iter().cloned());
    }

    /// Apply an update event
    ///
    /// Non-void arguments, attributes and variables of `update` overwrite
    /// ours; `Remove` values delete the matching field.
    pub fn merge(&mut self, update: &Event) {
        for (idx, value) in update.args.iter().enumerate() {
            if !value.is_void() {
                self.set_arg(idx, value.clone());
            }
        }
        for attr in &update.attrs {
            if attr.value.is_remove() {
                self.remove_attr(&attr.key);
            } else {
                self.put_attr_raw(attr.key.clone(), attr.value.clone());
            }
        }
        for var in &update.vars {
            if var.value.is_remove() {
                self.remove_var(&var.name, var.idx1, var.idx2);
            } else {
                self.put_var_raw(var.name.clone(), var.idx1, var.idx2, var.value.clone());
            }
        }
    }

    fn for_each_text_mut(&mut self, mut f: impl FnMut(&mut Text)) {
        fn visit_value(v: &mut Value, f: &mut dyn FnMut(&mut Text)) {
            if let Value::Str(t) = v {
                f(t);
            }
        }
        if let Some(name) = &mut self.name {
            f(name);
        }
        if let Some(target) = &mut self.target {
            f(&mut target.name);
            for v in &mut target.args {
                visit_value(v, &mut f);
            }
        }
        for v in &mut self.args {
            visit_value(v, &mut f);
        }
        for a in &mut self.attrs {
            f(&mut a.key);
            visit_value(&mut a.value, &mut f);
        }
        for v in &mut self.vars {
            f(&mut v.name);
            visit_value(&mut v.value, &mut f);
        }
    }

    /// Move every string into one fresh private buffer
    ///
    /// Afterwards the event pins no buffer it was parsed from or copied out
    /// of; useful before holding a small event extracted from a large frame.
    pub fn compact(&mut self) {
        let mut joined = String::new();
        self.for_each_text_mut(|t| joined.push_str(t));
        let buf: Arc<str> = Arc::from(joined);
        let mut offset = 0;
        self.for_each_text_mut(|t| {
            t.rehome(&buf, offset);
            offset += t.len();
        });
    }

    /// Parse wire text, copying it into one shared buffer
    pub fn parse(text: &str) -> Result<Self> {
        crate::parse::parse_shared(Arc::from(text))
    }

    /// Parse wire text that is already in a shared buffer, without copying
    pub fn parse_shared(buf: Arc<str>) -> Result<Self> {
        crate::parse::parse_shared(buf)
    }

    /// Canonical wire form; fails with `Param` when the event has no name
    pub fn serialize(&self, opts: &WriteOptions) -> Result<String> {
        crate::write::serialize(self, opts)
    }

    /// Exact byte length of [`Event::serialize`] / [`Event::write_out`]
    pub fn output_size(&self, opts: &WriteOptions) -> usize {
        crate::write::output_size(self, opts)
    }

    /// Serialize into `buf`, returning the number of bytes written
    pub fn write_out(&self, opts: &WriteOptions, buf: &mut [u8]) -> Result<usize> {
        crate::write::write_out(self, opts, buf)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.serialize(&WriteOptions::default()) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<unnamed event>"),
        }
    }
}

fn var_label(name: &str, idx1: Option<u32>, idx2: Option<u32>) -> String {
    match (idx1, idx2) {
        (None, None) => name.to_string(),
        (Some(a), None) => format!("{}.{}", name, a),
        (None, Some(b)) => format!("{}[{}]", name, b),
        (Some(a), Some(b)) => format!("{}.{}[{}]", name, a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        let mut ev = Event::new("ping").unwrap();
        ev.push_arg(42i64);
        ev.push_arg("two");
        ev.add_attr("reason", "health", false).unwrap();
        ev.add_var("load", Some(1), None, 0.5, false).unwrap();
        ev
    }

    #[test]
    fn test_typed_getters() {
        let ev = sample();
        assert_eq!(ev.arg_int(0).unwrap(), 42);
        assert_eq!(ev.arg_str(1).unwrap(), "two");
        assert_eq!(
            ev.arg_str(0).unwrap_err(),
            EventError::InvalidType {
                expected: ValueKind::Str,
                found: ValueKind::Int
            }
        );
        assert!(ev.arg(5).unwrap_err().is_not_found());
        assert_eq!(ev.attr_str("REASON").unwrap(), "health");
        assert!(matches!(ev.attr_int("reason"), Err(EventError::InvalidType { .. })));
        assert_eq!(ev.var_float("LOAD", Some(1), None).unwrap(), 0.5);
    }

    #[test]
    fn test_void_arg_is_absent() {
        let mut ev = Event::new("x").unwrap();
        ev.set_arg(2, 7i64);
        assert_eq!(ev.args().len(), 3);
        assert!(ev.arg(0).unwrap_err().is_not_found());
        assert_eq!(ev.arg_int(2).unwrap(), 7);
    }

    #[test]
    fn test_set_arg_remove_trims() {
        let mut ev = Event::new("x").unwrap();
        ev.set_arg(0, 1i64);
        ev.set_arg(3, 2i64);
        ev.set_arg(3, Value::Remove);
        assert_eq!(ev.args().len(), 1);
    }

    #[test]
    fn test_attr_keys_case_insensitive_unique() {
        let mut ev = Event::new("x").unwrap();
        ev.add_attr("Key", 1i64, false).unwrap();
        assert!(matches!(ev.add_attr("KEY", 2i64, false), Err(EventError::Exists(_))));
        ev.add_attr("key", 3i64, true).unwrap();
        assert_eq!(ev.attrs().len(), 1);
        assert_eq!(ev.attr_int("kEy").unwrap(), 3);
        assert_eq!(ev.attrs()[0].key, "key");
    }

    #[test]
    fn test_attr_invalid_key() {
        let mut ev = Event::new("x").unwrap();
        assert!(matches!(ev.add_attr("a b", 1i64, false), Err(EventError::InvalidName(_))));
    }

    #[test]
    fn test_remove_value_deletes() {
        let mut ev = sample();
        ev.add_attr("reason", Value::Remove, true).unwrap();
        assert!(!ev.has_attr("reason"));
        ev.add_var("load", Some(1), None, Value::Remove, true).unwrap();
        assert!(ev.vars().is_empty());
    }

    #[test]
    fn test_var_lookup_fallback_to_unset_idx2() {
        let mut ev = Event::new("x").unwrap();
        ev.add_var("v", Some(1), None, 10i64, false).unwrap();
        ev.add_var("v", Some(1), Some(2), 12i64, false).unwrap();
        assert_eq!(ev.var_int("v", Some(1), Some(2)).unwrap(), 12);
        assert_eq!(ev.var_int("v", Some(1), Some(9)).unwrap(), 10);
        assert_eq!(ev.var_int("v", Some(1), None).unwrap(), 10);
        // no fallback on idx1
        assert!(ev.var("v", Some(3), Some(2)).unwrap_err().is_not_found());
        assert!(ev.var("v", None, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_var_same_name_different_idx() {
        let mut ev = Event::new("x").unwrap();
        ev.add_var("v", Some(0), None, 1i64, false).unwrap();
        ev.add_var("v", Some(1), None, 2i64, false).unwrap();
        assert!(matches!(
            ev.add_var("V", Some(1), None, 3i64, false),
            Err(EventError::Exists(_))
        ));
        assert_eq!(ev.vars().len(), 2);
        assert_eq!(ev.vars()[0].idx1, Some(0));
    }

    #[test]
    fn test_copy_shares_buffers() {
        let src = Event::parse(r#"* ping:"abc"::{reason="health"}"#).unwrap();
        let mut dst = Event::default();
        dst.copy_from(&src);
        assert_eq!(dst, src);
        let a = dst.args()[0].as_text().unwrap();
        let b = src.args()[0].as_text().unwrap();
        assert!(a.shares_buffer(b));
        drop(src);
        assert_eq!(dst.arg_str(0).unwrap(), "abc");
    }

    #[test]
    fn test_compact_detaches_from_source() {
        let src = Event::parse(r#"* ping:"abc"::{reason="health", pad="xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}"#).unwrap();
        let mut ev = src.clone();
        ev.remove_attr("pad");
        ev.compact();
        assert_eq!(ev.arg_str(0).unwrap(), "abc");
        assert_eq!(ev.attr_str("reason").unwrap(), "health");
        let text = ev.args()[0].as_text().unwrap();
        assert!(!text.shares_buffer(src.args()[0].as_text().unwrap()));
        assert_eq!(text.buffer_len(), "pingabcreasonhealth".len());
    }

    #[test]
    fn test_merge() {
        let mut ev = sample();
        let mut update = Event::new("ping").unwrap();
        update.set_arg(1, "three");
        update.put_attr_raw(Text::new("reason"), Value::Remove);
        update.put_attr_raw(Text::new("extra"), Value::Int(1));
        update.put_var_raw(Text::new("load"), Some(1), None, Value::Remove);
        ev.merge(&update);
        assert_eq!(ev.arg_int(0).unwrap(), 42);
        assert_eq!(ev.arg_str(1).unwrap(), "three");
        assert!(!ev.has_attr("reason"));
        assert_eq!(ev.attr_int("extra").unwrap(), 1);
        assert!(ev.vars().is_empty());
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut ev = sample();
        let cap = ev.args.capacity();
        ev.clear();
        assert!(ev.is_empty());
        assert_eq!(ev.args.capacity(), cap);
    }
}
