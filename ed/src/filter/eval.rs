//! Filter execution

use std::borrow::Cow;
use std::cmp::Ordering;

use eddievent::text::cmp_ignore_case;
use eddievent::{Event, Target, Value};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::ast::{Action, BinOp, Filter, JumpKind, LogLevel, Node, Predicate, Reference, Test};
use super::error::{FilterError, Result};
use super::parser::STACK_LIMIT;

/// Rules evaluated per `apply` before giving up
pub const STEP_LIMIT: usize = 65_536;

/// How a path through the program ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Reject,
    Drop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterFlags {
    /// Leave the input untouched and run the main path on a copy
    pub copy: bool,
    /// Write an accept target into the event
    pub set_target: bool,
}

/// Which event an outcome refers to
#[derive(Debug)]
pub enum Subject {
    /// The event passed to `apply`, rewritten in place
    Input,
    Copy(Event),
}

#[derive(Debug)]
pub struct Outcome {
    pub verdict: Verdict,
    pub target: Option<Target>,
    pub subject: Subject,
}

impl Outcome {
    /// The event this outcome is about
    pub fn event<'a>(&'a self, input: &'a Event) -> &'a Event {
        match &self.subject {
            Subject::Input => input,
            Subject::Copy(ev) => ev,
        }
    }
}

/// Run `filter` over `event`
///
/// The first outcome is the main path; `branch` actions append one outcome
/// each, always on a copy.
pub fn apply(filter: &Filter, event: &mut Event, flags: FilterFlags) -> Result<Vec<Outcome>> {
    let mut machine = Machine {
        filter,
        flags,
        steps: 0,
        last: false,
        depth: 0,
        branches: Vec::new(),
    };

    let main = if flags.copy {
        let mut copy = event.clone();
        let (verdict, target) = machine.run(0, &mut copy)?;
        Outcome {
            verdict,
            target,
            subject: Subject::Copy(copy),
        }
    } else {
        let (verdict, target) = machine.run(0, event)?;
        Outcome {
            verdict,
            target,
            subject: Subject::Input,
        }
    };
    debug!(verdict = ?main.verdict, branches = machine.branches.len(), steps = machine.steps, "apply: done");

    let mut outcomes = Vec::with_capacity(1 + machine.branches.len());
    outcomes.push(main);
    outcomes.append(&mut machine.branches);
    Ok(outcomes)
}

struct Machine<'f> {
    filter: &'f Filter,
    flags: FilterFlags,
    steps: usize,
    last: bool,
    depth: usize,
    branches: Vec<Outcome>,
}

impl Machine<'_> {
    fn run(&mut self, start: usize, event: &mut Event) -> Result<(Verdict, Option<Target>)> {
        let filter = self.filter;
        let mut pc = start;
        let mut prev = false;
        let mut calls: Vec<(usize, bool)> = Vec::new();

        'rules: while let Some(rule) = filter.rules.get(pc) {
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err(FilterError::StepLimit(STEP_LIMIT));
            }
            pc += 1;

            let matched = eval_node(&rule.condition, event, prev, self.last);
            if !rule.is_default() {
                prev = matched;
                self.last = matched;
            }
            if !matched {
                continue;
            }
            trace!(line = rule.line, "Machine::run: rule matched");

            for action in &rule.actions {
                match action {
                    Action::Accept { target, args } => {
                        let target = match target {
                            Some(name) => Some(Target::new(name, args.clone())?),
                            None => None,
                        };
                        if self.flags.set_target
                            && let Some(t) = &target
                        {
                            event.set_target(t.clone());
                        }
                        return Ok((Verdict::Accept, target));
                    }
                    Action::Reject => return Ok((Verdict::Reject, None)),
                    Action::Drop => return Ok((Verdict::Drop, None)),
                    Action::SetName(name) => event.set_name(name)?,
                    Action::SetArg(idx, value) => event.set_arg(*idx, value.clone()),
                    Action::SetAttr(key, value) => event.add_attr(key.as_str(), value.clone(), true)?,
                    Action::SetVar {
                        name,
                        idx1,
                        idx2,
                        value,
                    } => event.add_var(name.as_str(), *idx1, *idx2, value.clone(), true)?,
                    Action::Jump {
                        kind: JumpKind::Goto,
                        pc: to,
                        ..
                    } => {
                        pc = *to;
                        prev = false;
                        continue 'rules;
                    }
                    Action::Jump {
                        kind: JumpKind::Gosub,
                        pc: to,
                        ..
                    } => {
                        if calls.len() >= STACK_LIMIT {
                            return Err(FilterError::StackOverflow {
                                line: rule.line,
                                limit: STACK_LIMIT,
                            });
                        }
                        calls.push((pc, prev));
                        pc = *to;
                        prev = false;
                        continue 'rules;
                    }
                    Action::Jump {
                        kind: JumpKind::Branch,
                        pc: to,
                        ..
                    } => {
                        if self.depth >= STACK_LIMIT {
                            return Err(FilterError::StackOverflow {
                                line: rule.line,
                                limit: STACK_LIMIT,
                            });
                        }
                        let mut copy = event.clone();
                        self.depth += 1;
                        let result = self.run(*to, &mut copy);
                        self.depth -= 1;
                        let (verdict, target) = result?;
                        self.branches.push(Outcome {
                            verdict,
                            target,
                            subject: Subject::Copy(copy),
                        });
                    }
                    Action::Return => match calls.pop() {
                        Some((ret, saved)) => {
                            pc = ret;
                            prev = saved;
                            continue 'rules;
                        }
                        None => return Ok((Verdict::Accept, None)),
                    },
                    Action::Log(level, message) => log_action(*level, rule.line, message, event),
                }
            }
        }
        Ok((Verdict::Accept, None))
    }
}

fn log_action(level: LogLevel, line: usize, message: &str, event: &Event) {
    match level {
        LogLevel::Error => error!(line, event = %event, "filter: {}", message),
        LogLevel::Warn => warn!(line, event = %event, "filter: {}", message),
        LogLevel::Info => info!(line, event = %event, "filter: {}", message),
        LogLevel::Debug => debug!(line, event = %event, "filter: {}", message),
        LogLevel::Trace => trace!(line, event = %event, "filter: {}", message),
    }
}

fn eval_node(node: &Node, event: &Event, prev: bool, last: bool) -> bool {
    match node {
        Node::Leaf(p) => eval_predicate(p, event),
        Node::Binary(op, l, r) => {
            let l = eval_node(l, event, prev, last);
            let r = eval_node(r, event, prev, last);
            match op {
                BinOp::And => l && r,
                BinOp::Or => l || r,
                BinOp::Xor => l ^ r,
            }
        }
        Node::Not(inner) => !eval_node(inner, event, prev, last),
        Node::Default => true,
        Node::Prev => prev,
        Node::Last => last,
    }
}

fn field<'e>(reference: &Reference, event: &'e Event) -> Option<Cow<'e, Value>> {
    let value = match reference {
        Reference::Name => return event.name_text().map(|t| Cow::Owned(Value::Str(t.clone()))),
        Reference::Arg(idx) => event.args().get(*idx)?,
        Reference::Attr(key) => event.attr(key).ok()?,
        Reference::Var { name, idx1, idx2 } => event.var(name, *idx1, *idx2).ok()?,
    };
    (!value.is_void()).then_some(Cow::Borrowed(value))
}

fn eval_predicate(p: &Predicate, event: &Event) -> bool {
    let Some(value) = field(&p.reference, event) else {
        return false;
    };
    match &p.test {
        Test::Exists => true,
        Test::Compare {
            op,
            case_sensitive,
            literal,
        } => compare(&value, literal, *case_sensitive).is_some_and(|ord| op.holds(ord)),
        Test::Match { negate, regex } => {
            let matched = match value.as_str() {
                Some(s) => regex.is_match(s),
                None => regex.is_match(&value.to_string()),
            };
            matched != *negate
        }
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

fn number(value: &Value) -> Option<Number> {
    match value {
        Value::Int(i) => Some(Number::Int(*i)),
        Value::Float(f) => Some(Number::Float(*f)),
        Value::Str(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(Number::Int)
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(Number::Float))
        }
        _ => None,
    }
}

fn float_cmp(a: f64, b: f64) -> Option<Ordering> {
    if (a - b).abs() <= a.abs().max(b.abs()) * f64::EPSILON {
        return Some(Ordering::Equal);
    }
    a.partial_cmp(&b)
}

/// Order a field against a literal; `None` when the kinds cannot be compared
fn compare(field: &Value, literal: &Value, case_sensitive: bool) -> Option<Ordering> {
    match (field, literal) {
        (Value::Str(a), Value::Str(b)) => Some(if case_sensitive {
            a.as_str().cmp(b.as_str())
        } else {
            cmp_ignore_case(a, b)
        }),
        (a, b) if a.is_temporal() && b.is_temporal() => {
            let same_axis = matches!(
                (a, b),
                (Value::Date(_) | Value::NanoDate(_), Value::Date(_) | Value::NanoDate(_))
                    | (Value::Time(_) | Value::NanoTime(_), Value::Time(_) | Value::NanoTime(_))
            );
            if !same_axis {
                return None;
            }
            if a.is_nano() == b.is_nano() {
                Some(a.temporal_raw()?.cmp(&b.temporal_raw()?))
            } else {
                Some(a.micros()?.cmp(&b.micros()?))
            }
        }
        (a, b) => match (number(a)?, number(b)?) {
            (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
            (Number::Int(x), Number::Float(y)) => float_cmp(x as f64, y),
            (Number::Float(x), Number::Int(y)) => float_cmp(x, y as f64),
            (Number::Float(x), Number::Float(y)) => float_cmp(x, y),
        },
    }
}
