//! Compiled filter program

use std::collections::HashMap;
use std::fmt;

use eddievent::Value;
use regex::Regex;

/// Event field a predicate reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Name,
    Arg(usize),
    Attr(String),
    Var {
        name: String,
        idx1: Option<u32>,
        idx2: Option<u32>,
    },
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Name => write!(f, "name"),
            Reference::Arg(i) => write!(f, "arg[{}]", i),
            Reference::Attr(k) => write!(f, "attr{{{}}}", k),
            Reference::Var { name, idx1, idx2 } => {
                write!(f, "var{{{}", name)?;
                if let Some(i) = idx1 {
                    write!(f, ".{}", i)?;
                }
                if let Some(j) = idx2 {
                    write!(f, "[{}]", j)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ord == Equal,
            CmpOp::Ne => ord != Equal,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
        }
    }
}

/// What a predicate checks about its field
#[derive(Debug, Clone)]
pub enum Test {
    /// Bare reference: the field is present
    Exists,
    Compare {
        op: CmpOp,
        case_sensitive: bool,
        literal: Value,
    },
    /// `#` / `!#`; case folding is baked into the regex
    Match { negate: bool, regex: Regex },
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub reference: Reference,
    pub test: Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
    Xor,
}

/// Condition tree
#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Predicate),
    Binary(BinOp, Box<Node>, Box<Node>),
    Not(Box<Node>),
    /// Always true; does not update `prev` or `last`
    Default,
    /// Whether the preceding rule matched
    Prev,
    /// Whether the most recently evaluated rule matched
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Goto,
    Gosub,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone)]
pub enum Action {
    Accept { target: Option<String>, args: Vec<Value> },
    Reject,
    Drop,
    SetName(String),
    SetArg(usize, Value),
    SetAttr(String, Value),
    SetVar {
        name: String,
        idx1: Option<u32>,
        idx2: Option<u32>,
        value: Value,
    },
    /// `pc` is filled in once every label of the section is known
    Jump { kind: JumpKind, label: String, pc: usize },
    Return,
    Log(LogLevel, String),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub condition: Node,
    pub actions: Vec<Action>,
    /// Source line, for diagnostics
    pub line: usize,
}

impl Rule {
    /// `default` rules leave `prev` and `last` alone
    pub fn is_default(&self) -> bool {
        matches!(self.condition, Node::Default)
    }
}

/// One direction's rule program
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub(crate) rules: Vec<Rule>,
    pub(crate) labels: HashMap<String, usize>,
}

impl Filter {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// An empty program accepts everything unchanged
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_cmp_op_holds() {
        assert!(CmpOp::Ge.holds(Ordering::Equal));
        assert!(CmpOp::Ge.holds(Ordering::Greater));
        assert!(!CmpOp::Gt.holds(Ordering::Equal));
        assert!(CmpOp::Ne.holds(Ordering::Less));
    }

    #[test]
    fn test_reference_display() {
        let r = Reference::Var {
            name: "load".to_string(),
            idx1: Some(1),
            idx2: Some(2),
        };
        assert_eq!(r.to_string(), "var{load.1[2]}");
        assert_eq!(Reference::Attr("reason".to_string()).to_string(), "attr{reason}");
    }
}
