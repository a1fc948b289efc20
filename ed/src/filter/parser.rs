//! Filter source compiler
//!
//! Conditions go through an explicit-stack shift-reduce pass: `!` binds
//! tightest, then comparisons, and `&&`, `||`, `^^` share one precedence and
//! fold strictly left to right, so `a && b || c` is `(a && b) || c` and
//! `a || b && c` is `(a || b) && c`.

use std::collections::HashMap;

use eddievent::{Value, is_valid_key, normalize_name, parse_value};
use regex::RegexBuilder;
use tracing::{debug, warn};

use super::ast::{Action, BinOp, Filter, JumpKind, LogLevel, Node, Predicate, Reference, Rule, Test};
use super::error::{FilterError, Result};
use super::lexer::{CmpKind, Token, literal_value, tokenize};

/// Depth of the operator stack and of the `gosub` call stack
pub const STACK_LIMIT: usize = 256;

/// Highest argument position an `arg[n] = v` action may write
pub const MAX_ARG_INDEX: usize = 255;

#[derive(Debug, Clone, Copy)]
enum StackOp {
    Not,
    Paren,
    Bin(BinOp),
}

struct ConditionParser {
    line: usize,
    ops: Vec<StackOp>,
    operands: Vec<Node>,
    expect_operand: bool,
}

impl ConditionParser {
    fn push(&mut self, op: StackOp) -> Result<()> {
        if self.ops.len() >= STACK_LIMIT {
            return Err(FilterError::StackOverflow {
                line: self.line,
                limit: STACK_LIMIT,
            });
        }
        self.ops.push(op);
        Ok(())
    }

    fn fail(&self, message: &str) -> FilterError {
        FilterError::syntax(self.line, message)
    }

    /// A finished operand: apply pending `!`, then fold into a pending operator
    fn reduce(&mut self, mut node: Node) -> Result<()> {
        if !self.expect_operand {
            return Err(self.fail("missing operator between operands"));
        }
        while let Some(StackOp::Not) = self.ops.last() {
            self.ops.pop();
            node = Node::Not(Box::new(node));
        }
        if let Some(StackOp::Bin(op)) = self.ops.last().copied() {
            self.ops.pop();
            let left = self.operands.pop().ok_or_else(|| self.fail("operator without left operand"))?;
            node = Node::Binary(op, Box::new(left), Box::new(node));
        }
        self.operands.push(node);
        self.expect_operand = false;
        Ok(())
    }

    fn finish(mut self) -> Result<Node> {
        if self.expect_operand {
            return Err(self.fail("condition ends without an operand"));
        }
        if !self.ops.is_empty() {
            return Err(self.fail("unbalanced '('"));
        }
        match (self.operands.pop(), self.operands.is_empty()) {
            (Some(node), true) => Ok(node),
            _ => Err(self.fail("malformed condition")),
        }
    }
}

/// Compile one condition into a tree
pub(crate) fn parse_condition(src: &str, line: usize) -> Result<Node> {
    let mut tokens = tokenize(src, line)?.into_iter().peekable();
    if tokens.peek().is_none() {
        return Err(FilterError::syntax(line, "empty condition"));
    }

    let mut p = ConditionParser {
        line,
        ops: Vec::new(),
        operands: Vec::new(),
        expect_operand: true,
    };
    let mut after_not = false;

    while let Some(token) = tokens.next() {
        let was_not = std::mem::take(&mut after_not);
        match token {
            Token::Not => {
                if !p.expect_operand {
                    return Err(p.fail("'!' after an operand"));
                }
                if was_not {
                    // `!!x` is `x`
                    p.ops.pop();
                } else {
                    p.push(StackOp::Not)?;
                    after_not = true;
                }
            }
            Token::LParen => {
                if !p.expect_operand {
                    return Err(p.fail("'(' after an operand"));
                }
                p.push(StackOp::Paren)?;
            }
            Token::RParen => {
                if p.expect_operand {
                    return Err(p.fail("empty group or dangling operator"));
                }
                let inner = p.operands.pop().ok_or_else(|| p.fail("malformed group"))?;
                match p.ops.pop() {
                    Some(StackOp::Paren) => {}
                    _ => return Err(p.fail("unbalanced ')'")),
                }
                p.expect_operand = true;
                p.reduce(inner)?;
            }
            Token::Bin(op) => {
                if p.expect_operand {
                    return Err(p.fail("operator without left operand"));
                }
                p.push(StackOp::Bin(op))?;
                p.expect_operand = true;
            }
            Token::Ref(reference) => {
                let test = match tokens.next_if(|t| matches!(t, Token::Cmp { .. })) {
                    Some(Token::Cmp { kind, case_sensitive }) => match tokens.next() {
                        Some(Token::Literal(literal)) => build_test(kind, case_sensitive, literal, line)?,
                        _ => return Err(p.fail("comparison without a value")),
                    },
                    _ => Test::Exists,
                };
                p.reduce(Node::Leaf(Predicate { reference, test }))?;
            }
            Token::Default => p.reduce(Node::Default)?,
            Token::Prev => p.reduce(Node::Prev)?,
            Token::Last => p.reduce(Node::Last)?,
            Token::Cmp { .. } => return Err(p.fail("comparison without a field")),
            Token::Literal(_) => return Err(p.fail("value without a comparison")),
        }
    }
    p.finish()
}

fn build_test(kind: CmpKind, case_sensitive: bool, literal: Value, line: usize) -> Result<Test> {
    match kind {
        CmpKind::Op(op) => Ok(Test::Compare {
            op,
            case_sensitive,
            literal,
        }),
        CmpKind::Match | CmpKind::NotMatch => {
            let pattern = literal.to_string();
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|source| FilterError::Regex { line, source })?;
            Ok(Test::Match {
                negate: kind == CmpKind::NotMatch,
                regex,
            })
        }
    }
}

/// Split on `sep` outside double quotes
fn split_unquoted<'a>(src: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let bytes = src.as_bytes();
    let mut in_quotes = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            _ if !in_quotes && bytes[i..].starts_with(sep.as_bytes()) => {
                parts.push(&src[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&src[start..]);
    parts
}

fn find_unquoted(src: &str, needle: &str) -> Option<usize> {
    let first = split_unquoted(src, needle).first().map(|s| s.len())?;
    (first < src.len()).then_some(first)
}

fn strip_comment(line: &str) -> &str {
    match find_unquoted(line, "//") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn leading_word(src: &str) -> (String, &str) {
    let end = src.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(src.len());
    (src[..end].to_ascii_lowercase(), &src[end..])
}

fn parse_action(src: &str, line: usize) -> Result<Action> {
    let (word, rest) = leading_word(src);
    let rest_trim = rest.trim();
    let no_operand = |action: Action| {
        if rest_trim.is_empty() {
            Ok(action)
        } else {
            Err(FilterError::syntax(line, format!("'{}' takes no operand", word)))
        }
    };

    match word.as_str() {
        "accept" => {
            if rest_trim.is_empty() {
                return Ok(Action::Accept {
                    target: None,
                    args: Vec::new(),
                });
            }
            let Some(target_def) = rest_trim.strip_prefix(':') else {
                return Err(FilterError::syntax(line, "expected ':' after accept"));
            };
            let mut fields = split_unquoted(target_def, ":").into_iter();
            let target = fields.next().map(str::trim).unwrap_or_default();
            let target = normalize_name(target)
                .map_err(|e| FilterError::syntax(line, format!("bad accept target: {}", e)))?
                .into_owned();
            let args = fields.map(|f| literal_value(f, line)).collect::<Result<Vec<_>>>()?;
            Ok(Action::Accept {
                target: Some(target),
                args,
            })
        }
        "reject" => no_operand(Action::Reject),
        "drop" => no_operand(Action::Drop),
        "return" => no_operand(Action::Return),
        "goto" | "gosub" | "branch" if !rest_trim.starts_with('=') => {
            let kind = match word.as_str() {
                "goto" => JumpKind::Goto,
                "gosub" => JumpKind::Gosub,
                _ => JumpKind::Branch,
            };
            if !is_label(rest_trim) {
                return Err(FilterError::syntax(line, format!("'{}' needs a label", word)));
            }
            Ok(Action::Jump {
                kind,
                label: rest_trim.to_string(),
                pc: usize::MAX,
            })
        }
        "error" | "warn" | "info" | "debug" | "trace" if rest_trim.starts_with('(') => {
            let level = match word.as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                _ => LogLevel::Trace,
            };
            let inner = rest_trim
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| FilterError::syntax(line, "unbalanced parentheses in log action"))?;
            let message = parse_value(inner.trim())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| FilterError::syntax(line, "log message must be a quoted string"))?;
            Ok(Action::Log(level, message))
        }
        _ => parse_assignment(src, line),
    }
}

/// `name = x`, `arg[n] = v`, `attr{k} = v`, `var{n.i[j]} = v`
fn parse_assignment(src: &str, line: usize) -> Result<Action> {
    let Some(eq) = find_unquoted(src, "=") else {
        return Err(FilterError::syntax(line, format!("unknown action '{}'", src)));
    };
    let (lhs, rhs) = (src[..eq].trim(), src[eq + 1..].trim());
    if rhs.is_empty() {
        return Err(FilterError::syntax(line, "assignment without a value"));
    }
    let mut tokens = tokenize(lhs, line)?;
    let reference = match (tokens.pop(), tokens.is_empty()) {
        (Some(Token::Ref(r)), true) => r,
        _ => return Err(FilterError::syntax(line, format!("cannot assign to '{}'", lhs))),
    };
    let value = literal_value(rhs, line)?;
    match reference {
        Reference::Name => {
            let name = value
                .as_str()
                .and_then(|s| normalize_name(s).ok())
                .ok_or_else(|| FilterError::syntax(line, format!("bad event name '{}'", rhs)))?;
            Ok(Action::SetName(name.into_owned()))
        }
        Reference::Arg(idx) if idx > MAX_ARG_INDEX => Err(FilterError::syntax(
            line,
            format!("argument index {} above {}", idx, MAX_ARG_INDEX),
        )),
        Reference::Arg(idx) => Ok(Action::SetArg(idx, value)),
        Reference::Attr(key) => {
            if !is_valid_key(&key) {
                return Err(FilterError::syntax(line, format!("bad attribute key '{}'", key)));
            }
            Ok(Action::SetAttr(key, value))
        }
        Reference::Var { name, idx1, idx2 } => Ok(Action::SetVar {
            name,
            idx1,
            idx2,
            value,
        }),
    }
}

fn is_label(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_')
}

/// Compile `condition => action; action`
pub(crate) fn parse_rule(src: &str, line: usize) -> Result<Rule> {
    let Some(arrow) = find_unquoted(src, "=>") else {
        return Err(FilterError::syntax(line, "missing '=>'"));
    };
    let condition = parse_condition(&src[..arrow], line)?;
    let actions = split_unquoted(&src[arrow + 2..], ";")
        .into_iter()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| parse_action(a, line))
        .collect::<Result<Vec<_>>>()?;
    if actions.is_empty() {
        return Err(FilterError::syntax(line, "rule without actions"));
    }
    Ok(Rule {
        condition,
        actions,
        line,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Any,
    In,
    Out,
}

#[derive(Default)]
struct SectionBuilder {
    seen: bool,
    rules: Vec<Rule>,
    labels: HashMap<String, usize>,
}

impl SectionBuilder {
    fn build(mut self) -> Result<Filter> {
        for rule in &mut self.rules {
            for action in &mut rule.actions {
                if let Action::Jump { label, pc, .. } = action {
                    *pc = *self.labels.get(label.as_str()).ok_or_else(|| FilterError::UnknownLabel {
                        line: rule.line,
                        label: label.clone(),
                    })?;
                }
            }
        }
        Ok(Filter {
            rules: self.rules,
            labels: self.labels,
        })
    }
}

/// Compiled sections; a direction without its own section uses `any`
pub(crate) struct Sections {
    pub any: Filter,
    pub input: Option<Filter>,
    pub output: Option<Filter>,
}

/// Compile a whole filter source
pub(crate) fn compile_source(src: &str, strict: bool) -> Result<Sections> {
    let mut builders = [
        SectionBuilder::default(),
        SectionBuilder::default(),
        SectionBuilder::default(),
    ];
    let mut section = Section::Any;
    let mut logical = String::new();
    let mut start_line = 0;
    let mut skipped = 0usize;

    let mut handle = |text: &str, line: usize, section: &mut Section| -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(name) = text.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            *section = match name.trim().to_ascii_lowercase().as_str() {
                "any" => Section::Any,
                "in" => Section::In,
                "out" => Section::Out,
                other => {
                    let err = FilterError::syntax(line, format!("unknown section '[{}]'", other));
                    if strict {
                        return Err(err);
                    }
                    warn!(line, error = %err, "compile_source: ignoring section header");
                    return Ok(());
                }
            };
            builders[*section as usize].seen = true;
            return Ok(());
        }
        let builder = &mut builders[*section as usize];
        if let Some(label) = text.strip_suffix(':').map(str::trim)
            && is_label(label)
        {
            if builder.labels.insert(label.to_string(), builder.rules.len()).is_some() {
                return Err(FilterError::DuplicateLabel {
                    line,
                    label: label.to_string(),
                });
            }
            return Ok(());
        }
        match parse_rule(text, line) {
            Ok(rule) => builder.rules.push(rule),
            Err(e) if e.is_soft() && !strict => {
                warn!(line, error = %e, "compile_source: skipping rule");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    };

    for (idx, raw) in src.lines().enumerate() {
        let code = strip_comment(raw);
        if logical.is_empty() {
            start_line = idx + 1;
        }
        if let Some(body) = code.trim_end().strip_suffix('\\') {
            logical.push_str(body);
            logical.push(' ');
            continue;
        }
        logical.push_str(code);
        let text = std::mem::take(&mut logical);
        handle(text.trim(), start_line, &mut section)?;
    }
    if !logical.is_empty() {
        let text = std::mem::take(&mut logical);
        handle(text.trim(), start_line, &mut section)?;
    }

    let [any, input, output] = builders;
    debug!(
        any = any.rules.len(),
        input = input.rules.len(),
        output = output.rules.len(),
        skipped,
        "compile_source: compiled"
    );
    Ok(Sections {
        any: any.build()?,
        input: if input.seen { Some(input.build()?) } else { None },
        output: if output.seen { Some(output.build()?) } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ast::CmpOp;

    fn shape(node: &Node) -> String {
        match node {
            Node::Leaf(p) => match &p.test {
                Test::Exists => p.reference.to_string(),
                Test::Compare { literal, .. } => format!("{}={}", p.reference, literal),
                Test::Match { negate, .. } => format!("{}{}", p.reference, if *negate { "!#" } else { "#" }),
            },
            Node::Binary(op, l, r) => format!("({} {:?} {})", shape(l), op, shape(r)),
            Node::Not(inner) => format!("!{}", shape(inner)),
            Node::Default => "default".to_string(),
            Node::Prev => "prev".to_string(),
            Node::Last => "last".to_string(),
        }
    }

    fn cond(src: &str) -> String {
        shape(&parse_condition(src, 1).unwrap())
    }

    #[test]
    fn test_left_to_right_fold() {
        assert_eq!(
            cond("arg[0]==1 && arg[1]==2 || arg[2]==3"),
            "((arg[0]=1 And arg[1]=2) Or arg[2]=3)"
        );
        assert_eq!(
            cond("arg[0]==1 || arg[1]==2 && arg[2]==3"),
            "((arg[0]=1 Or arg[1]=2) And arg[2]=3)"
        );
    }

    #[test]
    fn test_not_binds_tightest() {
        assert_eq!(cond("!name && attr{x}"), "(!name And attr{x})");
        assert_eq!(cond("!(name && attr{x})"), "!(name And attr{x})");
        assert_eq!(cond("name ^^ !attr{x}"), "(name Xor !attr{x})");
    }

    #[test]
    fn test_double_not_cancels() {
        assert_eq!(cond("!!name"), "name");
        assert_eq!(cond("!!!name"), "!name");
    }

    #[test]
    fn test_parens_group() {
        assert_eq!(cond("name || (attr{a} && attr{b})"), "(name Or (attr{a} And attr{b}))");
    }

    #[test]
    fn test_compare_literal() {
        let node = parse_condition("arg[1] ^>= 7", 1).unwrap();
        match node {
            Node::Leaf(Predicate {
                reference: Reference::Arg(1),
                test:
                    Test::Compare {
                        op: CmpOp::Ge,
                        case_sensitive: true,
                        literal: Value::Int(7),
                    },
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_condition_errors() {
        for bad in ["", "name &&", "&& name", "(name", "name)", "name attr{x}", "== 1", "()"] {
            let err = parse_condition(bad, 4).unwrap_err();
            assert!(matches!(err, FilterError::Syntax { line: 4, .. }), "{:?} gave {:?}", bad, err);
        }
    }

    #[test]
    fn test_stack_overflow() {
        let deep = format!("{}name{}", "(".repeat(STACK_LIMIT + 1), ")".repeat(STACK_LIMIT + 1));
        assert!(matches!(
            parse_condition(&deep, 2),
            Err(FilterError::StackOverflow { line: 2, .. })
        ));
        let ok = format!("{}name{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(cond(&ok), "name");
    }

    #[test]
    fn test_bad_regex() {
        assert!(matches!(parse_condition("name # \"(\"", 9), Err(FilterError::Regex { line: 9, .. })));
    }

    #[test]
    fn test_actions() {
        let rule = parse_rule(
            r#"name == ping => attr{seen} = &i1; arg[2] = "x;y"; name = Pong; var{n.1[2]} = 3; info("got it"); accept:replyto:&i7:"a""#,
            1,
        )
        .unwrap();
        assert_eq!(rule.actions.len(), 6);
        assert!(matches!(&rule.actions[0], Action::SetAttr(k, Value::Int(1)) if k == "seen"));
        assert!(matches!(&rule.actions[1], Action::SetArg(2, v) if v.as_str() == Some("x;y")));
        assert!(matches!(&rule.actions[2], Action::SetName(n) if n == "pong"));
        assert!(matches!(
            &rule.actions[3],
            Action::SetVar { name, idx1: Some(1), idx2: Some(2), value: Value::Int(3) } if name == "n"
        ));
        assert!(matches!(&rule.actions[4], Action::Log(LogLevel::Info, m) if m == "got it"));
        match &rule.actions[5] {
            Action::Accept { target, args } => {
                assert_eq!(target.as_deref(), Some("replyto"));
                assert_eq!(args, &vec![Value::Int(7), Value::str("a")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_action_errors() {
        assert!(parse_rule("name => ", 1).is_err());
        assert!(parse_rule("name accept", 1).is_err());
        assert!(parse_rule("name => reject now", 1).is_err());
        assert!(parse_rule("name => goto", 1).is_err());
        assert!(parse_rule("name => explode", 1).is_err());
        assert!(parse_rule("name => attr{a b} = 1", 1).is_err());
    }

    #[test]
    fn test_arg_index_limit() {
        let rule = parse_rule(&format!("name => arg[{}] = 1", MAX_ARG_INDEX), 1).unwrap();
        assert!(matches!(rule.actions[0], Action::SetArg(MAX_ARG_INDEX, _)));
        assert!(matches!(
            parse_rule("name == x => arg[50000000] = 1", 1),
            Err(FilterError::Syntax { line: 1, .. })
        ));
        assert!(compile_source("name == x => arg[4000000000] = 1\n", true).is_err());
        // reads stay unbounded
        assert!(parse_rule("arg[50000000] == 1 => drop", 1).is_ok());
    }

    #[test]
    fn test_comments_and_continuations() {
        let src = "// header\nname == ping \\\n  => reject // trailing\nattr{url} == \"http://x\" => drop\n";
        let sections = compile_source(src, true).unwrap();
        assert_eq!(sections.any.rules.len(), 2);
        assert_eq!(sections.any.rules[0].line, 2);
        assert_eq!(sections.any.rules[1].line, 4);
        assert!(sections.input.is_none());
    }

    #[test]
    fn test_non_ascii_outside_quotes() {
        let src = "// Übersicht\nname == \"x\" => drop // café\nname == naïve => reject\n";
        let sections = compile_source(src, true).unwrap();
        assert_eq!(sections.any.rules.len(), 2);
        assert_eq!(split_unquoted("é//ü//x", "//"), vec!["é", "ü", "x"]);
        assert_eq!(strip_comment("a == \"ü//\" // é"), "a == \"ü//\" ");
    }

    #[test]
    fn test_sections_and_labels() {
        let src = "[in]\nname == a => goto done\nname == b => drop\ndone:\ndefault => accept\n[out]\ndefault => reject\n";
        let sections = compile_source(src, true).unwrap();
        let input = sections.input.unwrap();
        assert_eq!(input.label("done"), Some(2));
        assert!(matches!(input.rules[0].actions[0], Action::Jump { pc: 2, .. }));
        assert_eq!(sections.output.unwrap().rules.len(), 1);
        assert!(sections.any.is_empty());
    }

    #[test]
    fn test_label_errors_are_hard() {
        assert!(matches!(
            compile_source("name => goto nowhere\n", false),
            Err(FilterError::UnknownLabel { line: 1, .. })
        ));
        assert!(matches!(
            compile_source("x:\nname => drop\nx:\n", false),
            Err(FilterError::DuplicateLabel { line: 3, .. })
        ));
    }

    #[test]
    fn test_soft_errors_skipped_unless_strict() {
        let src = "name === 1 => drop\nname => reject\n";
        let sections = compile_source(src, false).unwrap();
        assert_eq!(sections.any.rules.len(), 1);
        assert!(matches!(compile_source(src, true), Err(FilterError::Syntax { line: 1, .. })));
    }
}
