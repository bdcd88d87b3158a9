//! The built-in `simple` data model.
//!
//! Expressions read the session data store through `ctx.` paths and the
//! current event through `_event.` paths:
//!
//! - `ctx.field` - truthy check, nested paths with `ctx.a.b.0`
//! - `ctx.field == value`, `!=`, `>`, `>=`, `<`, `<=` - comparisons; the right
//!   hand side may be a literal or another path
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)` - logic, `&&` binds tighter
//! - `In('state')` - active configuration check
//! - `ctx.count + 1`, `"id-" + _event.data.n` - arithmetic and concatenation
//! - literals: numbers, `"strings"`, `'strings'`, `true`, `false`, `null`,
//!   `undefined`, JSON arrays and objects
//! - `_sessionid`, `_name`, `_event.name`, `_event.data.x`, `_event.invokeid`
//!
//! Scripts are `;` or newline separated assignments: `ctx.a = 1; ctx.b = ctx.a + 1`.

use crate::error::EvalError;
use crate::expr::{
    ConditionEvaluator, ExecutionContext, ExpressionBinding, LocationEvaluator, ScriptEvaluator,
    ValueEvaluator,
};
use rstchart_value::{DataValue, ValueError};
use std::cmp::Ordering;
use std::sync::Arc;

/// Binding for the `simple` data model.
#[derive(Debug, Default)]
pub struct SimpleBinding;

impl ExpressionBinding for SimpleBinding {
    fn name(&self) -> &str {
        "simple"
    }

    fn compile_value(&self, source: &str) -> Result<Arc<dyn ValueEvaluator>, EvalError> {
        Ok(Arc::new(Operand::parse(source)?))
    }

    fn compile_condition(&self, source: &str) -> Result<Arc<dyn ConditionEvaluator>, EvalError> {
        Ok(Arc::new(Condition::parse(source)?))
    }

    fn compile_location(&self, source: &str) -> Result<Arc<dyn LocationEvaluator>, EvalError> {
        Ok(Arc::new(Location::parse(source)?))
    }

    fn compile_script(&self, body: &str) -> Result<Arc<dyn ScriptEvaluator>, EvalError> {
        Ok(Arc::new(Script::parse(body)?))
    }

    fn data_location(&self, id: &str) -> Result<Arc<dyn LocationEvaluator>, EvalError> {
        if id.is_empty() || !id.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(EvalError::Location(id.to_string()));
        }
        Ok(Arc::new(Location(Path {
            root: Root::Ctx,
            segments: vec![id.to_string()],
        })))
    }

    fn location_name(&self, source: &str) -> String {
        let source = source.trim();
        source.strip_prefix("ctx.").unwrap_or(source).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Ctx,
    Event,
    SessionId,
    Name,
}

#[derive(Debug, Clone, PartialEq)]
struct Path {
    root: Root,
    segments: Vec<String>,
}

impl Path {
    fn read(&self, ctx: &dyn ExecutionContext) -> DataValue {
        let rest = self.segments.join(".");
        match self.root {
            Root::Ctx => DataValue::Object(ctx.data().clone()).path(&rest),
            // Event payloads are frozen; reads hand out private copies.
            Root::Event => match ctx.event() {
                Some(event) => event.to_value().path(&rest).deep_clone(false),
                None => DataValue::Undefined,
            },
            Root::SessionId => DataValue::from(ctx.session_id()),
            Root::Name => ctx.name().map(DataValue::from).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
}

/// A value-producing expression.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(DataValue),
    Path(Path),
    Arith(Box<Operand>, ArithOp, Box<Operand>),
}

impl Operand {
    fn parse(source: &str) -> Result<Self, EvalError> {
        let mut parser = Parser::new(source)?;
        let operand = parser.parse_operand()?;
        parser.expect_end()?;
        Ok(operand)
    }

    fn eval(&self, ctx: &dyn ExecutionContext) -> Result<DataValue, EvalError> {
        match self {
            // Literals are shared by every session using the model.
            Operand::Literal(value) => Ok(value.deep_clone(false)),
            Operand::Path(path) => Ok(path.read(ctx)),
            Operand::Arith(left, op, right) => {
                let (l, r) = (left.eval(ctx)?, right.eval(ctx)?);
                match (op, &l, &r) {
                    (ArithOp::Add, DataValue::Number(a), DataValue::Number(b)) => {
                        Ok(DataValue::Number(a + b))
                    }
                    (ArithOp::Sub, DataValue::Number(a), DataValue::Number(b)) => {
                        Ok(DataValue::Number(a - b))
                    }
                    (ArithOp::Add, DataValue::String(_), _)
                    | (ArithOp::Add, _, DataValue::String(_)) => {
                        Ok(DataValue::String(format!("{}{}", l, r)))
                    }
                    _ => Err(EvalError::Runtime(format!(
                        "cannot apply {:?} to {} and {}",
                        op,
                        l.type_name(),
                        r.type_name()
                    ))),
                }
            }
        }
    }
}

impl ValueEvaluator for Operand {
    fn evaluate(&self, ctx: &dyn ExecutionContext) -> Result<DataValue, EvalError> {
        self.eval(ctx)
    }
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Truthy(Operand),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
    Gt(Operand, Operand),
    Ge(Operand, Operand),
    Lt(Operand, Operand),
    Le(Operand, Operand),
    In(String),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    fn parse(source: &str) -> Result<Self, EvalError> {
        let mut parser = Parser::new(source)?;
        let cond = parser.parse_or()?;
        parser.expect_end()?;
        Ok(cond)
    }

    fn eval(&self, ctx: &dyn ExecutionContext) -> Result<bool, EvalError> {
        Ok(match self {
            Condition::Truthy(op) => op.eval(ctx)?.is_truthy(),
            Condition::Eq(l, r) => values_equal(&l.eval(ctx)?, &r.eval(ctx)?),
            Condition::Ne(l, r) => !values_equal(&l.eval(ctx)?, &r.eval(ctx)?),
            Condition::Gt(l, r) => compare(&l.eval(ctx)?, &r.eval(ctx)?) == Some(Ordering::Greater),
            Condition::Ge(l, r) => matches!(
                compare(&l.eval(ctx)?, &r.eval(ctx)?),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(l, r) => compare(&l.eval(ctx)?, &r.eval(ctx)?) == Some(Ordering::Less),
            Condition::Le(l, r) => matches!(
                compare(&l.eval(ctx)?, &r.eval(ctx)?),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::In(state) => ctx.in_state(state),
            Condition::And(l, r) => l.eval(ctx)? && r.eval(ctx)?,
            Condition::Or(l, r) => l.eval(ctx)? || r.eval(ctx)?,
            Condition::Not(inner) => !inner.eval(ctx)?,
        })
    }
}

impl ConditionEvaluator for Condition {
    fn evaluate(&self, ctx: &dyn ExecutionContext) -> Result<bool, EvalError> {
        self.eval(ctx)
    }
}

fn values_equal(a: &DataValue, b: &DataValue) -> bool {
    match (a, b) {
        (x, y) if x.is_null_or_undefined() && y.is_null_or_undefined() => true,
        (DataValue::Number(a), DataValue::Number(b)) => (a - b).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare(a: &DataValue, b: &DataValue) -> Option<Ordering> {
    match (a, b) {
        (DataValue::Number(a), DataValue::Number(b)) => a.partial_cmp(b),
        (DataValue::String(a), DataValue::String(b)) => Some(a.cmp(b)),
        (DataValue::DateTime(a), DataValue::DateTime(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// An assignable `ctx.` path.
#[derive(Debug, Clone, PartialEq)]
struct Location(Path);

impl Location {
    fn parse(source: &str) -> Result<Self, EvalError> {
        match Operand::parse(source) {
            Ok(Operand::Path(path)) if path.root == Root::Ctx && !path.segments.is_empty() => {
                Ok(Location(path))
            }
            _ => Err(EvalError::Location(source.trim().to_string())),
        }
    }
}

impl LocationEvaluator for Location {
    fn assign(&self, ctx: &dyn ExecutionContext, value: DataValue) -> Result<(), EvalError> {
        let (last, parents) = self
            .0
            .segments
            .split_last()
            .ok_or_else(|| EvalError::Location("ctx".to_string()))?;

        let mut container = DataValue::Object(ctx.data().clone());
        for segment in parents {
            container = container.path(segment);
        }

        match &container {
            DataValue::Object(obj) => obj.set(last.clone(), value)?,
            DataValue::Array(arr) => {
                let index = last
                    .parse::<usize>()
                    .map_err(|_| EvalError::Location(self.0.segments.join(".")))?;
                arr.set(index, value)?;
            }
            other => {
                return Err(EvalError::Value(ValueError::TypeMismatch {
                    expected: "object",
                    found: other.type_name(),
                }))
            }
        }
        Ok(())
    }

    fn read(&self, ctx: &dyn ExecutionContext) -> Result<DataValue, EvalError> {
        Ok(self.0.read(ctx))
    }
}

/// A sequence of assignments.
#[derive(Debug, Clone, PartialEq)]
struct Script(Vec<(Location, Operand)>);

impl Script {
    fn parse(body: &str) -> Result<Self, EvalError> {
        let mut statements = Vec::new();
        for stmt in body.split(|c| c == ';' || c == '\n') {
            let stmt = stmt.trim();
            if stmt.is_empty() || stmt.starts_with("//") {
                continue;
            }
            let eq = find_assignment(stmt).ok_or_else(|| EvalError::Syntax {
                source_text: stmt.to_string(),
                reason: "expected 'location = expression'".to_string(),
            })?;
            let location = Location::parse(&stmt[..eq])?;
            let operand = Operand::parse(&stmt[eq + 1..])?;
            statements.push((location, operand));
        }
        Ok(Script(statements))
    }
}

impl ScriptEvaluator for Script {
    fn execute(&self, ctx: &dyn ExecutionContext) -> Result<(), EvalError> {
        for (location, operand) in &self.0 {
            let value = operand.eval(ctx)?;
            location.assign(ctx, value)?;
        }
        Ok(())
    }
}

/// Byte index of a lone `=` outside string literals.
fn find_assignment(stmt: &str) -> Option<usize> {
    let bytes = stmt.as_bytes();
    let mut quote = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'=' => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                if next != b'=' && !matches!(prev, b'=' | b'!' | b'<' | b'>') {
                    return Some(i);
                }
            }
            None => {}
        }
    }
    None
}

/// Recursive descent parser shared by values, conditions and locations.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, EvalError> {
        if input.trim().is_empty() {
            return Err(EvalError::Syntax {
                source_text: input.to_string(),
                reason: "empty expression".to_string(),
            });
        }
        Ok(Self { input, pos: 0 })
    }

    fn error(&self, reason: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            source_text: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn expect_end(&mut self) -> Result<(), EvalError> {
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.error(format!(
                "unexpected trailing input '{}'",
                &self.input[self.pos..]
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Condition, EvalError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, EvalError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, EvalError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Condition::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, EvalError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let cond = self.parse_or()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(cond);
        }

        if self.peek_str("In(") {
            self.pos += 3;
            self.skip_whitespace();
            let state = match self.parse_term()? {
                Operand::Literal(DataValue::String(s)) => s,
                _ => return Err(self.error("In() expects a quoted state id")),
            };
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(self.error("expected ')' after In("));
            }
            self.pos += 1;
            return Ok(Condition::In(state));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition, EvalError> {
        let left = self.parse_operand()?;
        self.skip_whitespace();

        let ops: [(&str, fn(Operand, Operand) -> Condition); 6] = [
            ("==", Condition::Eq),
            ("!=", Condition::Ne),
            (">=", Condition::Ge),
            ("<=", Condition::Le),
            (">", Condition::Gt),
            ("<", Condition::Lt),
        ];
        for (token, build) in ops {
            if self.peek_str(token) {
                self.pos += token.len();
                let right = self.parse_operand()?;
                return Ok(build(left, right));
            }
        }

        Ok(Condition::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, EvalError> {
        let mut left = self.parse_term()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => ArithOp::Add,
                Some('-') => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Operand::Arith(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Operand, EvalError> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];

        match self.peek_char() {
            None => Err(self.error("unexpected end of expression")),
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_operand()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(q @ ('"' | '\'')) => self.parse_string(q),
            Some('[' | '{') => self.parse_json(),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => {
                let n = self.parse_number()?;
                Ok(Operand::Literal(DataValue::Number(n)))
            }
            Some(_) => {
                for (word, value) in [
                    ("true", DataValue::Boolean(true)),
                    ("false", DataValue::Boolean(false)),
                    ("null", DataValue::Null),
                    ("undefined", DataValue::Undefined),
                ] {
                    if rest.starts_with(word) && !is_ident_char(rest[word.len()..].chars().next())
                    {
                        self.pos += word.len();
                        return Ok(Operand::Literal(value));
                    }
                }
                self.parse_path().map(Operand::Path)
            }
        }
    }

    fn parse_path(&mut self) -> Result<Path, EvalError> {
        let start = self.pos;
        while is_ident_char(self.peek_char()) || self.peek_char() == Some('.') {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        if text.is_empty() {
            return Err(self.error(format!(
                "unexpected character '{}'",
                self.peek_char().unwrap_or(' ')
            )));
        }

        let mut parts = text.split('.');
        let root = match parts.next() {
            Some("ctx") => Root::Ctx,
            Some("_event") => Root::Event,
            Some("_sessionid") => Root::SessionId,
            Some("_name") => Root::Name,
            Some(other) => {
                return Err(self.error(format!(
                    "unknown root '{}', expected ctx, _event, _sessionid or _name",
                    other
                )))
            }
            None => return Err(self.error("empty path")),
        };
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(self.error(format!("empty field name in '{}'", text)));
        }
        if root == Root::Ctx && segments.is_empty() && text.ends_with('.') {
            return Err(self.error("empty field name"));
        }
        Ok(Path { root, segments })
    }

    fn parse_string(&mut self, quote: char) -> Result<Operand, EvalError> {
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(Operand::Literal(DataValue::String(out)));
            }
            if c == '\\' {
                let escaped = self
                    .peek_char()
                    .ok_or_else(|| self.error("unterminated string"))?;
                self.pos += escaped.len_utf8();
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }
        Err(self.error("unterminated string"))
    }

    fn parse_json(&mut self) -> Result<Operand, EvalError> {
        let rest = &self.input[self.pos..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(json)) => {
                self.pos += stream.byte_offset();
                let value = DataValue::from_json(&json);
                value.freeze();
                Ok(Operand::Literal(value))
            }
            Some(Err(e)) => Err(self.error(format!("invalid JSON literal: {}", e))),
            None => Err(self.error("expected JSON literal")),
        }
    }

    fn parse_number(&mut self) -> Result<f64, EvalError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number: '{}'", num_str)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn is_ident_char(c: Option<char>) -> bool {
    matches!(c, Some(c) if c.is_alphanumeric() || c == '_')
}
