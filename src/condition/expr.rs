//! Default condition language.
//!
//! A small JavaScript-flavoured expression grammar:
//!
//! ```text
//! hasTask({status: 'running', 'data.book': task.data.book}) == false
//! countTasks({status: 'running', operation: task.operation}) < 2
//! !(task.uuid in beforeQueuedTasksUuids) && task.priority >= 0
//! ```
//!
//! `in` tests array membership, object keys, or substrings. Unknown
//! identifiers and property reads on `null` are errors; reading a missing
//! property yields `null`.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::{truthy, ConditionError, ConditionEvaluator, ConditionHelpers};

type Result<T> = std::result::Result<T, ConditionError>;

/// Parses and evaluates expressions on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &Value,
        helpers: &dyn ConditionHelpers,
    ) -> Result<Value> {
        let ast = Parser::new(tokenize(expression)?).parse()?;
        Scope { context, helpers }.eval(&ast)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

const PUNCTUATORS: [&str; 26] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{", "}", ",", ".", ":",
    "?", "!", "+", "-", "*", "/", "%", "<", ">",
];

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).map_or(false, char::is_ascii_digit)) {
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
                pos += 1;
                if pos < chars.len() && (chars[pos] == '+' || chars[pos] == '-') {
                    pos += 1;
                }
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            let text: String = chars[start..pos].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ConditionError::syntax(start, format!("invalid number {text}")))?;
            tokens.push((Token::Number(n), start));
            continue;
        }

        if c == '\'' || c == '"' {
            pos += 1;
            let mut text = String::new();
            loop {
                let Some(&ch) = chars.get(pos) else {
                    return Err(ConditionError::syntax(start, "unterminated string"));
                };
                pos += 1;
                match ch {
                    ch if ch == c => break,
                    '\\' => {
                        let escaped = chars
                            .get(pos)
                            .ok_or_else(|| ConditionError::syntax(start, "unterminated string"))?;
                        pos += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => *other,
                        });
                    }
                    ch => text.push(ch),
                }
            }
            tokens.push((Token::Str(text), start));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '$') {
                pos += 1;
            }
            tokens.push((Token::Ident(chars[start..pos].iter().collect()), start));
            continue;
        }

        let punct = PUNCTUATORS.iter().find(|p| {
            let len = p.chars().count();
            pos + len <= chars.len() && chars[pos..pos + len].iter().copied().eq(p.chars())
        });
        match punct {
            Some(p) => {
                pos += p.len();
                tokens.push((Token::Punct(*p), start));
            }
            None => return Err(ConditionError::syntax(start, format!("unexpected character '{c}'"))),
        }
    }

    tokens.push((Token::End, chars.len()));
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Plus(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::End, |(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |(_, p)| *p)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(ConditionError::syntax(
                self.position(),
                format!("expected '{punct}', found {:?}", self.peek()),
            ))
        }
    }

    fn parse(mut self) -> Result<Expr> {
        let expr = self.conditional()?;
        match self.peek() {
            Token::End => Ok(expr),
            other => Err(ConditionError::syntax(
                self.position(),
                format!("unexpected {other:?}"),
            )),
        }
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.or()?;
        if !self.eat("?") {
            return Ok(test);
        }
        let then = self.conditional()?;
        self.expect(":")?;
        let otherwise = self.conditional()?;
        Ok(Expr::Conditional(Box::new(test), Box::new(then), Box::new(otherwise)))
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat("||") {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat("&&") {
            left = Expr::And(Box::new(left), Box::new(self.equality()?));
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (text, op) in ops {
                let hit = match self.peek() {
                    Token::Punct(p) => p == text,
                    Token::Ident(word) => word == text,
                    _ => false,
                };
                if hit {
                    self.advance();
                    left = Expr::Binary(*op, Box::new(left), Box::new(next(self)?));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNe),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
                ("in", BinaryOp::In),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat("!") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat("+") {
            return Ok(Expr::Plus(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                let position = self.position();
                match self.advance() {
                    Token::Ident(name) => {
                        expr = Expr::Member(Box::new(expr), Box::new(Expr::Literal(Value::String(name))))
                    }
                    other => {
                        return Err(ConditionError::syntax(
                            position,
                            format!("expected property name, found {other:?}"),
                        ))
                    }
                }
            } else if self.eat("[") {
                let key = self.conditional()?;
                self.expect("]")?;
                expr = Expr::Member(Box::new(expr), Box::new(key));
            } else if matches!(self.peek(), Token::Punct("(")) {
                let Expr::Ident(name) = expr else {
                    return Err(ConditionError::syntax(self.position(), "only named functions can be called"));
                };
                self.advance();
                let args = self.list(")")?;
                expr = Expr::Call(name, args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn list(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.conditional()?);
            if !self.eat(",") {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr> {
        let position = self.position();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(word) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(word),
            }),
            Token::Punct("(") => {
                let inner = self.conditional()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::Array(self.list("]")?)),
            Token::Punct("{") => self.object(),
            other => Err(ConditionError::syntax(position, format!("unexpected {other:?}"))),
        }
    }

    fn object(&mut self) -> Result<Expr> {
        let mut entries = Vec::new();
        while !self.eat("}") {
            let position = self.position();
            let key = match self.advance() {
                Token::Ident(name) | Token::Str(name) => name,
                Token::Number(n) => js_string(&number(n)),
                other => {
                    return Err(ConditionError::syntax(position, format!("invalid object key {other:?}")))
                }
            };
            self.expect(":")?;
            entries.push((key, self.conditional()?));
            if !self.eat(",") {
                self.expect("}")?;
                break;
            }
        }
        Ok(Expr::Object(entries))
    }
}

struct Scope<'a> {
    context: &'a Value,
    helpers: &'a dyn ConditionHelpers,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self
                .context
                .get(name)
                .cloned()
                .ok_or_else(|| ConditionError::UnknownIdentifier(name.clone())),
            Expr::Array(items) => items.iter().map(|item| self.eval(item)).collect::<Result<Vec<_>>>().map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Member(object, key) => member(self.eval(object)?, &self.eval(key)?),
            Expr::Call(name, args) => self.call(name, args),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Neg(inner) => Ok(number(-to_number(&self.eval(inner)?))),
            Expr::Plus(inner) => Ok(number(to_number(&self.eval(inner)?))),
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional(test, then, otherwise) => {
                if truthy(&self.eval(test)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Binary(op, left, right) => binary(*op, self.eval(left)?, self.eval(right)?),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Value> {
        let query = match args {
            [query] => self.eval(query)?,
            _ => return Err(ConditionError::type_error(format!("{name} expects exactly one argument"))),
        };
        if !query.is_object() {
            return Err(ConditionError::type_error(format!("{name} expects a query object")));
        }
        match name {
            "hasTask" => Ok(Value::Bool(self.helpers.has_task(&query)?)),
            "countTasks" => Ok(Value::from(self.helpers.count_tasks(&query)?)),
            other => Err(ConditionError::UnknownFunction(other.to_string())),
        }
    }
}

fn member(object: Value, key: &Value) -> Result<Value> {
    let name = js_string(key);
    match object {
        Value::Null => Err(ConditionError::type_error(format!(
            "cannot read property '{name}' of null"
        ))),
        Value::Object(mut map) => Ok(map.remove(&name).unwrap_or(Value::Null)),
        Value::Array(mut items) => {
            if name == "length" {
                return Ok(Value::from(items.len()));
            }
            match key.as_u64() {
                Some(i) if (i as usize) < items.len() => Ok(items.swap_remove(i as usize)),
                _ => Ok(Value::Null),
            }
        }
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    let arithmetic = |f: fn(f64, f64) -> f64| number(f(to_number(&left), to_number(&right)));
    Ok(match op {
        BinaryOp::Add if left.is_string() || right.is_string() => {
            Value::String(js_string(&left) + &js_string(&right))
        }
        BinaryOp::Add => arithmetic(|a, b| a + b),
        BinaryOp::Sub => arithmetic(|a, b| a - b),
        BinaryOp::Mul => arithmetic(|a, b| a * b),
        BinaryOp::Div => arithmetic(|a, b| a / b),
        BinaryOp::Rem => arithmetic(|a, b| a % b),
        BinaryOp::StrictEq => Value::Bool(strict_equals(&left, &right)),
        BinaryOp::StrictNe => Value::Bool(!strict_equals(&left, &right)),
        BinaryOp::Eq => Value::Bool(loose_equals(&left, &right)),
        BinaryOp::Ne => Value::Bool(!loose_equals(&left, &right)),
        BinaryOp::Lt => Value::Bool(relate(&left, &right) == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(relate(&left, &right), Some(Ordering::Less | Ordering::Equal))),
        BinaryOp::Gt => Value::Bool(relate(&left, &right) == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(relate(&left, &right), Some(Ordering::Greater | Ordering::Equal))),
        BinaryOp::In => Value::Bool(match &right {
            Value::Array(items) => items.iter().any(|item| strict_equals(&left, item)),
            Value::Object(map) => map.contains_key(&js_string(&left)),
            Value::String(s) => s.contains(&js_string(&left)),
            other => {
                return Err(ConditionError::type_error(format!(
                    "cannot use 'in' on {}",
                    js_string(other)
                )))
            }
        }),
    })
}

fn relate(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => to_number(left).partial_cmp(&to_number(right)),
    }
}

fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_) | Value::String(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_))
        | (Value::Number(_) | Value::Bool(_), Value::String(_)) => to_number(a) == to_number(b),
        _ => strict_equals(a, b),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn js_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{f:.0}"),
            _ => n.to_string(),
        },
        Value::Array(items) => items.iter().map(js_string).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}
