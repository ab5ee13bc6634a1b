//! # Check Expressions
//!
//! A definition may carry a `check` expression that derives an integer error
//! code from each hormone's values. The language is deliberately tiny: field
//! names are read-only variables, statements are separated by `;` or
//! newlines, and nothing outside the bindings is reachable.
//!
//! ```text
//! stmt  := [let|var|const] ident '=' expr | expr
//! expr  := or ['?' expr ':' expr]
//! or    := and ('||' and)*
//! and   := eq ('&&' eq)*
//! eq    := rel (('==' | '!=' | '===' | '!==') rel)*
//! rel   := add (('<' | '<=' | '>' | '>=') add)*
//! add   := mul (('+' | '-') mul)*
//! mul   := unary (('*' | '/' | '%') unary)*
//! unary := ('!' | '-') unary | number | string | true | false | ident | '(' expr ')'
//! ```
//!
//! The result is `err` if assigned, else the last bare expression, else 0.
//! Booleans count as 1/0, numbers truncate toward zero and everything else
//! (strings, NaN, infinities) yields 0.

use crate::error::CheckError;
use crate::hormone::FieldValue;
use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::CharIndices;

/// Longest accepted check source, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Deepest accepted expression nesting.
pub const MAX_DEPTH: usize = 64;

/// Name whose assignment becomes the result.
const ERR_BINDING: &str = "err";

/// Runtime value with loose, script-like coercions.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
    Undefined,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Undefined => false,
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Undefined => f64::NAN,
            Value::Str(s) => {
                let t = s.trim();
                match t {
                    "" => 0.0,
                    "Infinity" | "+Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    // Rust accepts "inf"/"nan" spellings that are not numbers here
                    _ if t.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => {
                        f64::NAN
                    }
                    _ => t.parse().unwrap_or(f64::NAN),
                }
            }
        }
    }

    fn to_text(&self) -> String {
        match self {
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Undefined => "undefined".to_string(),
        }
    }

    fn error_code(&self) -> i64 {
        match self {
            Value::Number(n) if n.is_finite() => n.trunc() as i64,
            Value::Bool(b) => i64::from(*b),
            _ => 0,
        }
    }
}

impl From<&FieldValue> for Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Number(n) => Value::Number(*n),
            FieldValue::String(s) => Value::Str(s.clone()),
            FieldValue::Boolean(b) => Value::Bool(*b),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        n.to_string()
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Undefined, _) | (_, Value::Undefined) => false,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => a.to_number() == b.to_number(),
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Undefined, Value::Undefined) => true,
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => a.to_number().partial_cmp(&b.to_number()),
    }
}

// ----------------------------------------------------------------------------
// Lexer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Punct {
    LParen,
    RParen,
    Question,
    Colon,
    Bang,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    AndAnd,
    OrOr,
    Assign,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Declare,
    Punct(Punct),
    Newline,
    Semicolon,
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> CheckError {
    CheckError::Syntax {
        offset,
        message: message.into(),
    }
}

struct Lexer<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().map(|(_, c)| *c) == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, CheckError> {
        let mut tokens = Vec::new();

        while let Some((offset, c)) = self.chars.next() {
            let token = match c {
                ' ' | '\t' | '\r' => continue,
                '\n' => Token::Newline,
                ';' => Token::Semicolon,
                '0'..='9' | '.' => self.number(offset)?,
                '"' | '\'' => self.string(offset, c)?,
                c if c.is_ascii_alphabetic() || c == '_' || c == '$' => self.word(offset),
                _ => Token::Punct(self.punct(offset, c)?),
            };
            tokens.push(Spanned { token, offset });
        }

        tokens.push(Spanned {
            token: Token::Eof,
            offset: self.src.len(),
        });
        Ok(tokens)
    }

    fn take_digits(&mut self) -> usize {
        let mut count = 0;
        while self.chars.peek().is_some_and(|(_, c)| c.is_ascii_digit()) {
            self.chars.next();
            count += 1;
        }
        count
    }

    fn position(&mut self) -> usize {
        self.chars.peek().map_or(self.src.len(), |(i, _)| *i)
    }

    fn number(&mut self, start: usize) -> Result<Token, CheckError> {
        let digits = if self.src[start..].starts_with('.') {
            self.take_digits()
        } else {
            let mut digits = 1 + self.take_digits();
            if self.eat('.') {
                digits += self.take_digits();
            }
            digits
        };
        if digits == 0 {
            return Err(syntax(start, "expected digits"));
        }

        if self.eat('e') || self.eat('E') {
            if !self.eat('+') {
                self.eat('-');
            }
            if self.take_digits() == 0 {
                return Err(syntax(start, "malformed exponent"));
            }
        }

        let end = self.position();
        self.src[start..end]
            .parse()
            .map(Token::Number)
            .map_err(|_| syntax(start, "malformed number"))
    }

    fn string(&mut self, start: usize, quote: char) -> Result<Token, CheckError> {
        let mut text = String::new();
        loop {
            let Some((_, c)) = self.chars.next() else {
                return Err(syntax(start, "unterminated string"));
            };
            match c {
                c if c == quote => return Ok(Token::Str(text)),
                '\n' => return Err(syntax(start, "unterminated string")),
                '\\' => {
                    let Some((at, escaped)) = self.chars.next() else {
                        return Err(syntax(start, "unterminated string"));
                    };
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' | '\'' | '"' => escaped,
                        _ => return Err(syntax(at, format!("unknown escape `\\{escaped}`"))),
                    });
                }
                _ => text.push(c),
            }
        }
    }

    fn word(&mut self, start: usize) -> Token {
        while self
            .chars
            .peek()
            .is_some_and(|(_, c)| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        {
            self.chars.next();
        }
        let end = self.position();

        match &self.src[start..end] {
            "true" => Token::True,
            "false" => Token::False,
            "let" | "var" | "const" => Token::Declare,
            word => Token::Ident(word.to_string()),
        }
    }

    fn punct(&mut self, offset: usize, c: char) -> Result<Punct, CheckError> {
        let punct = match c {
            '(' => Punct::LParen,
            ')' => Punct::RParen,
            '?' => Punct::Question,
            ':' => Punct::Colon,
            '-' => Punct::Minus,
            '+' => Punct::Plus,
            '*' => Punct::Star,
            '/' => Punct::Slash,
            '%' => Punct::Percent,
            '<' if self.eat('=') => Punct::Le,
            '<' => Punct::Lt,
            '>' if self.eat('=') => Punct::Ge,
            '>' => Punct::Gt,
            '!' if self.eat('=') => {
                if self.eat('=') {
                    Punct::StrictNotEq
                } else {
                    Punct::NotEq
                }
            }
            '!' => Punct::Bang,
            '=' if self.eat('=') => {
                if self.eat('=') {
                    Punct::StrictEq
                } else {
                    Punct::EqEq
                }
            }
            '=' => Punct::Assign,
            '&' if self.eat('&') => Punct::AndAnd,
            '|' if self.eat('|') => Punct::OrOr,
            _ => return Err(syntax(offset, format!("unexpected character `{c}`"))),
        };
        Ok(punct)
    }
}

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Field(usize),
    Local(usize),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign(usize, Expr),
    Eval(Expr),
}

struct Parser<'a> {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    fields: &'a [String],
    locals: Vec<String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map_or(&Token::Eof, |spanned| &spanned.token)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.pos + ahead)
            .map_or(&Token::Eof, |spanned| &spanned.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |spanned| spanned.offset)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: Punct) -> bool {
        if *self.peek() == Token::Punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Line breaks inside an unfinished expression do not end the statement.
    fn skip_newlines(&mut self) {
        while *self.peek() == Token::Newline {
            self.pos += 1;
        }
    }

    /// A line that starts with a binary or ternary operator continues the
    /// previous one.
    fn continue_line(&mut self) {
        let mut ahead = self.pos;
        while self.tokens.get(ahead).map(|s| &s.token) == Some(&Token::Newline) {
            ahead += 1;
        }
        let continues = matches!(
            self.tokens.get(ahead).map(|s| &s.token),
            Some(Token::Punct(p)) if !matches!(p, Punct::LParen | Punct::Bang)
        );
        if continues {
            self.pos = ahead;
        }
    }

    fn expect(&mut self, punct: Punct, what: &str) -> Result<(), CheckError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected {what}")))
        }
    }

    fn enter(&mut self) -> Result<(), CheckError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CheckError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn program(&mut self) -> Result<Vec<Stmt>, CheckError> {
        let mut statements = Vec::new();
        loop {
            while matches!(self.peek(), Token::Newline | Token::Semicolon) {
                self.pos += 1;
            }
            if *self.peek() == Token::Eof {
                return Ok(statements);
            }

            statements.push(self.statement()?);

            match self.peek() {
                Token::Newline | Token::Semicolon | Token::Eof => {}
                _ => return Err(syntax(self.offset(), "expected `;` or end of line")),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, CheckError> {
        let declared = *self.peek() == Token::Declare;
        if declared {
            self.advance();
        }

        let assignment = match (self.peek(), self.peek_at(1)) {
            (Token::Ident(name), Token::Punct(Punct::Assign)) => Some(name.clone()),
            _ => None,
        };

        let Some(name) = assignment else {
            if declared {
                return Err(syntax(self.offset(), "expected assignment after declaration"));
            }
            return Ok(Stmt::Eval(self.expression()?));
        };

        if self.fields.contains(&name) {
            return Err(CheckError::AssignToField(name));
        }
        self.pos += 2;
        self.skip_newlines();
        let value = self.expression()?;

        let slot = match self.locals.iter().position(|local| *local == name) {
            Some(slot) => slot,
            None => {
                self.locals.push(name);
                self.locals.len() - 1
            }
        };
        Ok(Stmt::Assign(slot, value))
    }

    fn expression(&mut self) -> Result<Expr, CheckError> {
        self.enter()?;
        let condition = self.or()?;
        self.continue_line();
        let expr = if self.eat(Punct::Question) {
            self.skip_newlines();
            let then = self.expression()?;
            self.skip_newlines();
            self.expect(Punct::Colon, "`:`")?;
            self.skip_newlines();
            let otherwise = self.expression()?;
            Expr::Conditional(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };
        self.leave();
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, CheckError> {
        let mut left = self.and()?;
        while {
            self.continue_line();
            self.eat(Punct::OrOr)
        } {
            self.skip_newlines();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, CheckError> {
        let mut left = self.binary_level(0)?;
        while {
            self.continue_line();
            self.eat(Punct::AndAnd)
        } {
            self.skip_newlines();
            let right = self.binary_level(0)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Left-associative binary levels, loosest first.
    fn binary_level(&mut self, level: usize) -> Result<Expr, CheckError> {
        const LEVELS: [&[(Punct, BinaryOp)]; 4] = [
            &[
                (Punct::EqEq, BinaryOp::LooseEq),
                (Punct::NotEq, BinaryOp::LooseNe),
                (Punct::StrictEq, BinaryOp::StrictEq),
                (Punct::StrictNotEq, BinaryOp::StrictNe),
            ],
            &[
                (Punct::Lt, BinaryOp::Lt),
                (Punct::Le, BinaryOp::Le),
                (Punct::Gt, BinaryOp::Gt),
                (Punct::Ge, BinaryOp::Ge),
            ],
            &[(Punct::Plus, BinaryOp::Add), (Punct::Minus, BinaryOp::Sub)],
            &[
                (Punct::Star, BinaryOp::Mul),
                (Punct::Slash, BinaryOp::Div),
                (Punct::Percent, BinaryOp::Rem),
            ],
        ];

        let Some(operators) = LEVELS.get(level) else {
            return self.unary();
        };

        let mut left = self.binary_level(level + 1)?;
        loop {
            self.continue_line();
            let op = operators
                .iter()
                .find(|(punct, _)| *self.peek() == Token::Punct(*punct))
                .map(|(_, op)| *op);
            let Some(op) = op else {
                return Ok(left);
            };
            self.pos += 1;
            self.skip_newlines();
            let right = self.binary_level(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, CheckError> {
        self.skip_newlines();
        if self.eat(Punct::Bang) {
            self.enter()?;
            let operand = self.unary()?;
            self.leave();
            return Ok(Expr::Not(Box::new(operand)));
        }
        if self.eat(Punct::Minus) {
            self.enter()?;
            let operand = self.unary()?;
            self.leave();
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, CheckError> {
        let offset = self.offset();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Ident(name) => self.resolve(name),
            Token::Punct(Punct::LParen) => {
                self.skip_newlines();
                let inner = self.expression()?;
                self.skip_newlines();
                self.expect(Punct::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Eof => Err(syntax(offset, "unexpected end of expression")),
            other => Err(syntax(offset, format!("unexpected token {other:?}"))),
        }
    }

    fn resolve(&self, name: String) -> Result<Expr, CheckError> {
        if let Some(slot) = self.locals.iter().position(|local| *local == name) {
            return Ok(Expr::Local(slot));
        }
        if let Some(index) = self.fields.iter().position(|field| *field == name) {
            return Ok(Expr::Field(index));
        }
        Err(CheckError::UnknownIdentifier(name))
    }
}

// ----------------------------------------------------------------------------
// Program
// ----------------------------------------------------------------------------

/// A compiled check expression bound to a definition's field names.
#[derive(Debug, Clone)]
pub struct CheckProgram {
    source: String,
    statements: Vec<Stmt>,
    local_count: usize,
    err_slot: Option<usize>,
}

impl CheckProgram {
    /// Compile `source` against the ordered field names of a definition.
    pub fn compile(source: &str, fields: &[String]) -> Result<Self, CheckError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(CheckError::TooLong(MAX_SOURCE_LEN));
        }

        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            fields,
            locals: Vec::new(),
        };
        let statements = parser.program()?;
        let err_slot = parser.locals.iter().position(|local| local == ERR_BINDING);

        Ok(Self {
            source: source.to_string(),
            statements,
            local_count: parser.locals.len(),
            err_slot,
        })
    }

    /// Source text as it appears in the definition.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against values given in field order.
    pub fn evaluate(&self, values: &[FieldValue]) -> i64 {
        let fields: Vec<Value> = values.iter().map(Value::from).collect();
        let mut locals = vec![Value::Undefined; self.local_count];
        let mut last = None;

        for statement in &self.statements {
            match statement {
                Stmt::Assign(slot, expr) => {
                    let value = eval(expr, &fields, &locals);
                    if let Some(local) = locals.get_mut(*slot) {
                        *local = value;
                    }
                }
                Stmt::Eval(expr) => last = Some(eval(expr, &fields, &locals)),
            }
        }

        let result = match self.err_slot {
            Some(slot) => locals.get(slot).cloned(),
            None => last,
        };
        result.map_or(0, |value| value.error_code())
    }
}

fn eval(expr: &Expr, fields: &[Value], locals: &[Value]) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Field(index) => fields.get(*index).cloned().unwrap_or(Value::Undefined),
        Expr::Local(slot) => locals.get(*slot).cloned().unwrap_or(Value::Undefined),
        Expr::Not(operand) => Value::Bool(!eval(operand, fields, locals).truthy()),
        Expr::Neg(operand) => Value::Number(-eval(operand, fields, locals).to_number()),
        Expr::And(left, right) => {
            let left = eval(left, fields, locals);
            if left.truthy() {
                eval(right, fields, locals)
            } else {
                left
            }
        }
        Expr::Or(left, right) => {
            let left = eval(left, fields, locals);
            if left.truthy() {
                left
            } else {
                eval(right, fields, locals)
            }
        }
        Expr::Conditional(condition, then, otherwise) => {
            if eval(condition, fields, locals).truthy() {
                eval(then, fields, locals)
            } else {
                eval(otherwise, fields, locals)
            }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, fields, locals);
            let right = eval(right, fields, locals);
            binary(*op, &left, &right)
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                Value::Str(left.to_text() + &right.to_text())
            }
            _ => Value::Number(left.to_number() + right.to_number()),
        },
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Rem => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Lt => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::LooseEq => Value::Bool(loose_eq(left, right)),
        BinaryOp::LooseNe => Value::Bool(!loose_eq(left, right)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(left, right)),
        BinaryOp::StrictNe => Value::Bool(!strict_eq(left, right)),
    }
}
