//! `when` 条件式の評価
//!
//! # 責務
//!
//! - `${EXPR}` 形式の条件文字列を字句解析・構文解析（再帰下降）
//! - 実行コンテキストに対して評価し、真偽値と参照した値の一覧を返す
//!
//! # 文法（優先順位: 低 → 高）
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ("===" | "!==" | "==" | "!=" | "<" | ">" | "<=" | ">=") unary )*
//! unary   := "!" unary | chain
//! chain   := primary ( "." IDENT [ "(" args ")" ] | "[" or "]" )*
//! primary := STRING | NUMBER | true | false | null | steps | variables | "(" or ")"
//! ```
//!
//! `&&` / `||` は短絡評価を行いません。両辺とも常に評価されるため、
//! 右辺の参照エラーは左辺の値に関わらず条件エラーになります。
//!
//! # 使用例
//!
//! ```rust
//! use adw_supervisor::engine::ExecutionContext;
//! use adw_supervisor::expression::condition::evaluate;
//!
//! let mut ctx = ExecutionContext::new("run-1", "example");
//! ctx.set_variable("mode", serde_json::json!("strict"));
//!
//! let result = evaluate("${variables.mode === 'strict' && true}", &ctx);
//! assert!(result.evaluated);
//! assert!(result.error.is_none());
//! assert_eq!(result.context_values["variables.mode"], serde_json::json!("strict"));
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Number, Value};

use crate::error::{ConditionError, ReferenceError};
use super::reference::{ReferenceRoot, VariableReference, DEFAULT_FIELD};
use super::resolver::{resolve_reference, stringify, traverse, ReferenceScope};

/// 条件評価の結果
///
/// 構文エラーや参照エラーは `evaluated = false` と `error` に変換され、
/// 評価器の外に伝播しません。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionEvaluation {
    /// 評価した条件文字列
    pub condition: String,
    /// 評価結果（エラー時は false）
    pub evaluated: bool,
    /// 評価中に実際に参照したコンテキストの値（監査用）
    pub context_values: BTreeMap<String, Value>,
    /// エラーメッセージ
    pub error: Option<String>,
}

impl ConditionEvaluation {
    /// 評価がエラーになったか
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// 条件文字列を評価する
pub fn evaluate<S>(condition: &str, scope: &S) -> ConditionEvaluation
where
    S: ReferenceScope + ?Sized,
{
    let mut evaluator = Evaluator {
        scope,
        reads: BTreeMap::new(),
    };

    let outcome = parse(condition).and_then(|expr| {
        let operand = evaluator.eval(&expr)?;
        let value = evaluator.force(operand)?;
        Ok(truthy(&value))
    });

    match outcome {
        Ok(evaluated) => ConditionEvaluation {
            condition: condition.to_string(),
            evaluated,
            context_values: evaluator.reads,
            error: None,
        },
        Err(e) => ConditionEvaluation {
            condition: condition.to_string(),
            evaluated: false,
            context_values: evaluator.reads,
            error: Some(e.to_string()),
        },
    }
}

/// 条件文字列を構文木に変換する
pub fn parse(condition: &str) -> Result<Expr, ConditionError> {
    let inner = unwrap_condition(condition)?;
    let tokens = tokenize(inner)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(extra) => Err(ConditionError::UnexpectedToken {
            position: extra.position,
            found: extra.token.describe(),
        }),
    }
}

/// 条件中で参照されているステップIDを出現順に列挙する（静的な依存関係解析用）
///
/// 字句解析に失敗した場合は空を返します（構文エラーは評価時に報告される）。
pub fn referenced_steps(condition: &str) -> Vec<String> {
    let inner = unwrap_condition(condition).unwrap_or(condition);
    let tokens = match tokenize(inner) {
        Ok(tokens) => tokens,
        Err(_) => return Vec::new(),
    };

    let mut ids: Vec<String> = Vec::new();
    for window in tokens.windows(3) {
        if let [first, second, third] = window
            && first.token == Token::Ident("steps".to_string())
            && second.token == Token::Dot
            && let Token::Ident(id) = &third.token
            && !ids.contains(id)
        {
            ids.push(id.clone());
        }
    }
    ids
}

/// 条件中で読み取られる変数名を出現順に列挙する
///
/// `variables.NAME` と、出力以外のフィールドを指す `steps.ID.NAME` が対象です。
pub fn referenced_variables(condition: &str) -> Vec<String> {
    let inner = unwrap_condition(condition).unwrap_or(condition);
    let tokens = match tokenize(inner) {
        Ok(tokens) => tokens,
        Err(_) => return Vec::new(),
    };

    let mut names: Vec<String> = Vec::new();
    for index in 0..tokens.len() {
        let name = match ident_at(&tokens, index) {
            Some("variables") if dot_at(&tokens, index + 1) => ident_at(&tokens, index + 2),
            Some("steps")
                if dot_at(&tokens, index + 1)
                    && ident_at(&tokens, index + 2).is_some()
                    && dot_at(&tokens, index + 3) =>
            {
                ident_at(&tokens, index + 4).filter(|field| *field != DEFAULT_FIELD)
            }
            _ => None,
        };
        if let Some(name) = name
            && !names.iter().any(|known| known == name)
        {
            names.push(name.to_string());
        }
    }
    names
}

fn ident_at(tokens: &[Spanned], index: usize) -> Option<&str> {
    match tokens.get(index).map(|spanned| &spanned.token) {
        Some(Token::Ident(name)) => Some(name.as_str()),
        _ => None,
    }
}

fn dot_at(tokens: &[Spanned], index: usize) -> bool {
    matches!(tokens.get(index).map(|spanned| &spanned.token), Some(Token::Dot))
}

fn unwrap_condition(condition: &str) -> Result<&str, ConditionError> {
    let trimmed = condition.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| ConditionError::MissingWrapper(condition.to_string()))
}

// ---------------------------------------------------------------------------
// 字句解析
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    And,
    Or,
    Cmp(CompareOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("'{s}'"),
            Token::Num(n) => n.to_string(),
            Token::Dot => ".".into(),
            Token::Comma => ",".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::Not => "!".into(),
            Token::And => "&&".into(),
            Token::Or => "||".into(),
            Token::Cmp(op) => op.as_str().into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let at = |i: usize| chars.get(i).map(|&(_, c)| c);

    while let Some(&(position, c)) = chars.get(i) {
        let push = |tokens: &mut Vec<Spanned>, token| tokens.push(Spanned { token, position });

        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                push(&mut tokens, Token::Dot);
                i += 1;
            }
            ',' => {
                push(&mut tokens, Token::Comma);
                i += 1;
            }
            '(' => {
                push(&mut tokens, Token::LParen);
                i += 1;
            }
            ')' => {
                push(&mut tokens, Token::RParen);
                i += 1;
            }
            '[' => {
                push(&mut tokens, Token::LBracket);
                i += 1;
            }
            ']' => {
                push(&mut tokens, Token::RBracket);
                i += 1;
            }
            '&' if at(i + 1) == Some('&') => {
                push(&mut tokens, Token::And);
                i += 2;
            }
            '|' if at(i + 1) == Some('|') => {
                push(&mut tokens, Token::Or);
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next = at(i + 1);
                let next2 = at(i + 2);
                let (token, len) = match (c, next, next2) {
                    ('=', Some('='), Some('=')) => (Token::Cmp(CompareOp::StrictEq), 3),
                    ('!', Some('='), Some('=')) => (Token::Cmp(CompareOp::StrictNe), 3),
                    ('=', Some('='), _) => (Token::Cmp(CompareOp::Eq), 2),
                    ('!', Some('='), _) => (Token::Cmp(CompareOp::Ne), 2),
                    ('<', Some('='), _) => (Token::Cmp(CompareOp::Le), 2),
                    ('>', Some('='), _) => (Token::Cmp(CompareOp::Ge), 2),
                    ('<', _, _) => (Token::Cmp(CompareOp::Lt), 1),
                    ('>', _, _) => (Token::Cmp(CompareOp::Gt), 1),
                    ('!', _, _) => (Token::Not, 1),
                    _ => {
                        return Err(ConditionError::UnexpectedToken {
                            position,
                            found: c.to_string(),
                        });
                    }
                };
                push(&mut tokens, token);
                i += len;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while let Some(ch) = at(j) {
                    match ch {
                        '\\' => {
                            if let Some(escaped) = at(j + 1) {
                                value.push(match escaped {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                            }
                            j += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        ch => {
                            value.push(ch);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString(position));
                }
                push(&mut tokens, Token::Str(value));
                i = j;
            }
            c if c.is_ascii_digit() || c == '-' && at(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                let mut j = i + 1;
                while let Some(n) = at(j) {
                    let fraction = n == '.' && at(j + 1).is_some_and(|d| d.is_ascii_digit());
                    if !(n.is_ascii_digit() || fraction) {
                        break;
                    }
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|&(_, ch)| ch).collect();
                let number = text.parse::<f64>().map_err(|_| ConditionError::UnexpectedToken {
                    position,
                    found: text.clone(),
                })?;
                push(&mut tokens, Token::Num(number));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut j = i + 1;
                while at(j).is_some_and(|n| n.is_alphanumeric() || n == '_' || n == '-' || n == '$') {
                    j += 1;
                }
                let ident: String = chars[i..j].iter().map(|&(_, ch)| ch).collect();
                push(&mut tokens, Token::Ident(ident));
                i = j;
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    position,
                    found: other.to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// 構文解析
// ---------------------------------------------------------------------------

/// 比較演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    StrictEq,
    StrictNe,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            CompareOp::StrictEq => "===",
            CompareOp::StrictNe => "!==",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
        }
    }
}

/// 条件式の構文木
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Root(ReferenceRoot),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, String, Vec<Expr>),
    Not(Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek().is_some_and(|t| &t.token == expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ConditionError> {
        match self.advance() {
            Some(t) if &t.token == expected => Ok(()),
            Some(t) => Err(ConditionError::UnexpectedToken {
                position: t.position,
                found: t.token.describe(),
            }),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Cmp(op)) = self.peek().map(|t| t.token.clone()) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_chain()
    }

    fn parse_chain(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Some(Spanned { token: Token::Ident(name), .. }) => name,
                    Some(Spanned { token: Token::Num(n), .. }) if n.fract() == 0.0 && n >= 0.0 => {
                        format!("{}", n as u64)
                    }
                    Some(other) => {
                        return Err(ConditionError::UnexpectedToken {
                            position: other.position,
                            found: other.token.describe(),
                        });
                    }
                    None => return Err(ConditionError::UnexpectedEnd),
                };
                if self.eat(&Token::LParen) {
                    let args = self.parse_arguments()?;
                    expr = Expr::Call(Box::new(expr), name, args);
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ConditionError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            return Ok(args);
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let Some(spanned) = self.advance() else {
            return Err(ConditionError::UnexpectedEnd);
        };
        match spanned.token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(ident) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                other => ReferenceRoot::from_ident(other)
                    .map(Expr::Root)
                    .ok_or(ConditionError::UnknownIdentifier(ident)),
            },
            other => Err(ConditionError::UnexpectedToken {
                position: spanned.position,
                found: other.describe(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// 評価
// ---------------------------------------------------------------------------

/// 評価途中の値
///
/// `steps.a.output` のようなプロパティチェーンは、比較やメソッド呼び出しで
/// 値が必要になるまで `Unresolved` のまま保持し、まとめて参照として解決します。
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Unresolved {
        root: ReferenceRoot,
        path: Vec<String>,
    },
    Value(Value),
}

struct Evaluator<'a, S: ?Sized> {
    scope: &'a S,
    reads: BTreeMap<String, Value>,
}

impl<S> Evaluator<'_, S>
where
    S: ReferenceScope + ?Sized,
{
    fn force(&mut self, operand: Operand) -> Result<Value, ConditionError> {
        match operand {
            Operand::Value(value) => Ok(value),
            Operand::Unresolved { root, path } => {
                let reference = VariableReference::from_parts(root, path);
                if reference.segments().is_empty() {
                    return Err(ReferenceError::InvalidReference {
                        reference: reference.expression().to_string(),
                        reason: "パスがありません".to_string(),
                    }
                    .into());
                }
                let value = resolve_reference(self.scope, &reference)?;
                self.reads
                    .insert(reference.expression().to_string(), value.clone());
                Ok(value)
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Operand, ConditionError> {
        match expr {
            Expr::Literal(value) => Ok(Operand::Value(value.clone())),
            Expr::Root(root) => Ok(Operand::Unresolved {
                root: *root,
                path: Vec::new(),
            }),
            Expr::Member(base, name) => match self.eval(base)? {
                Operand::Unresolved { root, mut path } if name != "length" => {
                    path.push(name.clone());
                    Ok(Operand::Unresolved { root, path })
                }
                operand => {
                    let value = self.force(operand)?;
                    Ok(Operand::Value(member(value, name)?))
                }
            },
            Expr::Index(base, index) => {
                let index = self.eval(index)?;
                let index = stringify(&self.force(index)?);
                match self.eval(base)? {
                    Operand::Unresolved { root, mut path } => {
                        path.push(index);
                        Ok(Operand::Unresolved { root, path })
                    }
                    Operand::Value(value) => Ok(Operand::Value(traverse(
                        value,
                        std::slice::from_ref(&index),
                        &index,
                    )?)),
                }
            }
            Expr::Call(base, method, args) => {
                let target = self.eval(base)?;
                let target = self.force(target)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let operand = self.eval(arg)?;
                    values.push(self.force(operand)?);
                }
                Ok(Operand::Value(call_method(&target, method, &values)?))
            }
            Expr::Not(inner) => {
                let operand = self.eval(inner)?;
                let value = self.force(operand)?;
                Ok(Operand::Value(Value::Bool(!truthy(&value))))
            }
            Expr::Compare(op, left, right) => {
                let left = self.eval(left)?;
                let left = self.force(left)?;
                let right = self.eval(right)?;
                let right = self.force(right)?;
                Ok(Operand::Value(Value::Bool(compare(*op, &left, &right))))
            }
            // 短絡評価は行わない（両辺を必ず評価する）
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                let left = self.force(left)?;
                let right = self.eval(right)?;
                let right = self.force(right)?;
                Ok(Operand::Value(Value::Bool(truthy(&left) && truthy(&right))))
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                let left = self.force(left)?;
                let right = self.eval(right)?;
                let right = self.force(right)?;
                Ok(Operand::Value(Value::Bool(truthy(&left) || truthy(&right))))
            }
        }
    }
}

fn member(value: Value, name: &str) -> Result<Value, ConditionError> {
    match (&value, name) {
        (Value::Array(items), "length") => Ok(number(items.len() as f64)),
        (Value::String(s), "length") => Ok(number(s.chars().count() as f64)),
        _ => Ok(traverse(value, &[name.to_string()], name)?),
    }
}

fn call_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, ConditionError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(ConditionError::InvalidArguments {
                method: method.to_string(),
                expected,
                found: args.len(),
            })
        }
    };

    match method {
        "includes" => {
            arity(1)?;
            let found = match target {
                Value::Array(items) => items.iter().any(|item| strict_eq(item, &args[0])),
                other => stringify(other).contains(&stringify(&args[0])),
            };
            Ok(Value::Bool(found))
        }
        "startsWith" => {
            arity(1)?;
            Ok(Value::Bool(stringify(target).starts_with(&stringify(&args[0]))))
        }
        "endsWith" => {
            arity(1)?;
            Ok(Value::Bool(stringify(target).ends_with(&stringify(&args[0]))))
        }
        "toLowerCase" => {
            arity(0)?;
            Ok(Value::String(stringify(target).to_lowercase()))
        }
        "toUpperCase" => {
            arity(0)?;
            Ok(Value::String(stringify(target).to_uppercase()))
        }
        "trim" => {
            arity(0)?;
            Ok(Value::String(stringify(target).trim().to_string()))
        }
        other => Err(ConditionError::UnknownMethod(other.to_string())),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// JavaScript 風の真偽値判定
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            left == right
        }
        _ => match (to_number(left), to_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => to_number(left)?.partial_cmp(&to_number(right)?),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::StrictEq => strict_eq(left, right),
        CompareOp::StrictNe => !strict_eq(left, right),
        CompareOp::Eq => loose_eq(left, right),
        CompareOp::Ne => !loose_eq(left, right),
        CompareOp::Lt => order(left, right) == Some(Ordering::Less),
        CompareOp::Gt => order(left, right) == Some(Ordering::Greater),
        CompareOp::Le => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Ge => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::resolver::StepLookup;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestScope {
        steps: HashMap<String, StepLookup>,
        variables: HashMap<String, Value>,
    }

    impl ReferenceScope for TestScope {
        fn lookup_step(&self, step_id: &str) -> StepLookup {
            self.steps.get(step_id).cloned().unwrap_or(StepLookup::NotExecuted)
        }

        fn variable(&self, name: &str) -> Option<&Value> {
            self.variables.get(name)
        }
    }

    fn scope() -> TestScope {
        let mut scope = TestScope::default();
        scope.steps.insert(
            "review".into(),
            StepLookup::Succeeded(json!({"verdict": "APPROVED", "issues": ["lint", "docs"], "score": 7})),
        );
        scope.steps.insert("notes".into(), StepLookup::Succeeded(json!("needs more tests")));
        scope.steps.insert("optional".into(), StepLookup::Skipped);
        scope.variables.insert("env".into(), json!("prod"));
        scope.variables.insert("count".into(), json!("3"));
        scope
    }

    fn eval(condition: &str) -> ConditionEvaluation {
        evaluate(condition, &scope())
    }

    #[test]
    fn test_literals() {
        assert!(eval("${true}").evaluated);
        assert!(!eval("${false}").evaluated);
        assert!(!eval("${false}").is_error());
        assert!(eval("${1 < 2}").evaluated);
        assert!(!eval("${null}").evaluated);
    }

    #[test]
    fn test_comparisons_against_step_output() {
        assert!(eval("${steps.review.output.verdict === 'APPROVED'}").evaluated);
        assert!(eval("${steps.review.output.score >= 7}").evaluated);
        assert!(!eval("${steps.review.output.score > 7}").evaluated);
        assert!(eval("${steps.review.output.verdict !== \"REJECTED\"}").evaluated);
    }

    #[test]
    fn test_strict_and_loose_equality() {
        assert!(!eval("${variables.count === 3}").evaluated);
        assert!(eval("${variables.count == 3}").evaluated);
        assert!(eval("${variables.count != 4}").evaluated);
    }

    #[test]
    fn test_methods_and_length() {
        assert!(eval("${steps.review.output.issues.includes('docs')}").evaluated);
        assert!(eval("${steps.review.output.issues.length === 2}").evaluated);
        assert!(eval("${steps.notes.output.includes('tests')}").evaluated);
        assert!(eval("${steps.notes.output.toUpperCase().startsWith('NEEDS')}").evaluated);
        assert!(eval("${steps.review.output.issues[0] === 'lint'}").evaluated);
    }

    #[test]
    fn test_boolean_operators_and_grouping() {
        assert!(eval("${variables.env === 'prod' && steps.review.output.score > 5}").evaluated);
        assert!(eval("${variables.env === 'dev' || steps.review.output.score > 5}").evaluated);
        assert!(!eval("${!(variables.env === 'prod')}").evaluated);
    }

    #[test]
    fn test_context_values_are_recorded() {
        let result = eval("${steps.review.output.score > 5 && variables.env == 'prod'}");
        assert_eq!(result.context_values.len(), 2);
        assert_eq!(result.context_values["steps.review.output.score"], json!(7));
        assert_eq!(result.context_values["variables.env"], json!("prod"));
    }

    #[test]
    fn test_logical_operators_do_not_short_circuit() {
        // 左辺が真でも右辺の参照エラーは条件エラーになる
        let result = eval("${true || steps.optional.output === 'x'}");
        assert!(!result.evaluated);
        assert!(result.error.unwrap().contains("steps.optional.output"));

        let result = eval("${false && variables.missing}");
        assert!(result.is_error());
    }

    #[test]
    fn test_skipped_reference_is_condition_error() {
        let result = eval("${steps.optional.output}");
        assert!(!result.evaluated);
        assert!(result.is_error());
    }

    #[test]
    fn test_syntax_errors_never_panic() {
        for condition in [
            "true",
            "${steps.review.output.includes('x'}",
            "${1 ==}",
            "${'unterminated}",
            "${foo.bar}",
            "${steps.review.output.explode()}",
            "${steps.review.output.verdict.includes()}",
            "${1 2}",
        ] {
            let result = eval(condition);
            assert!(!result.evaluated, "{condition}");
            assert!(result.is_error(), "{condition}");
        }
    }

    #[test]
    fn test_referenced_steps() {
        assert_eq!(
            referenced_steps("${steps.a.output.includes('x') && steps.b-2.ok || steps.a}"),
            vec!["a".to_string(), "b-2".to_string()]
        );
        assert!(referenced_steps("${variables.x}").is_empty());
    }

    #[test]
    fn test_referenced_variables() {
        assert_eq!(
            referenced_variables("${variables.plan.length > 0 && steps.a.summary === 'ok' || steps.b.output}"),
            vec!["plan".to_string(), "summary".to_string()]
        );
        assert!(referenced_variables("${steps.a.output.includes('x')}").is_empty());
        assert!(referenced_variables("${variables.x == 'open}").is_empty());
    }
}
