//! Recursive descent parser for filter and value expressions.
//!
//! Grammar, lowest precedence first:
//! ```text
//! expr       := or ('?' expr ':' expr)?
//! or         := and (('||' | 'or') and)*
//! and        := equality (('&&' | 'and') equality)*
//! equality   := comparison (('==' | '!=') comparison)*
//! comparison := additive (('<' | '<=' | '>' | '>=' | 'in') additive)*
//! additive   := term (('+' | '-') term)*
//! term       := unary (('*' | '/' | '%') unary)*
//! unary      := ('!' | 'not' | '-') unary | postfix
//! postfix    := primary ('.' IDENT | '[' expr ']')*
//! primary    := NUMBER | STRING | 'true' | 'false' | 'null' | 'nil'
//!             | '[' (expr (',' expr)*)? ']'
//!             | IDENT '(' (expr (',' expr)*)? ')' | IDENT | '(' expr ')'
//! ```

use crate::types::{CarveError, CarveResult};
use serde_json::Value;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Functions callable from expressions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Builtin {
    Len,
    Lower,
    Upper,
    Trim,
    Contains,
    StartsWith,
    EndsWith,
    Int,
    Float,
    String,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Builtin::Len,
            "lower" => Builtin::Lower,
            "upper" => Builtin::Upper,
            "trim" => Builtin::Trim,
            "contains" => Builtin::Contains,
            "starts_with" => Builtin::StartsWith,
            "ends_with" => Builtin::EndsWith,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "string" => Builtin::String,
            _ => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Contains | Builtin::StartsWith | Builtin::EndsWith => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Keyword(&'static str),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Eof,
}

const OPERATORS: [&str; 14] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
];

const KEYWORDS: [&str; 8] = ["and", "or", "not", "in", "true", "false", "null", "nil"];

fn compile_error(message: impl Into<String>) -> CarveError {
    CarveError::Compilation(message.into())
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> CarveResult<Expr> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let expr = parse_expr(&tokens, &mut pos)?;
    match tokens.get(pos) {
        Some(Token::Eof) => Ok(expr),
        other => Err(compile_error(format!("unexpected trailing token {other:?}"))),
    }
}

// ── Tokenizer ──

fn tokenize(input: &str) -> CarveResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // String literal, single or double quoted, with backslash escapes
        if c == '\'' || c == '"' {
            let quote = c;
            let start = i;
            i += 1;
            let mut s = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(compile_error(format!("unterminated string literal at position {start}"))),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| compile_error("dangling escape at end of input"))?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }

        // Number
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| compile_error(format!("invalid number: {text}")))?)
            } else {
                Token::Int(text.parse().map_err(|_| compile_error(format!("invalid number: {text}")))?)
            };
            tokens.push(token);
            continue;
        }

        // Identifier or keyword
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match KEYWORDS.iter().find(|k| **k == word) {
                Some(k) => tokens.push(Token::Keyword(k)),
                None => tokens.push(Token::Ident(word)),
            }
            continue;
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            '?' => Some(Token::Question),
            ':' => Some(Token::Colon),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(token);
            i += 1;
            continue;
        }

        // Operators, longest first
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(op));
                i += op.chars().count();
            }
            None => return Err(compile_error(format!("unexpected character '{c}' at position {i}"))),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

// ── Parser ──

fn peek_op(tokens: &[Token], pos: usize, ops: &[&str]) -> Option<&'static str> {
    match tokens.get(pos) {
        Some(Token::Op(op)) if ops.contains(op) => Some(op),
        _ => None,
    }
}

fn peek_keyword(tokens: &[Token], pos: usize, keyword: &str) -> bool {
    matches!(tokens.get(pos), Some(Token::Keyword(k)) if *k == keyword)
}

fn expect(tokens: &[Token], pos: &mut usize, expected: Token) -> CarveResult<()> {
    match tokens.get(*pos) {
        Some(t) if *t == expected => {
            *pos += 1;
            Ok(())
        }
        other => Err(compile_error(format!("expected {expected:?}, found {other:?}"))),
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary(op, Box::new(left), Box::new(right))
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let condition = parse_or(tokens, pos)?;
    if matches!(tokens.get(*pos), Some(Token::Question)) {
        *pos += 1;
        let then = parse_expr(tokens, pos)?;
        expect(tokens, pos, Token::Colon)?;
        let otherwise = parse_expr(tokens, pos)?;
        return Ok(Expr::Ternary(Box::new(condition), Box::new(then), Box::new(otherwise)));
    }
    Ok(condition)
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut left = parse_and(tokens, pos)?;
    while peek_op(tokens, *pos, &["||"]).is_some() || peek_keyword(tokens, *pos, "or") {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = binary(BinaryOp::Or, left, right);
    }
    Ok(left)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut left = parse_equality(tokens, pos)?;
    while peek_op(tokens, *pos, &["&&"]).is_some() || peek_keyword(tokens, *pos, "and") {
        *pos += 1;
        let right = parse_equality(tokens, pos)?;
        left = binary(BinaryOp::And, left, right);
    }
    Ok(left)
}

fn parse_equality(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut left = parse_comparison(tokens, pos)?;
    while let Some(op) = peek_op(tokens, *pos, &["==", "!="]) {
        *pos += 1;
        let right = parse_comparison(tokens, pos)?;
        let op = if op == "==" { BinaryOp::Eq } else { BinaryOp::Neq };
        left = binary(op, left, right);
    }
    Ok(left)
}

fn parse_comparison(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut left = parse_additive(tokens, pos)?;
    loop {
        let op = if peek_keyword(tokens, *pos, "in") {
            BinaryOp::In
        } else {
            match peek_op(tokens, *pos, &["<", "<=", ">", ">="]) {
                Some("<") => BinaryOp::Lt,
                Some("<=") => BinaryOp::Lte,
                Some(">") => BinaryOp::Gt,
                Some(">=") => BinaryOp::Gte,
                _ => break,
            }
        };
        *pos += 1;
        let right = parse_additive(tokens, pos)?;
        left = binary(op, left, right);
    }
    Ok(left)
}

fn parse_additive(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut left = parse_term(tokens, pos)?;
    while let Some(op) = peek_op(tokens, *pos, &["+", "-"]) {
        *pos += 1;
        let right = parse_term(tokens, pos)?;
        let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
        left = binary(op, left, right);
    }
    Ok(left)
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut left = parse_unary(tokens, pos)?;
    while let Some(op) = peek_op(tokens, *pos, &["*", "/", "%"]) {
        *pos += 1;
        let right = parse_unary(tokens, pos)?;
        let op = match op {
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            _ => BinaryOp::Rem,
        };
        left = binary(op, left, right);
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    if peek_op(tokens, *pos, &["!"]).is_some() || peek_keyword(tokens, *pos, "not") {
        *pos += 1;
        return Ok(Expr::Unary(UnaryOp::Not, Box::new(parse_unary(tokens, pos)?)));
    }
    if peek_op(tokens, *pos, &["-"]).is_some() {
        *pos += 1;
        return Ok(Expr::Unary(UnaryOp::Neg, Box::new(parse_unary(tokens, pos)?)));
    }
    parse_postfix(tokens, pos)
}

fn parse_postfix(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let mut expr = parse_primary(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Dot) => {
                *pos += 1;
                match tokens.get(*pos) {
                    Some(Token::Ident(name)) => {
                        *pos += 1;
                        expr = Expr::Member(Box::new(expr), name.clone());
                    }
                    other => return Err(compile_error(format!("expected field name after '.', found {other:?}"))),
                }
            }
            Some(Token::LBracket) => {
                *pos += 1;
                let index = parse_expr(tokens, pos)?;
                expect(tokens, pos, Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            }
            _ => return Ok(expr),
        }
    }
}

/// Comma-separated expressions up to `close`, which is consumed.
fn parse_list(tokens: &[Token], pos: &mut usize, close: Token) -> CarveResult<Vec<Expr>> {
    let mut items = Vec::new();
    if tokens.get(*pos) != Some(&close) {
        loop {
            items.push(parse_expr(tokens, pos)?);
            if !matches!(tokens.get(*pos), Some(Token::Comma)) {
                break;
            }
            *pos += 1;
        }
    }
    expect(tokens, pos, close)?;
    Ok(items)
}

fn parse_primary(tokens: &[Token], pos: &mut usize) -> CarveResult<Expr> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| compile_error("unexpected end of expression"))?;
    *pos += 1;
    match token {
        Token::Int(n) => Ok(Expr::Literal(Value::from(*n))),
        Token::Float(f) => Ok(Expr::Literal(Value::from(*f))),
        Token::Str(s) => Ok(Expr::Literal(Value::String(s.clone()))),
        Token::Keyword("true") => Ok(Expr::Literal(Value::Bool(true))),
        Token::Keyword("false") => Ok(Expr::Literal(Value::Bool(false))),
        Token::Keyword("null") | Token::Keyword("nil") => Ok(Expr::Literal(Value::Null)),
        Token::Ident(name) if matches!(tokens.get(*pos), Some(Token::LParen)) => {
            *pos += 1;
            let builtin = Builtin::lookup(name)
                .ok_or_else(|| compile_error(format!("unknown function '{name}'")))?;
            let args = parse_list(tokens, pos, Token::RParen)?;
            if args.len() != builtin.arity() {
                return Err(compile_error(format!(
                    "'{name}' takes {} argument(s), got {}",
                    builtin.arity(),
                    args.len()
                )));
            }
            Ok(Expr::Call(builtin, args))
        }
        Token::Ident(name) => Ok(Expr::Ident(name.clone())),
        Token::LBracket => Ok(Expr::Array(parse_list(tokens, pos, Token::RBracket)?)),
        Token::LParen => {
            let inner = parse_expr(tokens, pos)?;
            expect(tokens, pos, Token::RParen)?;
            Ok(inner)
        }
        Token::Eof => Err(compile_error("unexpected end of expression")),
        other => Err(compile_error(format!("unexpected token {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3 == 7 && !false").unwrap();
        let Expr::Binary(BinaryOp::And, left, right) = expr else {
            panic!("expected && at the root");
        };
        assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(*right, Expr::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse("value.items[0].name").unwrap();
        let Expr::Member(inner, field) = expr else {
            panic!("expected member access");
        };
        assert_eq!(field, "name");
        assert!(matches!(*inner, Expr::Index(_, _)));
    }

    #[test]
    fn test_ternary_and_keywords() {
        let expr = parse("index % 2 == 0 and not (value in ['a', 'b']) ? 'even' : nil").unwrap();
        assert!(matches!(expr, Expr::Ternary(_, _, _)));
    }

    #[test]
    fn test_calls() {
        assert!(matches!(parse("len(value)").unwrap(), Expr::Call(Builtin::Len, _)));
        assert!(matches!(
            parse("starts_with(value, \"x\")").unwrap(),
            Expr::Call(Builtin::StartsWith, _)
        ));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse("42").unwrap(), Expr::Literal(Value::from(42)));
        assert_eq!(parse("4.5").unwrap(), Expr::Literal(Value::from(4.5)));
        assert_eq!(parse(r#"'it\'s'"#).unwrap(), Expr::Literal(Value::from("it's")));
    }

    #[test]
    fn test_malformed_expressions() {
        let bad = [
            "",
            "1 +",
            "(1 + 2",
            "value.",
            "a ? b",
            "'open",
            "1 # 2",
            "unknown_fn(1)",
            "len(1, 2)",
            "1 2",
        ];
        for source in bad {
            let err = parse(source).unwrap_err();
            assert!(matches!(err, CarveError::Compilation(_)), "{source}: {err:?}");
        }
    }
}
