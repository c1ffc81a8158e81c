//! Query parser — tokenizer and recursive descent parser for query expressions.
//!
//! Grammar:
//! ```text
//! expr           := lambda | or
//! lambda         := IDENT '=>' expr | '(' IDENT ')' '=>' expr
//! or             := and (('||' | 'or') and)*
//! and            := equality (('&&' | 'and') equality)*
//! equality       := relational (('==' | '=' | '!=' | '<>') relational)*
//! relational     := additive (('<' | '<=' | '>' | '>=') additive)*
//! additive       := multiplicative (('+' | '-') multiplicative)*
//! multiplicative := unary (('*' | '/' | '%') unary)*
//! unary          := ('!' | 'not' | '-') unary | postfix
//! postfix        := primary ('.' IDENT ['(' [expr (',' expr)*] ')'])*
//! primary        := INT | FLOAT | STRING | 'true' | 'false' | 'null' | 'it'
//!                 | IDENT | '(' expr ')'
//!                 | 'new' '{' init (',' init)* '}'
//!                 | 'new' '(' expr ['as' IDENT] (',' expr ['as' IDENT])* ')'
//! init           := IDENT '=' expr | expr
//! ```
//!
//! The parser only builds syntax. Which identifiers and members exist is
//! decided by the compiler.

use crate::types::{QueryError, QueryResult};

/// Deepest expression tree the parser accepts.
///
/// The compiler and executor walk the tree recursively, so this also bounds
/// their stack use.
pub const MAX_DEPTH: usize = 128;

/// Byte range of a construct in the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
}

/// A parsed query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal {
        value: Literal,
        span: Span,
    },
    /// A bare identifier: the bound parameter, a lambda parameter, or an
    /// implicit member of the current element.
    Ident {
        name: String,
        span: Span,
    },
    /// The implicit current element inside an operator argument.
    It {
        span: Span,
    },
    /// `target.name`; `span` covers the member name.
    Member {
        target: Box<Expr>,
        name: String,
        span: Span,
    },
    /// `target.name(args)`; `span` covers the method name.
    Call {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    Lambda {
        param: String,
        body: Box<Expr>,
        span: Span,
    },
    /// Projection into a new anonymous shape.
    New {
        fields: Vec<FieldInit>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::Ident { span, .. }
            | Expr::It { span }
            | Expr::Member { span, .. }
            | Expr::Call { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Lambda { span, .. }
            | Expr::New { span, .. } => *span,
        }
    }

    /// Number of nodes on the longest path from this node to a leaf.
    pub fn height(&self) -> usize {
        let child = match self {
            Expr::Literal { .. } | Expr::Ident { .. } | Expr::It { .. } => 0,
            Expr::Member { target, .. } => target.height(),
            Expr::Call { target, args, .. } => args
                .iter()
                .map(Expr::height)
                .fold(target.height(), usize::max),
            Expr::Unary { operand, .. } => operand.height(),
            Expr::Binary { lhs, rhs, .. } => lhs.height().max(rhs.height()),
            Expr::Lambda { body, .. } => body.height(),
            Expr::New { fields, .. } => fields
                .iter()
                .map(|f| f.value.height())
                .max()
                .unwrap_or(0),
        };
        child + 1
    }
}

/// One field of a `new { ... }` projection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInit {
    /// Explicit name; inferred from a trailing member access when absent.
    pub name: Option<String>,
    pub value: Expr,
}

/// A literal value in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// Token kinds produced by the tokenizer.
#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Keyword(Keyword),
    Integer(i64),
    Float(f64),
    StringLit(String),
    Op(BinaryOp),
    Not,
    Arrow,
    Assign,
    Dot,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    True,
    False,
    Null,
    New,
    As,
    It,
}

/// A token with its source position and raw text for diagnostics.
#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
    text: String,
}

impl Token {
    fn span(&self) -> Span {
        Span {
            start: self.start,
            end: self.end,
        }
    }

    fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("'{}'", self.text),
        }
    }
}

/// Parse query text into an expression tree.
pub fn parse(input: &str) -> QueryResult<Expr> {
    if input.trim().is_empty() {
        return Err(QueryError::parse("empty expression"));
    }

    let tokens = tokenize(input)?;
    let mut pos = 0;
    let expr = parse_expr(&tokens, &mut pos, 0)?;

    let next = peek(&tokens, pos);
    if next.kind != TokenKind::Eof {
        return Err(unexpected(next, "end of expression"));
    }
    check_height(expr, peek(&tokens, 0))
}

// ── Tokenizer ──

fn tokenize(input: &str) -> QueryResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let offset = |i: usize| chars.get(i).map(|(o, _)| *o).unwrap_or(input.len());
    let mut i = 0;

    while i < chars.len() {
        let (start, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // String literal
        if c == '"' {
            i += 1;
            let mut value = String::new();
            let mut closed = false;
            while i < chars.len() {
                match chars[i].1 {
                    '"' => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    '\\' => {
                        let Some(&(esc_at, esc)) = chars.get(i + 1) else {
                            break;
                        };
                        value.push(match esc {
                            '"' => '"',
                            '\\' => '\\',
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => {
                                return Err(QueryError::parse_at(
                                    format!("unknown escape sequence '\\{other}'"),
                                    esc_at - 1,
                                    format!("\\{other}"),
                                ))
                            }
                        });
                        i += 2;
                    }
                    other => {
                        value.push(other);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(QueryError::parse_at(
                    format!("unterminated string literal at position {start}"),
                    start,
                    &input[start..],
                ));
            }
            let end = offset(i);
            tokens.push(Token {
                kind: TokenKind::StringLit(value),
                start,
                end,
                text: input[start..end].to_string(),
            });
            continue;
        }

        // Number
        if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len() && chars[j].1.is_ascii_digit() {
                j += 1;
            }
            let is_float = j + 1 < chars.len() && chars[j].1 == '.' && chars[j + 1].1.is_ascii_digit();
            if is_float {
                j += 1;
                while j < chars.len() && chars[j].1.is_ascii_digit() {
                    j += 1;
                }
            }
            let end = offset(j);
            let text = &input[start..end];
            let kind = if is_float {
                match text.parse::<f64>() {
                    Ok(f) if f.is_finite() => TokenKind::Float(f),
                    Ok(_) => {
                        return Err(QueryError::parse_at(
                            format!("float literal out of range: {text}"),
                            start,
                            text,
                        ))
                    }
                    Err(_) => {
                        return Err(QueryError::parse_at(
                            format!("invalid number: {text}"),
                            start,
                            text,
                        ))
                    }
                }
            } else {
                TokenKind::Integer(text.parse().map_err(|_| {
                    QueryError::parse_at(
                        format!("integer literal out of range: {text}"),
                        start,
                        text,
                    )
                })?)
            };
            tokens.push(Token {
                kind,
                start,
                end,
                text: text.to_string(),
            });
            i = j;
            continue;
        }

        // Identifier or keyword
        if c.is_alphabetic() || c == '_' {
            let mut j = i;
            while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                j += 1;
            }
            let end = offset(j);
            let word = &input[start..end];
            let kind = match word {
                "true" => TokenKind::Keyword(Keyword::True),
                "false" => TokenKind::Keyword(Keyword::False),
                "null" => TokenKind::Keyword(Keyword::Null),
                "new" => TokenKind::Keyword(Keyword::New),
                "as" => TokenKind::Keyword(Keyword::As),
                "it" => TokenKind::Keyword(Keyword::It),
                "and" => TokenKind::Op(BinaryOp::And),
                "or" => TokenKind::Op(BinaryOp::Or),
                "not" => TokenKind::Not,
                _ => TokenKind::Ident(word.to_string()),
            };
            tokens.push(Token {
                kind,
                start,
                end,
                text: word.to_string(),
            });
            i = j;
            continue;
        }

        // Punctuation and operators, longest match first
        let next = chars.get(i + 1).map(|(_, n)| *n);
        let (kind, width) = match (c, next) {
            ('=', Some('>')) => (TokenKind::Arrow, 2),
            ('=', Some('=')) => (TokenKind::Op(BinaryOp::Eq), 2),
            ('!', Some('=')) => (TokenKind::Op(BinaryOp::Neq), 2),
            ('<', Some('>')) => (TokenKind::Op(BinaryOp::Neq), 2),
            ('<', Some('=')) => (TokenKind::Op(BinaryOp::Lte), 2),
            ('>', Some('=')) => (TokenKind::Op(BinaryOp::Gte), 2),
            ('&', Some('&')) => (TokenKind::Op(BinaryOp::And), 2),
            ('|', Some('|')) => (TokenKind::Op(BinaryOp::Or), 2),
            ('=', _) => (TokenKind::Assign, 1),
            ('!', _) => (TokenKind::Not, 1),
            ('<', _) => (TokenKind::Op(BinaryOp::Lt), 1),
            ('>', _) => (TokenKind::Op(BinaryOp::Gt), 1),
            ('+', _) => (TokenKind::Op(BinaryOp::Add), 1),
            ('-', _) => (TokenKind::Op(BinaryOp::Sub), 1),
            ('*', _) => (TokenKind::Op(BinaryOp::Mul), 1),
            ('/', _) => (TokenKind::Op(BinaryOp::Div), 1),
            ('%', _) => (TokenKind::Op(BinaryOp::Rem), 1),
            ('.', _) => (TokenKind::Dot, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            _ => {
                return Err(QueryError::parse_at(
                    format!("unexpected character '{c}' at position {start}"),
                    start,
                    c.to_string(),
                ))
            }
        };
        let end = offset(i + width);
        tokens.push(Token {
            kind,
            start,
            end,
            text: input[start..end].to_string(),
        });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        start: input.len(),
        end: input.len(),
        text: String::new(),
    });
    Ok(tokens)
}

// ── Parser helpers ──

fn peek(tokens: &[Token], pos: usize) -> &Token {
    // The tokenizer always terminates the stream with Eof.
    tokens.get(pos).unwrap_or(&tokens[tokens.len() - 1])
}

fn unexpected(token: &Token, expected: &str) -> QueryError {
    QueryError::parse_at(
        format!(
            "expected {expected} at position {}, found {}",
            token.start,
            token.describe()
        ),
        token.start,
        token.text.clone(),
    )
}

fn expect(tokens: &[Token], pos: &mut usize, kind: TokenKind, what: &str) -> QueryResult<Span> {
    let token = peek(tokens, *pos);
    if token.kind == kind {
        *pos += 1;
        Ok(token.span())
    } else {
        Err(unexpected(token, what))
    }
}

fn expect_ident(tokens: &[Token], pos: &mut usize, what: &str) -> QueryResult<(String, Span)> {
    let token = peek(tokens, *pos);
    match &token.kind {
        TokenKind::Ident(name) => {
            *pos += 1;
            Ok((name.clone(), token.span()))
        }
        _ => Err(unexpected(token, what)),
    }
}

fn too_deep(token: &Token) -> QueryError {
    QueryError::parse_at(
        format!(
            "expression nested too deeply at position {} (limit {MAX_DEPTH})",
            token.start
        ),
        token.start,
        token.text.clone(),
    )
}

/// Reject `expr` if building it pushed the tree past `MAX_DEPTH`.
fn check_height(expr: Expr, at: &Token) -> QueryResult<Expr> {
    if expr.height() > MAX_DEPTH {
        return Err(too_deep(at));
    }
    Ok(expr)
}

fn join(a: Span, b: Span) -> Span {
    Span {
        start: a.start.min(b.start),
        end: a.end.max(b.end),
    }
}

// ── Expressions ──

fn parse_expr(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<Expr> {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        return Err(too_deep(peek(tokens, *pos)));
    }
    if let Some(lambda) = try_parse_lambda(tokens, pos, depth)? {
        return Ok(lambda);
    }
    parse_binary(tokens, pos, 0, depth)
}

/// Parse `p => body` or `(p) => body` if the upcoming tokens form a lambda head.
fn try_parse_lambda(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<Option<Expr>> {
    let start = peek(tokens, *pos).start;
    let (param, body_at) = match (
        &peek(tokens, *pos).kind,
        &peek(tokens, *pos + 1).kind,
        &peek(tokens, *pos + 2).kind,
        &peek(tokens, *pos + 3).kind,
    ) {
        (TokenKind::Ident(name), TokenKind::Arrow, _, _) => (name.clone(), *pos + 2),
        (TokenKind::LParen, TokenKind::Ident(name), TokenKind::RParen, TokenKind::Arrow) => {
            (name.clone(), *pos + 4)
        }
        _ => return Ok(None),
    };

    *pos = body_at;
    let body = parse_expr(tokens, pos, depth)?;
    let span = Span {
        start,
        end: body.span().end,
    };
    Ok(Some(Expr::Lambda {
        param,
        body: Box::new(body),
        span,
    }))
}

/// Binary operator precedence levels, loosest first.
const PRECEDENCE: &[&[BinaryOp]] = &[
    &[BinaryOp::Or],
    &[BinaryOp::And],
    &[BinaryOp::Eq, BinaryOp::Neq],
    &[BinaryOp::Lt, BinaryOp::Lte, BinaryOp::Gt, BinaryOp::Gte],
    &[BinaryOp::Add, BinaryOp::Sub],
    &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Rem],
];

fn parse_binary(
    tokens: &[Token],
    pos: &mut usize,
    level: usize,
    depth: usize,
) -> QueryResult<Expr> {
    if level == PRECEDENCE.len() {
        return parse_unary(tokens, pos, depth);
    }

    let mut lhs = parse_binary(tokens, pos, level + 1, depth)?;
    loop {
        // A bare '=' is accepted as equality, as in dynamic LINQ predicates.
        let at = peek(tokens, *pos);
        let op = match &at.kind {
            TokenKind::Op(op) if PRECEDENCE[level].contains(op) => *op,
            TokenKind::Assign if level == 2 => BinaryOp::Eq,
            _ => break,
        };
        *pos += 1;
        let rhs = parse_binary(tokens, pos, level + 1, depth)?;
        let span = join(lhs.span(), rhs.span());
        // Operator chains nest to the left without recursing here.
        lhs = check_height(
            Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            },
            at,
        )?;
    }
    Ok(lhs)
}

fn parse_unary(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<Expr> {
    let token = peek(tokens, *pos);
    if depth > MAX_DEPTH {
        return Err(too_deep(token));
    }
    let op = match token.kind {
        TokenKind::Not => UnaryOp::Not,
        TokenKind::Op(BinaryOp::Sub) => UnaryOp::Neg,
        _ => return parse_postfix(tokens, pos, depth),
    };
    let start = token.span();
    *pos += 1;

    let operand = parse_unary(tokens, pos, depth + 1)?;

    // Fold negative numeric literals so i64::MIN is representable.
    if op == UnaryOp::Neg {
        if let Expr::Literal { value, span } = &operand {
            let folded = match value {
                Literal::Integer(n) => Some(Literal::Integer(-n)),
                Literal::Float(f) => Some(Literal::Float(-f)),
                _ => None,
            };
            if let Some(value) = folded {
                return Ok(Expr::Literal {
                    value,
                    span: join(start, *span),
                });
            }
        }
    }

    let span = join(start, operand.span());
    Ok(Expr::Unary {
        op,
        operand: Box::new(operand),
        span,
    })
}

fn parse_postfix(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<Expr> {
    let mut expr = parse_primary(tokens, pos, depth)?;

    while peek(tokens, *pos).kind == TokenKind::Dot {
        let at = peek(tokens, *pos);
        *pos += 1;
        let (name, span) = expect_ident(tokens, pos, "member name after '.'")?;

        let next = if peek(tokens, *pos).kind == TokenKind::LParen {
            *pos += 1;
            let args = parse_args(tokens, pos, depth)?;
            Expr::Call {
                target: Box::new(expr),
                name,
                args,
                span,
            }
        } else {
            Expr::Member {
                target: Box::new(expr),
                name,
                span,
            }
        };
        expr = check_height(next, at)?;
    }
    Ok(expr)
}

/// Parse call arguments after the opening parenthesis.
fn parse_args(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<Vec<Expr>> {
    let mut args = Vec::new();
    if peek(tokens, *pos).kind == TokenKind::RParen {
        *pos += 1;
        return Ok(args);
    }
    loop {
        args.push(parse_expr(tokens, pos, depth)?);
        match peek(tokens, *pos).kind {
            TokenKind::Comma => *pos += 1,
            TokenKind::RParen => {
                *pos += 1;
                return Ok(args);
            }
            _ => return Err(unexpected(peek(tokens, *pos), "',' or ')'")),
        }
    }
}

fn parse_primary(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<Expr> {
    let token = peek(tokens, *pos);
    let span = token.span();

    let literal = |value| Expr::Literal { value, span };
    let expr = match &token.kind {
        TokenKind::Integer(n) => literal(Literal::Integer(*n)),
        TokenKind::Float(f) => literal(Literal::Float(*f)),
        TokenKind::StringLit(s) => literal(Literal::String(s.clone())),
        TokenKind::Keyword(Keyword::True) => literal(Literal::Bool(true)),
        TokenKind::Keyword(Keyword::False) => literal(Literal::Bool(false)),
        TokenKind::Keyword(Keyword::Null) => literal(Literal::Null),
        TokenKind::Keyword(Keyword::It) => Expr::It { span },
        TokenKind::Keyword(Keyword::New) => {
            *pos += 1;
            return parse_new(tokens, pos, span, depth);
        }
        TokenKind::Ident(name) => {
            if peek(tokens, *pos + 1).kind == TokenKind::LParen {
                return Err(QueryError::parse_at(
                    format!("free function calls are not allowed: '{name}'"),
                    token.start,
                    name.clone(),
                ));
            }
            Expr::Ident {
                name: name.clone(),
                span,
            }
        }
        TokenKind::LParen => {
            *pos += 1;
            let inner = parse_expr(tokens, pos, depth)?;
            expect(tokens, pos, TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        _ => return Err(unexpected(token, "an expression")),
    };
    *pos += 1;
    Ok(expr)
}

/// Parse a projection after the `new` keyword.
fn parse_new(tokens: &[Token], pos: &mut usize, start: Span, depth: usize) -> QueryResult<Expr> {
    let (close, close_name) = match peek(tokens, *pos).kind {
        TokenKind::LBrace => (TokenKind::RBrace, "'}'"),
        TokenKind::LParen => (TokenKind::RParen, "')'"),
        _ => return Err(unexpected(peek(tokens, *pos), "'{' or '(' after 'new'")),
    };
    let brace_style = close == TokenKind::RBrace;
    *pos += 1;

    let mut fields = Vec::new();
    loop {
        let field = if brace_style {
            parse_brace_init(tokens, pos, depth)?
        } else {
            parse_as_init(tokens, pos, depth)?
        };
        fields.push(field);

        match &peek(tokens, *pos).kind {
            TokenKind::Comma => *pos += 1,
            kind if *kind == close => break,
            _ => return Err(unexpected(peek(tokens, *pos), &format!("',' or {close_name}"))),
        }
    }
    let end = expect(tokens, pos, close, close_name)?;
    Ok(Expr::New {
        fields,
        span: join(start, end),
    })
}

/// `Name = expr` or a bare `expr` inside `new { ... }`.
fn parse_brace_init(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<FieldInit> {
    if let (TokenKind::Ident(name), TokenKind::Assign) =
        (&peek(tokens, *pos).kind, &peek(tokens, *pos + 1).kind)
    {
        let name = name.clone();
        *pos += 2;
        let value = parse_expr(tokens, pos, depth)?;
        return Ok(FieldInit {
            name: Some(name),
            value,
        });
    }
    Ok(FieldInit {
        name: None,
        value: parse_expr(tokens, pos, depth)?,
    })
}

/// `expr [as Name]` inside `new ( ... )`.
fn parse_as_init(tokens: &[Token], pos: &mut usize, depth: usize) -> QueryResult<FieldInit> {
    let value = parse_expr(tokens, pos, depth)?;
    let name = if peek(tokens, *pos).kind == TokenKind::Keyword(Keyword::As) {
        *pos += 1;
        Some(expect_ident(tokens, pos, "field name after 'as'")?.0)
    } else {
        None
    };
    Ok(FieldInit { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method_chain(expr: &Expr) -> Vec<String> {
        let mut names = Vec::new();
        let mut cur = expr;
        while let Expr::Call { target, name, .. } = cur {
            names.push(name.clone());
            cur = target;
        }
        names.reverse();
        names
    }

    #[test]
    fn test_parse_method_chain() {
        let e = parse("people.Take(10).OrderByDescending(p => p.Index)").unwrap();
        assert_eq!(method_chain(&e), vec!["Take", "OrderByDescending"]);

        if let Expr::Call { args, .. } = &e {
            assert!(matches!(&args[0], Expr::Lambda { param, .. } if param == "p"));
        } else {
            panic!("expected call");
        }
    }

    #[test]
    fn test_parse_precedence() {
        let e = parse("1 + 2 * 3 > 6 && true").unwrap();
        let Expr::Binary { op, lhs, .. } = e else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::And);
        let Expr::Binary { op, lhs, .. } = *lhs else {
            panic!("expected comparison");
        };
        assert_eq!(op, BinaryOp::Gt);
        let Expr::Binary { op, rhs, .. } = *lhs else {
            panic!("expected addition");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_parse_word_operators_and_single_equals() {
        let e = parse("people.Where(Index = 3 or not (Index < 2))").unwrap();
        let Expr::Call { args, .. } = e else {
            panic!("expected call");
        };
        assert!(matches!(&args[0], Expr::Binary { op: BinaryOp::Or, .. }));
    }

    #[test]
    fn test_parse_parenthesized_lambda() {
        let e = parse("people.Where((p) => p.Index > 1)").unwrap();
        let Expr::Call { args, .. } = e else {
            panic!("expected call");
        };
        assert!(matches!(&args[0], Expr::Lambda { .. }));
    }

    #[test]
    fn test_parse_new_brace_projection() {
        let e = parse("people.Select(p => new { p.Name, Double = p.Index * 2 })").unwrap();
        let Expr::Call { args, .. } = e else {
            panic!("expected call");
        };
        let Expr::Lambda { body, .. } = &args[0] else {
            panic!("expected lambda");
        };
        let Expr::New { fields, .. } = body.as_ref() else {
            panic!("expected new");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, None);
        assert_eq!(fields[1].name.as_deref(), Some("Double"));
    }

    #[test]
    fn test_parse_new_as_projection() {
        let e = parse("people.Select(new (Name as Label, Index))").unwrap();
        let Expr::Call { args, .. } = e else {
            panic!("expected call");
        };
        let Expr::New { fields, .. } = &args[0] else {
            panic!("expected new");
        };
        assert_eq!(fields[0].name.as_deref(), Some("Label"));
        assert_eq!(fields[1].name, None);
    }

    #[test]
    fn test_parse_negative_literal_folds() {
        let e = parse("-9223372036854775808").err();
        // The positive magnitude overflows before negation can be applied.
        assert!(e.is_some());
        assert_eq!(
            parse("-5").unwrap(),
            Expr::Literal {
                value: Literal::Integer(-5),
                span: Span { start: 0, end: 2 }
            }
        );
    }

    #[test]
    fn test_parse_string_escapes() {
        let e = parse(r#""a \"b\" \\ c""#).unwrap();
        assert!(
            matches!(e, Expr::Literal { value: Literal::String(ref s), .. } if s == "a \"b\" \\ c")
        );
    }

    #[test]
    fn test_parse_spans_are_byte_offsets() {
        let e = parse("people.Explode()").unwrap();
        let Expr::Call { name, span, .. } = e else {
            panic!("expected call");
        };
        assert_eq!(name, "Explode");
        assert_eq!(span, Span { start: 7, end: 14 });
    }

    #[test]
    fn test_parse_error_empty() {
        let err = parse("").unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("empty expression"));
        assert!(parse("   \n\t").is_err());
    }

    #[test]
    fn test_parse_error_free_function() {
        let err = parse("Explode()").unwrap_err();
        assert_eq!(err.token(), Some("Explode"));
        assert_eq!(err.position(), Some(0));
    }

    #[test]
    fn test_parse_error_unterminated_string() {
        let err = parse(r#"people.Where(p => p.Name == "abc)"#).unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_parse_error_unexpected_character() {
        let err = parse("people.Where(p => p.Index > 1 & true)").unwrap_err();
        assert_eq!(err.token(), Some("&"));
        assert_eq!(err.position(), Some(30));
    }

    #[test]
    fn test_parse_error_trailing_tokens() {
        let err = parse("people.Take(1) people").unwrap_err();
        assert_eq!(err.position(), Some(15));
        assert!(err.to_string().contains("end of expression"));
    }

    #[test]
    fn test_parse_malformed_queries_gracefully() {
        let bad_queries = [
            "people.",
            "people.Take(",
            "people.Take(1,",
            "people.Where(p =>)",
            "new { }",
            "new [",
            "(1 + 2",
            "1 +",
            "people..Take(1)",
            "people.Select(new (p.Name as))",
            "\"x\\q\"",
            "99999999999999999999",
        ];

        for q in &bad_queries {
            let result = parse(q);
            assert!(result.is_err(), "malformed query should error: {q}");
            let err = result.unwrap_err();
            assert!(err.is_parse());
            assert!(
                !err.to_string().is_empty(),
                "error message should not be empty for: {q}"
            );
        }
    }

    #[test]
    fn test_parse_deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let nots = format!("{}true", "!".repeat(10_000));
        let chain = vec!["1"; 10_000].join(" + ");
        let calls = format!("people{}", ".Take(1)".repeat(10_000));

        for q in [&parens, &nots, &chain, &calls] {
            let err = parse(q).unwrap_err();
            assert!(err.is_parse());
            assert!(
                err.to_string().contains("nested too deeply"),
                "unexpected error: {err}"
            );
            assert!(err.position().is_some());
        }
    }

    #[test]
    fn test_parse_nesting_within_limit() {
        let parens = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(parse(&parens).is_ok());

        let chain = vec!["1"; 100].join(" + ");
        let e = parse(&chain).unwrap();
        assert!(e.height() <= MAX_DEPTH);
    }

    #[test]
    fn test_parse_rejects_infinite_float_literal() {
        let huge = format!("{}.0", "9".repeat(400));
        let err = parse(&huge).unwrap_err();
        assert!(err.is_parse());
        assert_eq!(err.position(), Some(0));
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_parse_unicode_positions() {
        let err = parse("\"é\" ~").unwrap_err();
        // 'é' is two bytes, so '~' sits at byte 5.
        assert_eq!(err.position(), Some(5));
    }
}
