//! Query compiler — binds a parsed expression to its input parameter,
//! checks it against the operator allow-list and plans it for execution.
//!
//! Compilation never evaluates any part of the expression. Everything that
//! can be rejected from the text alone (unknown identifiers, members outside
//! the allow-list, type mismatches) is rejected here as a parse error.

use crate::query::parser::{self, BinaryOp, Expr, FieldInit, Literal, Span, UnaryOp};
use crate::query::value::Value;
use crate::types::{QueryError, QueryResult};
use std::fmt;

/// Static type of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Person,
    Shape(Vec<(String, Type)>),
    Sequence(Box<Type>),
}

impl Type {
    fn is_numeric(&self) -> bool {
        matches!(self, Type::Integer | Type::Float)
    }

    fn is_orderable(&self) -> bool {
        matches!(
            self,
            Type::Integer | Type::Float | Type::String | Type::Bool | Type::Null
        )
    }

    fn is_scalar(&self) -> bool {
        self.is_orderable()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Null => f.write_str("null"),
            Type::Bool => f.write_str("Bool"),
            Type::Integer => f.write_str("Int"),
            Type::Float => f.write_str("Float"),
            Type::String => f.write_str("String"),
            Type::Person => f.write_str("Person"),
            Type::Shape(fields) => {
                f.write_str("{ ")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                f.write_str(" }")
            }
            Type::Sequence(inner) => write!(f, "sequence of {inner}"),
        }
    }
}

/// Resolved, type-checked expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Value),
    /// The bound input sequence.
    Source,
    /// A lambda parameter, addressed by nesting depth.
    Local(usize),
    Member {
        target: Box<Node>,
        member: Member,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Text {
        target: Box<Node>,
        method: TextMethod,
        arg: Option<Box<Node>>,
    },
    Sequence {
        source: Box<Node>,
        op: SequenceOp,
    },
    Shape(Vec<(String, Node)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Index,
    Name,
    /// Positional field of a projected shape.
    Field(usize),
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMethod {
    ToUpper,
    ToLower,
    Trim,
    Contains,
    StartsWith,
    EndsWith,
}

/// A lambda body evaluated with its parameter bound at `slot`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub slot: usize,
    pub body: Box<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub key: Lambda,
    pub descending: bool,
}

/// The allow-listed sequence operators.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOp {
    Where(Lambda),
    Select(Lambda),
    /// One `OrderBy*` followed by any number of `ThenBy*` keys.
    Order(Vec<SortKey>),
    Take(Box<Node>),
    Skip(Box<Node>),
    Reverse,
    Distinct,
    Count(Option<Lambda>),
    Any(Option<Lambda>),
    All(Lambda),
    First {
        predicate: Option<Lambda>,
        or_default: bool,
    },
    Last {
        predicate: Option<Lambda>,
        or_default: bool,
    },
    Sum(Option<Lambda>),
    Min(Option<Lambda>),
    Max(Option<Lambda>),
    Average(Option<Lambda>),
    Contains(Box<Node>),
}

/// Names accepted as sequence operators.
pub const SEQUENCE_OPERATORS: &[&str] = &[
    "Where",
    "Select",
    "OrderBy",
    "OrderByDescending",
    "ThenBy",
    "ThenByDescending",
    "Take",
    "Skip",
    "Reverse",
    "Distinct",
    "Count",
    "Any",
    "All",
    "First",
    "FirstOrDefault",
    "Last",
    "LastOrDefault",
    "Sum",
    "Min",
    "Max",
    "Average",
    "Contains",
];

/// A compiled, re-invokable query bound to one named input parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    parameter: String,
    text: String,
    body: Node,
    output: Type,
}

impl CompiledQuery {
    /// Name the input sequence is bound to.
    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    /// The source text this query was compiled from.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Static type of the value the query produces.
    pub fn output_type(&self) -> &Type {
        &self.output
    }

    pub fn body(&self) -> &Node {
        &self.body
    }
}

/// Compile query text with the dataset bound to `parameter` as a sequence of
/// `Person`.
pub fn compile(parameter: &str, text: &str) -> QueryResult<CompiledQuery> {
    let expr = parser::parse(text)?;

    let mut binder = Binder {
        parameter,
        scopes: Vec::new(),
    };
    let (body, output) = binder.bind(&expr)?;
    let body = plan(body);

    tracing::debug!(parameter, output = %output, "compiled query");

    Ok(CompiledQuery {
        parameter: parameter.to_string(),
        text: text.to_string(),
        body,
        output,
    })
}

// ── Binding and type checking ──

struct Scope {
    /// `None` for the implicit element of an operator argument written
    /// without a lambda.
    name: Option<String>,
    ty: Type,
}

struct Binder<'a> {
    parameter: &'a str,
    scopes: Vec<Scope>,
}

fn error_at(span: Span, token: &str, message: String) -> QueryError {
    QueryError::parse_at(message, span.start, token)
}

fn expr_token(expr: &Expr) -> String {
    match expr {
        Expr::Ident { name, .. } | Expr::Member { name, .. } | Expr::Call { name, .. } => {
            name.clone()
        }
        Expr::It { .. } => "it".to_string(),
        Expr::Literal { value, .. } => match value {
            Literal::Null => "null".to_string(),
            Literal::Bool(b) => b.to_string(),
            Literal::Integer(n) => n.to_string(),
            Literal::Float(f) => f.to_string(),
            Literal::String(s) => format!("\"{s}\""),
        },
        Expr::Unary { op, .. } => match op {
            UnaryOp::Not => "!".to_string(),
            UnaryOp::Neg => "-".to_string(),
        },
        Expr::Binary { op, .. } => op.symbol().to_string(),
        Expr::Lambda { .. } => "=>".to_string(),
        Expr::New { .. } => "new".to_string(),
    }
}

impl Binder<'_> {
    fn bind(&mut self, expr: &Expr) -> QueryResult<(Node, Type)> {
        match expr {
            Expr::Literal { value, .. } => Ok(match value {
                Literal::Null => (Node::Literal(Value::Null), Type::Null),
                Literal::Bool(b) => (Node::Literal(Value::Bool(*b)), Type::Bool),
                Literal::Integer(n) => (Node::Literal(Value::Integer(*n)), Type::Integer),
                Literal::Float(f) => (Node::Literal(Value::Float(*f)), Type::Float),
                Literal::String(s) => (Node::Literal(Value::String(s.clone())), Type::String),
            }),

            Expr::Ident { name, span } => self.bind_ident(name, *span),

            Expr::It { span } => match self.scopes.last() {
                Some(scope) => Ok((Node::Local(self.scopes.len() - 1), scope.ty.clone())),
                None => Err(error_at(
                    *span,
                    "it",
                    "'it' is only valid inside an operator argument".to_string(),
                )),
            },

            Expr::Member { target, name, span } => {
                let (node, ty) = self.bind(target)?;
                member_access(node, &ty, name, *span)
            }

            Expr::Call {
                target,
                name,
                args,
                span,
            } => {
                let (node, ty) = self.bind(target)?;
                match ty {
                    Type::Sequence(elem) => self.bind_sequence_op(node, *elem, name, args, *span),
                    Type::String => self.bind_text_method(node, name, args, *span),
                    other => Err(error_at(
                        *span,
                        name,
                        format!("unknown member '{name}' on {other}"),
                    )),
                }
            }

            Expr::Unary { op, operand, span } => {
                let (node, ty) = self.bind(operand)?;
                let result = match op {
                    UnaryOp::Not if ty == Type::Bool => Type::Bool,
                    UnaryOp::Neg if ty.is_numeric() => ty.clone(),
                    _ => {
                        let symbol = if *op == UnaryOp::Not { "!" } else { "-" };
                        return Err(error_at(
                            *span,
                            symbol,
                            format!("operator '{symbol}' cannot be applied to {ty}"),
                        ));
                    }
                };
                Ok((
                    Node::Unary {
                        op: *op,
                        operand: Box::new(node),
                    },
                    result,
                ))
            }

            Expr::Binary { op, lhs, rhs, .. } => {
                let (lnode, lty) = self.bind(lhs)?;
                let (rnode, rty) = self.bind(rhs)?;
                let ty = binary_type(*op, &lty, &rty).ok_or_else(|| {
                    // Point at the right operand: the left one was accepted.
                    error_at(
                        rhs.span(),
                        op.symbol(),
                        format!(
                            "operator '{}' cannot be applied to {lty} and {rty}",
                            op.symbol()
                        ),
                    )
                })?;
                Ok((
                    Node::Binary {
                        op: *op,
                        lhs: Box::new(lnode),
                        rhs: Box::new(rnode),
                    },
                    ty,
                ))
            }

            Expr::Lambda { param, span, .. } => Err(error_at(
                *span,
                param,
                "lambda expressions are only allowed as operator arguments".to_string(),
            )),

            Expr::New { fields, span } => self.bind_new(fields, *span),
        }
    }

    fn bind_ident(&mut self, name: &str, span: Span) -> QueryResult<(Node, Type)> {
        for (slot, scope) in self.scopes.iter().enumerate().rev() {
            if scope.name.as_deref() == Some(name) {
                return Ok((Node::Local(slot), scope.ty.clone()));
            }
        }

        if name == self.parameter {
            return Ok((Node::Source, Type::Sequence(Box::new(Type::Person))));
        }

        // Bare member names resolve against the implicit element.
        if let Some(scope) = self.scopes.last().filter(|s| s.name.is_none()) {
            let slot = self.scopes.len() - 1;
            let ty = scope.ty.clone();
            if let Ok(found) = member_access(Node::Local(slot), &ty, name, span) {
                return Ok(found);
            }
        }

        Err(error_at(span, name, format!("unknown identifier '{name}'")))
    }

    fn bind_new(&mut self, fields: &[FieldInit], span: Span) -> QueryResult<(Node, Type)> {
        let mut nodes = Vec::with_capacity(fields.len());
        let mut types = Vec::with_capacity(fields.len());

        for field in fields {
            let name = match (&field.name, &field.value) {
                (Some(name), _) => name.clone(),
                (None, Expr::Member { name, .. }) | (None, Expr::Ident { name, .. }) => {
                    name.clone()
                }
                (None, other) => {
                    return Err(error_at(
                        other.span(),
                        &expr_token(other),
                        "projection field needs a name; use 'Name = expr'".to_string(),
                    ))
                }
            };
            if types.iter().any(|(existing, _): &(String, Type)| *existing == name) {
                return Err(error_at(
                    field.value.span(),
                    &name,
                    format!("duplicate projection field '{name}'"),
                ));
            }

            let (node, ty) = self.bind(&field.value)?;
            nodes.push((name.clone(), node));
            types.push((name, ty));
        }

        if nodes.is_empty() {
            return Err(error_at(span, "new", "projection has no fields".to_string()));
        }
        Ok((Node::Shape(nodes), Type::Shape(types)))
    }

    /// Bind an operator argument as a lambda over `elem`.
    fn bind_lambda(&mut self, arg: &Expr, elem: &Type) -> QueryResult<(Lambda, Type)> {
        let slot = self.scopes.len();
        let (scope_name, body) = match arg {
            Expr::Lambda { param, body, span } => {
                let shadows = param == self.parameter
                    || self
                        .scopes
                        .iter()
                        .any(|s| s.name.as_deref() == Some(param.as_str()));
                if shadows {
                    return Err(error_at(
                        *span,
                        param,
                        format!("lambda parameter '{param}' shadows a name already in scope"),
                    ));
                }
                (Some(param.clone()), body.as_ref())
            }
            other => (None, other),
        };

        self.scopes.push(Scope {
            name: scope_name,
            ty: elem.clone(),
        });
        let bound = self.bind(body);
        self.scopes.pop();

        let (node, ty) = bound?;
        Ok((
            Lambda {
                slot,
                body: Box::new(node),
            },
            ty,
        ))
    }

    fn optional_lambda(
        &mut self,
        args: &[Expr],
        elem: &Type,
    ) -> QueryResult<Option<(Lambda, Type, Span)>> {
        match args.first() {
            Some(arg) => {
                let (lambda, ty) = self.bind_lambda(arg, elem)?;
                Ok(Some((lambda, ty, arg.span())))
            }
            None => Ok(None),
        }
    }

    fn bind_sequence_op(
        &mut self,
        source: Node,
        elem: Type,
        name: &str,
        args: &[Expr],
        span: Span,
    ) -> QueryResult<(Node, Type)> {
        let seq = |source: Node, op: SequenceOp| Node::Sequence {
            source: Box::new(source),
            op,
        };
        let same = Type::Sequence(Box::new(elem.clone()));

        match name {
            "Where" => {
                arity(name, args, 1, 1, span)?;
                let (pred, ty) = self.bind_lambda(&args[0], &elem)?;
                expect_bool(name, &ty, args[0].span())?;
                Ok((seq(source, SequenceOp::Where(pred)), same))
            }
            "Select" => {
                arity(name, args, 1, 1, span)?;
                let (sel, ty) = self.bind_lambda(&args[0], &elem)?;
                Ok((
                    seq(source, SequenceOp::Select(sel)),
                    Type::Sequence(Box::new(ty)),
                ))
            }
            "OrderBy" | "OrderByDescending" => {
                arity(name, args, 1, 1, span)?;
                let key = self.sort_key(&args[0], &elem, name == "OrderByDescending")?;
                Ok((seq(source, SequenceOp::Order(vec![key])), same))
            }
            "ThenBy" | "ThenByDescending" => {
                arity(name, args, 1, 1, span)?;
                let key = self.sort_key(&args[0], &elem, name == "ThenByDescending")?;
                match source {
                    Node::Sequence {
                        source: inner,
                        op: SequenceOp::Order(mut keys),
                    } => {
                        keys.push(key);
                        Ok((seq(*inner, SequenceOp::Order(keys)), same))
                    }
                    _ => Err(error_at(
                        span,
                        name,
                        format!("'{name}' must directly follow OrderBy or OrderByDescending"),
                    )),
                }
            }
            "Take" | "Skip" => {
                arity(name, args, 1, 1, span)?;
                let (count, ty) = self.bind(&args[0])?;
                if ty != Type::Integer {
                    return Err(error_at(
                        args[0].span(),
                        &expr_token(&args[0]),
                        format!("'{name}' count must be Int, found {ty}"),
                    ));
                }
                let op = if name == "Take" {
                    SequenceOp::Take(Box::new(count))
                } else {
                    SequenceOp::Skip(Box::new(count))
                };
                Ok((seq(source, op), same))
            }
            "Reverse" | "Distinct" => {
                arity(name, args, 0, 0, span)?;
                let op = if name == "Reverse" {
                    SequenceOp::Reverse
                } else {
                    SequenceOp::Distinct
                };
                Ok((seq(source, op), same))
            }
            "Count" | "Any" => {
                arity(name, args, 0, 1, span)?;
                let pred = self.optional_predicate(name, args, &elem)?;
                if name == "Count" {
                    Ok((seq(source, SequenceOp::Count(pred)), Type::Integer))
                } else {
                    Ok((seq(source, SequenceOp::Any(pred)), Type::Bool))
                }
            }
            "All" => {
                arity(name, args, 1, 1, span)?;
                let (pred, ty) = self.bind_lambda(&args[0], &elem)?;
                expect_bool(name, &ty, args[0].span())?;
                Ok((seq(source, SequenceOp::All(pred)), Type::Bool))
            }
            "First" | "FirstOrDefault" | "Last" | "LastOrDefault" => {
                arity(name, args, 0, 1, span)?;
                let predicate = self.optional_predicate(name, args, &elem)?;
                let or_default = name.ends_with("OrDefault");
                let op = if name.starts_with("First") {
                    SequenceOp::First {
                        predicate,
                        or_default,
                    }
                } else {
                    SequenceOp::Last {
                        predicate,
                        or_default,
                    }
                };
                Ok((seq(source, op), elem))
            }
            "Sum" | "Average" => {
                arity(name, args, 0, 1, span)?;
                let (selector, ty) = self.optional_selector(args, &elem)?;
                if !ty.is_numeric() {
                    return Err(error_at(
                        args.first().map(Expr::span).unwrap_or(span),
                        name,
                        format!("'{name}' requires numeric values, found {ty}"),
                    ));
                }
                if name == "Sum" {
                    Ok((seq(source, SequenceOp::Sum(selector)), ty))
                } else {
                    Ok((seq(source, SequenceOp::Average(selector)), Type::Float))
                }
            }
            "Min" | "Max" => {
                arity(name, args, 0, 1, span)?;
                let (selector, ty) = self.optional_selector(args, &elem)?;
                if !ty.is_orderable() {
                    return Err(error_at(
                        args.first().map(Expr::span).unwrap_or(span),
                        name,
                        format!("'{name}' requires orderable values, found {ty}"),
                    ));
                }
                let op = if name == "Min" {
                    SequenceOp::Min(selector)
                } else {
                    SequenceOp::Max(selector)
                };
                Ok((seq(source, op), ty))
            }
            "Contains" => {
                arity(name, args, 1, 1, span)?;
                let (value, ty) = self.bind(&args[0])?;
                if !equatable(&elem, &ty) {
                    return Err(error_at(
                        args[0].span(),
                        &expr_token(&args[0]),
                        format!("'Contains' expects {elem}, found {ty}"),
                    ));
                }
                Ok((seq(source, SequenceOp::Contains(Box::new(value))), Type::Bool))
            }
            _ => Err(error_at(
                span,
                name,
                format!("unknown member '{name}' on sequence of {elem}"),
            )),
        }
    }

    fn sort_key(&mut self, arg: &Expr, elem: &Type, descending: bool) -> QueryResult<SortKey> {
        let (key, ty) = self.bind_lambda(arg, elem)?;
        if !ty.is_orderable() {
            return Err(error_at(
                arg.span(),
                &expr_token(arg),
                format!("ordering key must be a scalar value, found {ty}"),
            ));
        }
        Ok(SortKey { key, descending })
    }

    fn optional_predicate(
        &mut self,
        name: &str,
        args: &[Expr],
        elem: &Type,
    ) -> QueryResult<Option<Lambda>> {
        match self.optional_lambda(args, elem)? {
            Some((lambda, ty, span)) => {
                expect_bool(name, &ty, span)?;
                Ok(Some(lambda))
            }
            None => Ok(None),
        }
    }

    fn optional_selector(
        &mut self,
        args: &[Expr],
        elem: &Type,
    ) -> QueryResult<(Option<Lambda>, Type)> {
        match self.optional_lambda(args, elem)? {
            Some((lambda, ty, _)) => Ok((Some(lambda), ty)),
            None => Ok((None, elem.clone())),
        }
    }

    fn bind_text_method(
        &mut self,
        target: Node,
        name: &str,
        args: &[Expr],
        span: Span,
    ) -> QueryResult<(Node, Type)> {
        let (method, takes_arg, result) = match name {
            "ToUpper" => (TextMethod::ToUpper, false, Type::String),
            "ToLower" => (TextMethod::ToLower, false, Type::String),
            "Trim" => (TextMethod::Trim, false, Type::String),
            "Contains" => (TextMethod::Contains, true, Type::Bool),
            "StartsWith" => (TextMethod::StartsWith, true, Type::Bool),
            "EndsWith" => (TextMethod::EndsWith, true, Type::Bool),
            _ => {
                return Err(error_at(
                    span,
                    name,
                    format!("unknown member '{name}' on String"),
                ))
            }
        };

        let expected = usize::from(takes_arg);
        arity(name, args, expected, expected, span)?;
        let arg = match args.first() {
            Some(expr) => {
                let (node, ty) = self.bind(expr)?;
                if ty != Type::String {
                    return Err(error_at(
                        expr.span(),
                        &expr_token(expr),
                        format!("'{name}' expects a String argument, found {ty}"),
                    ));
                }
                Some(Box::new(node))
            }
            None => None,
        };

        Ok((
            Node::Text {
                target: Box::new(target),
                method,
                arg,
            },
            result,
        ))
    }
}

fn member_access(target: Node, ty: &Type, name: &str, span: Span) -> QueryResult<(Node, Type)> {
    let member = |member: Member, ty: Type| -> QueryResult<(Node, Type)> {
        Ok((
            Node::Member {
                target: Box::new(target.clone()),
                member,
            },
            ty,
        ))
    };

    match (ty, name) {
        (Type::Person, "Index") => member(Member::Index, Type::Integer),
        (Type::Person, "Name") => member(Member::Name, Type::String),
        (Type::String, "Length") => member(Member::Length, Type::Integer),
        (Type::Shape(fields), _) => match fields.iter().position(|(n, _)| n == name) {
            Some(i) => member(Member::Field(i), fields[i].1.clone()),
            None => Err(error_at(
                span,
                name,
                format!("unknown member '{name}' on {ty}"),
            )),
        },
        (Type::Sequence(_), _) if SEQUENCE_OPERATORS.contains(&name) => Err(error_at(
            span,
            name,
            format!("'{name}' is an operator and must be called as {name}(...)"),
        )),
        _ => Err(error_at(
            span,
            name,
            format!("unknown member '{name}' on {ty}"),
        )),
    }
}

fn arity(name: &str, args: &[Expr], min: usize, max: usize, span: Span) -> QueryResult<()> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        format!("{min}")
    } else {
        format!("{min} to {max}")
    };
    let plural = if max == 1 { "" } else { "s" };
    Err(error_at(
        span,
        name,
        format!(
            "'{name}' expects {expected} argument{plural}, found {}",
            args.len()
        ),
    ))
}

fn expect_bool(name: &str, ty: &Type, span: Span) -> QueryResult<()> {
    if *ty == Type::Bool {
        Ok(())
    } else {
        Err(error_at(
            span,
            name,
            format!("'{name}' predicate must be Bool, found {ty}"),
        ))
    }
}

fn equatable(a: &Type, b: &Type) -> bool {
    a == b || (a.is_numeric() && b.is_numeric()) || *a == Type::Null || *b == Type::Null
}

/// Result type of a binary operator, or `None` when the operands don't fit.
fn binary_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Option<Type> {
    use BinaryOp::*;
    match op {
        Or | And => (*lhs == Type::Bool && *rhs == Type::Bool).then_some(Type::Bool),
        Eq | Neq => equatable(lhs, rhs).then_some(Type::Bool),
        Lt | Lte | Gt | Gte => {
            let ok = (lhs.is_numeric() && rhs.is_numeric())
                || (*lhs == Type::String && *rhs == Type::String);
            ok.then_some(Type::Bool)
        }
        Add if *lhs == Type::String || *rhs == Type::String => {
            (lhs.is_scalar() && rhs.is_scalar()).then_some(Type::String)
        }
        Add | Sub | Mul | Div | Rem => match (lhs, rhs) {
            (Type::Integer, Type::Integer) => Some(Type::Integer),
            (l, r) if l.is_numeric() && r.is_numeric() => Some(Type::Float),
            _ => None,
        },
    }
}

// ── Planning ──

/// Rewrite a checked tree for execution.
///
/// An ordering applied directly over `Take`/`Skip` binds before the slice,
/// as `ORDER BY` does before `LIMIT`, unless the sliced sequence was already
/// ordered. Filters, projections and aggregates keep their position.
fn plan(node: Node) -> Node {
    match node {
        Node::Sequence {
            source,
            op: SequenceOp::Order(keys),
        } => {
            let keys = keys.into_iter().map(plan_sort_key).collect();
            let source = plan(*source);
            if is_slice_over_unordered(&source) {
                order_below_slices(source, keys)
            } else {
                Node::Sequence {
                    source: Box::new(source),
                    op: SequenceOp::Order(keys),
                }
            }
        }
        Node::Sequence { source, op } => Node::Sequence {
            source: Box::new(plan(*source)),
            op: plan_op(op),
        },
        Node::Member { target, member } => Node::Member {
            target: Box::new(plan(*target)),
            member,
        },
        Node::Unary { op, operand } => Node::Unary {
            op,
            operand: Box::new(plan(*operand)),
        },
        Node::Binary { op, lhs, rhs } => Node::Binary {
            op,
            lhs: Box::new(plan(*lhs)),
            rhs: Box::new(plan(*rhs)),
        },
        Node::Text {
            target,
            method,
            arg,
        } => Node::Text {
            target: Box::new(plan(*target)),
            method,
            arg: arg.map(|a| Box::new(plan(*a))),
        },
        Node::Shape(fields) => {
            Node::Shape(fields.into_iter().map(|(n, v)| (n, plan(v))).collect())
        }
        leaf @ (Node::Literal(_) | Node::Source | Node::Local(_)) => leaf,
    }
}

fn plan_lambda(lambda: Lambda) -> Lambda {
    Lambda {
        slot: lambda.slot,
        body: Box::new(plan(*lambda.body)),
    }
}

fn plan_sort_key(key: SortKey) -> SortKey {
    SortKey {
        key: plan_lambda(key.key),
        descending: key.descending,
    }
}

fn plan_op(op: SequenceOp) -> SequenceOp {
    let opt = |l: Option<Lambda>| l.map(plan_lambda);
    match op {
        SequenceOp::Where(l) => SequenceOp::Where(plan_lambda(l)),
        SequenceOp::Select(l) => SequenceOp::Select(plan_lambda(l)),
        SequenceOp::Order(keys) => SequenceOp::Order(keys.into_iter().map(plan_sort_key).collect()),
        SequenceOp::Take(n) => SequenceOp::Take(Box::new(plan(*n))),
        SequenceOp::Skip(n) => SequenceOp::Skip(Box::new(plan(*n))),
        SequenceOp::Reverse => SequenceOp::Reverse,
        SequenceOp::Distinct => SequenceOp::Distinct,
        SequenceOp::Count(l) => SequenceOp::Count(opt(l)),
        SequenceOp::Any(l) => SequenceOp::Any(opt(l)),
        SequenceOp::All(l) => SequenceOp::All(plan_lambda(l)),
        SequenceOp::First {
            predicate,
            or_default,
        } => SequenceOp::First {
            predicate: opt(predicate),
            or_default,
        },
        SequenceOp::Last {
            predicate,
            or_default,
        } => SequenceOp::Last {
            predicate: opt(predicate),
            or_default,
        },
        SequenceOp::Sum(l) => SequenceOp::Sum(opt(l)),
        SequenceOp::Min(l) => SequenceOp::Min(opt(l)),
        SequenceOp::Max(l) => SequenceOp::Max(opt(l)),
        SequenceOp::Average(l) => SequenceOp::Average(opt(l)),
        SequenceOp::Contains(v) => SequenceOp::Contains(Box::new(plan(*v))),
    }
}

fn is_slice(node: &Node) -> bool {
    matches!(
        node,
        Node::Sequence {
            op: SequenceOp::Take(_) | SequenceOp::Skip(_),
            ..
        }
    )
}

/// True when `node` is a run of slices whose input has no ordering.
fn is_slice_over_unordered(node: &Node) -> bool {
    let mut cur = node;
    let mut saw_slice = false;
    while let Node::Sequence { source, op } = cur {
        match op {
            SequenceOp::Take(_) | SequenceOp::Skip(_) => {
                saw_slice = true;
                cur = &**source;
            }
            SequenceOp::Order(_) => return false,
            _ => break,
        }
    }
    saw_slice
}

fn order_below_slices(node: Node, keys: Vec<SortKey>) -> Node {
    if !is_slice(&node) {
        return Node::Sequence {
            source: Box::new(node),
            op: SequenceOp::Order(keys),
        };
    }
    match node {
        Node::Sequence { source, op } => Node::Sequence {
            source: Box::new(order_below_slices(*source, keys)),
            op,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(text: &str) -> CompiledQuery {
        compile("people", text).unwrap_or_else(|e| panic!("should compile: {text}\n{e}"))
    }

    fn err(text: &str) -> QueryError {
        match compile("people", text) {
            Ok(q) => panic!("should not compile: {text}\n{:?}", q.output_type()),
            Err(e) => e,
        }
    }

    fn op_chain(node: &Node) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut cur = node;
        while let Node::Sequence { source, op } = cur {
            names.push(match op {
                SequenceOp::Where(_) => "Where",
                SequenceOp::Select(_) => "Select",
                SequenceOp::Order(_) => "Order",
                SequenceOp::Take(_) => "Take",
                SequenceOp::Skip(_) => "Skip",
                _ => "other",
            });
            cur = &**source;
        }
        names.reverse();
        names
    }

    #[test]
    fn test_compile_output_types() {
        let person_seq = Type::Sequence(Box::new(Type::Person));
        assert_eq!(*ok("people").output_type(), person_seq);
        assert_eq!(*ok("people.Take(10)").output_type(), person_seq);
        assert_eq!(*ok("people.Count()").output_type(), Type::Integer);
        assert_eq!(*ok("people.Any(p => p.Index > 3)").output_type(), Type::Bool);
        assert_eq!(*ok("people.First()").output_type(), Type::Person);
        assert_eq!(*ok("people.Sum(p => p.Index)").output_type(), Type::Integer);
        assert_eq!(*ok("people.Average(p => p.Index)").output_type(), Type::Float);
        assert_eq!(*ok("people.Max(p => p.Name)").output_type(), Type::String);
        assert_eq!(
            *ok("people.Select(p => p.Name.ToUpper())").output_type(),
            Type::Sequence(Box::new(Type::String))
        );
    }

    #[test]
    fn test_compile_projection_shape() {
        let q = ok("people.Select(p => new { p.Name, Double = p.Index * 2 })");
        assert_eq!(
            *q.output_type(),
            Type::Sequence(Box::new(Type::Shape(vec![
                ("Name".to_string(), Type::String),
                ("Double".to_string(), Type::Integer),
            ])))
        );

        // Members of the projected shape are visible downstream.
        ok("people.Select(p => new { p.Name, Double = p.Index * 2 }).Where(x => x.Double > 10)");
    }

    #[test]
    fn test_compile_implicit_element() {
        ok("people.Where(Index > 5).OrderBy(Name)");
        ok("people.Where(it.Index > 5)");
        ok("people.Select(new (Name as Label, Index))");
    }

    #[test]
    fn test_compile_nested_query() {
        let q = ok("people.Where(p => people.Any(q => q.Index == p.Index * 2))");
        assert_eq!(q.parameter(), "people");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let text = "people.Where(p => p.Index % 3 == 0).OrderByDescending(p => p.Name).Take(4)";
        assert_eq!(ok(text), ok(text));
    }

    #[test]
    fn test_unknown_sequence_member() {
        let e = err("people.Explode()");
        assert!(e.is_parse());
        assert_eq!(e.token(), Some("Explode"));
        assert_eq!(e.position(), Some(7));
        assert!(e.to_string().contains("unknown member 'Explode'"));
    }

    #[test]
    fn test_unknown_identifiers_and_members() {
        assert_eq!(err("persons.Take(1)").token(), Some("persons"));
        assert_eq!(err("people.Where(p => p.Age > 3)").token(), Some("Age"));
        assert_eq!(err("people.Where(p => q.Index > 3)").token(), Some("q"));
        assert_eq!(err("people.Select(p => p.Name.Reverse())").token(), Some("Reverse"));
        assert_eq!(err("people.Select(p => p.GetType())").token(), Some("GetType"));
        assert_eq!(err("people.Count").token(), Some("Count"));
        assert_eq!(err("it").token(), Some("it"));
    }

    #[test]
    fn test_type_errors_are_parse_errors() {
        let cases = [
            "people.Where(p => p.Index)",
            "people.Where(p => p.Name > 3)",
            "people.Take(\"ten\")",
            "people.Sum(p => p.Name)",
            "people.OrderBy(p => p)",
            "people.Select(p => !p.Index)",
            "people.Select(p => -p.Name)",
            "people.Select(p => p.Index && true)",
            "people.Contains(3)",
            "people.Select(p => p.Name.StartsWith(1))",
            "people + 1",
        ];
        for text in cases {
            assert!(err(text).is_parse(), "{text}");
        }
    }

    #[test]
    fn test_arity_errors() {
        let e = err("people.Take()");
        assert!(e.to_string().contains("'Take' expects 1 argument, found 0"));
        assert!(err("people.Where(p => true, p => false)").is_parse());
        assert!(err("people.Select(p => p.Name.ToUpper(1))").is_parse());
    }

    #[test]
    fn test_lambda_rules() {
        assert!(err("p => p.Index").is_parse());
        assert!(err("people.Where(people => true)").is_parse());
        assert!(err("people.Where(p => people.Any(p => true))").is_parse());
    }

    #[test]
    fn test_projection_rules() {
        assert!(err("people.Select(p => new { p.Index + 1 })").is_parse());
        assert!(err("people.Select(p => new { p.Name, Name = p.Name })").is_parse());
    }

    #[test]
    fn test_then_by_requires_order_by() {
        ok("people.OrderBy(p => p.Name.Length).ThenByDescending(p => p.Index)");
        let e = err("people.Where(p => true).ThenBy(p => p.Index)");
        assert_eq!(e.token(), Some("ThenBy"));
    }

    #[test]
    fn test_plan_orders_before_slices() {
        let q = ok("people.Take(10).OrderByDescending(p => p.Index)");
        assert_eq!(op_chain(q.body()), vec!["Order", "Take"]);

        let q = ok("people.Skip(5).Take(10).OrderBy(p => p.Index)");
        assert_eq!(op_chain(q.body()), vec!["Order", "Skip", "Take"]);
    }

    #[test]
    fn test_plan_keeps_explicit_order_before_slice() {
        let q = ok("people.OrderBy(p => p.Name).Take(3).OrderBy(p => p.Index)");
        assert_eq!(op_chain(q.body()), vec!["Order", "Take", "Order"]);
    }

    #[test]
    fn test_plan_never_crosses_filters_or_projections() {
        let q = ok("people.Take(10).Where(p => p.Index > 2).OrderBy(p => p.Index)");
        assert_eq!(op_chain(q.body()), vec!["Take", "Where", "Order"]);

        let q = ok("people.Take(10).Select(p => p.Index).OrderBy(i => i)");
        assert_eq!(op_chain(q.body()), vec!["Take", "Select", "Order"]);
    }

    #[test]
    fn test_type_display() {
        assert_eq!(
            Type::Sequence(Box::new(Type::Shape(vec![("Name".into(), Type::String)]))).to_string(),
            "sequence of { Name: String }"
        );
    }
}
