//! Query executor — evaluates a compiled query against a set of records.

use crate::query::compiler::{CompiledQuery, Lambda, Member, Node, SequenceOp, SortKey, TextMethod};
use crate::query::parser::{BinaryOp, UnaryOp};
use crate::query::value::Value;
use crate::types::{Person, QueryError, QueryResult};
use std::cmp::Ordering;
use std::sync::Arc;

/// Work units one query may spend before it is abandoned.
///
/// Every node evaluation costs one unit and every record read from the
/// source costs one more, so nested scans of the source fail quickly
/// instead of growing with the dataset size raised to the nesting depth.
pub const DEFAULT_STEP_BUDGET: u64 = 1_000_000;

/// Execute a compiled query with `people` bound to its input parameter.
///
/// Results are fully materialized before returning; nothing borrows from
/// `people` afterwards.
pub fn execute(query: &CompiledQuery, people: &[Person]) -> QueryResult<Value> {
    execute_with_budget(query, people, DEFAULT_STEP_BUDGET)
}

/// Like [`execute`], with an explicit work budget.
pub fn execute_with_budget(
    query: &CompiledQuery,
    people: &[Person],
    budget: u64,
) -> QueryResult<Value> {
    let mut frame = Frame {
        source: people
            .iter()
            .map(|p| Value::Record(Arc::new(p.clone())))
            .collect(),
        locals: Vec::new(),
        budget,
        remaining: budget,
    };
    frame.eval(query.body())
}

struct Frame {
    /// Records shared by every reference to the source.
    source: Arc<[Value]>,
    /// Lambda arguments, indexed by the lambda's nesting depth.
    locals: Vec<Value>,
    budget: u64,
    remaining: u64,
}

impl Frame {
    fn charge(&mut self, units: u64) -> QueryResult<()> {
        match self.remaining.checked_sub(units) {
            Some(left) => {
                self.remaining = left;
                Ok(())
            }
            None => Err(QueryError::runtime(format!(
                "query exceeded its budget of {} evaluation steps",
                self.budget
            ))),
        }
    }

    fn eval(&mut self, node: &Node) -> QueryResult<Value> {
        self.charge(1)?;
        match node {
            Node::Literal(value) => Ok(value.clone()),
            Node::Source => {
                self.charge(self.source.len() as u64)?;
                Ok(Value::Sequence(self.source.to_vec()))
            }
            Node::Local(slot) => self
                .locals
                .get(*slot)
                .cloned()
                .ok_or_else(|| QueryError::runtime(format!("unbound lambda parameter #{slot}"))),
            Node::Member { target, member } => {
                let value = self.eval(target)?;
                member_of(value, *member)
            }
            Node::Unary { op, operand } => {
                let value = self.eval(operand)?;
                unary(*op, value)
            }
            Node::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            Node::Text {
                target,
                method,
                arg,
            } => {
                let text = match self.eval(target)? {
                    Value::String(s) => s,
                    other => {
                        return Err(QueryError::runtime(format!(
                            "string method called on {}",
                            other.type_name()
                        )))
                    }
                };
                let arg = match arg {
                    Some(node) => match self.eval(node)? {
                        Value::String(s) => Some(s),
                        other => {
                            return Err(QueryError::runtime(format!(
                                "expected a String argument, found {}",
                                other.type_name()
                            )))
                        }
                    },
                    None => None,
                };
                Ok(text_method(&text, *method, arg.as_deref()))
            }
            Node::Sequence { source, op } => {
                let items = match self.eval(source)? {
                    Value::Sequence(items) => items,
                    other => {
                        return Err(QueryError::runtime(format!(
                            "expected a sequence, found {}",
                            other.type_name()
                        )))
                    }
                };
                self.sequence_op(items, op)
            }
            Node::Shape(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, node) in fields {
                    values.push((name.clone(), self.eval(node)?));
                }
                Ok(Value::Shape(values))
            }
        }
    }

    /// Evaluate a lambda body with `arg` bound to its parameter.
    fn call(&mut self, lambda: &Lambda, arg: Value) -> QueryResult<Value> {
        self.locals.truncate(lambda.slot);
        self.locals.push(arg);
        let result = self.eval(&lambda.body);
        self.locals.truncate(lambda.slot);
        result
    }

    fn test(&mut self, predicate: &Lambda, arg: Value) -> QueryResult<bool> {
        match self.call(predicate, arg)? {
            Value::Bool(b) => Ok(b),
            other => Err(QueryError::runtime(format!(
                "predicate produced {} instead of Bool",
                other.type_name()
            ))),
        }
    }

    fn filter(&mut self, items: Vec<Value>, predicate: Option<&Lambda>) -> QueryResult<Vec<Value>> {
        let Some(predicate) = predicate else {
            return Ok(items);
        };
        let mut kept = Vec::new();
        for item in items {
            if self.test(predicate, item.clone())? {
                kept.push(item);
            }
        }
        Ok(kept)
    }

    fn project(&mut self, items: Vec<Value>, selector: Option<&Lambda>) -> QueryResult<Vec<Value>> {
        match selector {
            Some(selector) => items
                .into_iter()
                .map(|item| self.call(selector, item))
                .collect(),
            None => Ok(items),
        }
    }

    fn count_arg(&mut self, name: &str, node: &Node) -> QueryResult<usize> {
        match self.eval(node)? {
            Value::Integer(n) if n >= 0 => Ok(usize::try_from(n).unwrap_or(usize::MAX)),
            Value::Integer(n) => Err(QueryError::runtime(format!(
                "{name} count must not be negative, found {n}"
            ))),
            other => Err(QueryError::runtime(format!(
                "{name} count must be Int, found {}",
                other.type_name()
            ))),
        }
    }

    fn sequence_op(&mut self, items: Vec<Value>, op: &SequenceOp) -> QueryResult<Value> {
        match op {
            SequenceOp::Where(predicate) => Ok(Value::Sequence(self.filter(items, Some(predicate))?)),
            SequenceOp::Select(selector) => Ok(Value::Sequence(self.project(items, Some(selector))?)),
            SequenceOp::Order(keys) => Ok(Value::Sequence(self.order(items, keys)?)),
            SequenceOp::Take(count) => {
                let n = self.count_arg("Take", count)?;
                Ok(Value::Sequence(items.into_iter().take(n).collect()))
            }
            SequenceOp::Skip(count) => {
                let n = self.count_arg("Skip", count)?;
                Ok(Value::Sequence(items.into_iter().skip(n).collect()))
            }
            SequenceOp::Reverse => {
                let mut items = items;
                items.reverse();
                Ok(Value::Sequence(items))
            }
            SequenceOp::Distinct => {
                let mut unique: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    if !unique.iter().any(|seen| seen.loosely_equals(&item)) {
                        unique.push(item);
                    }
                }
                Ok(Value::Sequence(unique))
            }
            SequenceOp::Count(predicate) => {
                let matched = self.filter(items, predicate.as_ref())?;
                Ok(Value::Integer(matched.len() as i64))
            }
            SequenceOp::Any(predicate) => {
                for item in items {
                    let hit = match predicate {
                        Some(p) => self.test(p, item)?,
                        None => true,
                    };
                    if hit {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            SequenceOp::All(predicate) => {
                for item in items {
                    if !self.test(predicate, item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            SequenceOp::First {
                predicate,
                or_default,
            } => {
                let matched = self.filter(items, predicate.as_ref())?;
                single(matched.into_iter().next(), *or_default, predicate.is_some())
            }
            SequenceOp::Last {
                predicate,
                or_default,
            } => {
                let matched = self.filter(items, predicate.as_ref())?;
                single(matched.into_iter().last(), *or_default, predicate.is_some())
            }
            SequenceOp::Sum(selector) => {
                let values = self.project(items, selector.as_ref())?;
                sum(&values)
            }
            SequenceOp::Average(selector) => {
                let values = self.project(items, selector.as_ref())?;
                if values.is_empty() {
                    return Err(QueryError::runtime("Average of an empty sequence"));
                }
                let mut total = 0.0;
                for value in &values {
                    total += numeric(value, "Average")?;
                }
                finite(total / values.len() as f64, "Average")
            }
            SequenceOp::Min(selector) | SequenceOp::Max(selector) => {
                let is_min = matches!(op, SequenceOp::Min(_));
                let values = self.project(items, selector.as_ref())?;
                let best = if is_min {
                    values.into_iter().min_by(|a, b| a.sort_cmp(b))
                } else {
                    values.into_iter().max_by(|a, b| a.sort_cmp(b))
                };
                best.ok_or_else(|| {
                    let name = if is_min { "Min" } else { "Max" };
                    QueryError::runtime(format!("{name} of an empty sequence"))
                })
            }
            SequenceOp::Contains(needle) => {
                let needle = self.eval(needle)?;
                Ok(Value::Bool(items.iter().any(|item| item.loosely_equals(&needle))))
            }
        }
    }

    /// Stable sort on keys computed once per element.
    fn order(&mut self, items: Vec<Value>, keys: &[SortKey]) -> QueryResult<Vec<Value>> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let mut row = Vec::with_capacity(keys.len());
            for key in keys {
                row.push(self.call(&key.key, item.clone())?);
            }
            keyed.push((row, item));
        }

        keyed.sort_by(|(a, _), (b, _)| {
            for (i, key) in keys.iter().enumerate() {
                let ord = a[i].sort_cmp(&b[i]);
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        Ok(keyed.into_iter().map(|(_, item)| item).collect())
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Node, rhs: &Node) -> QueryResult<Value> {
        // Logical operators short-circuit.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = truthy(self.eval(lhs)?, op)?;
            if (op == BinaryOp::And && !left) || (op == BinaryOp::Or && left) {
                return Ok(Value::Bool(left));
            }
            return Ok(Value::Bool(truthy(self.eval(rhs)?, op)?));
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        match op {
            BinaryOp::Eq => Ok(Value::Bool(left.loosely_equals(&right))),
            BinaryOp::Neq => Ok(Value::Bool(!left.loosely_equals(&right))),
            BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
                let ord = compare(&left, &right, op)?;
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::Lte => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }))
            }
            BinaryOp::Add
                if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) =>
            {
                Ok(Value::String(format!("{left}{right}")))
            }
            _ => arithmetic(op, &left, &right),
        }
    }
}

fn member_of(value: Value, member: Member) -> QueryResult<Value> {
    match (value, member) {
        (Value::Record(p), Member::Index) => Ok(Value::Integer(p.index)),
        (Value::Record(p), Member::Name) => Ok(Value::String(p.name.clone())),
        (Value::String(s), Member::Length) => Ok(Value::Integer(s.chars().count() as i64)),
        (Value::Shape(mut fields), Member::Field(i)) if i < fields.len() => {
            Ok(fields.swap_remove(i).1)
        }
        (Value::Null, _) => Err(QueryError::runtime("member access on a null value")),
        (other, member) => Err(QueryError::runtime(format!(
            "{member:?} is not a member of {}",
            other.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: Value) -> QueryResult<Value> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Integer(n)) => n
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| QueryError::runtime("integer overflow in negation")),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (op, other) => Err(QueryError::runtime(format!(
            "operator {op:?} cannot be applied to {}",
            other.type_name()
        ))),
    }
}

fn truthy(value: Value, op: BinaryOp) -> QueryResult<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(QueryError::runtime(format!(
            "operator '{}' expects Bool, found {}",
            op.symbol(),
            other.type_name()
        ))),
    }
}

fn compare(left: &Value, right: &Value, op: BinaryOp) -> QueryResult<Ordering> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => Ok(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(x.total_cmp(&y)),
            _ => Err(QueryError::runtime(format!(
                "operator '{}' cannot compare {} and {}",
                op.symbol(),
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> QueryResult<Value> {
    let overflow = || QueryError::runtime(format!("integer overflow in '{}'", op.symbol()));

    if let (Value::Integer(a), Value::Integer(b)) = (left, right) {
        let (a, b) = (*a, *b);
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0 {
            return Err(QueryError::runtime("division by zero"));
        }
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        return result.map(Value::Integer).ok_or_else(overflow);
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(QueryError::runtime(format!(
            "operator '{}' cannot be applied to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )));
    };
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0.0 {
        return Err(QueryError::runtime("division by zero"));
    }
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => {
            return Err(QueryError::runtime(format!(
                "'{}' is not an arithmetic operator",
                op.symbol()
            )))
        }
    };
    finite(result, op.symbol())
}

/// JSON has no NaN or infinity, so a float leaving the finite range is an error.
fn finite(value: f64, op: &str) -> QueryResult<Value> {
    if value.is_finite() {
        Ok(Value::Float(value))
    } else {
        Err(QueryError::runtime(format!("float overflow in '{op}'")))
    }
}

fn text_method(text: &str, method: TextMethod, arg: Option<&str>) -> Value {
    let arg = arg.unwrap_or_default();
    match method {
        TextMethod::ToUpper => Value::String(text.to_uppercase()),
        TextMethod::ToLower => Value::String(text.to_lowercase()),
        TextMethod::Trim => Value::String(text.trim().to_string()),
        TextMethod::Contains => Value::Bool(text.contains(arg)),
        TextMethod::StartsWith => Value::Bool(text.starts_with(arg)),
        TextMethod::EndsWith => Value::Bool(text.ends_with(arg)),
    }
}

fn single(found: Option<Value>, or_default: bool, filtered: bool) -> QueryResult<Value> {
    match found {
        Some(value) => Ok(value),
        None if or_default => Ok(Value::Null),
        None if filtered => Err(QueryError::runtime("sequence contains no matching element")),
        None => Err(QueryError::runtime("sequence contains no elements")),
    }
}

fn numeric(value: &Value, op: &str) -> QueryResult<f64> {
    value.as_f64().ok_or_else(|| {
        QueryError::runtime(format!(
            "{op} expects numeric values, found {}",
            value.type_name()
        ))
    })
}

/// Integer sums stay integral; any float widens the total. Empty sums are 0.
fn sum(values: &[Value]) -> QueryResult<Value> {
    let mut total = Value::Integer(0);
    for value in values {
        if matches!(value, Value::Null) {
            continue;
        }
        numeric(value, "Sum")?;
        total = arithmetic(BinaryOp::Add, &total, value)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compiler::compile;
    use crate::types::Dataset;

    fn run(text: &str) -> QueryResult<Value> {
        let query = compile("people", text)?;
        execute(&query, Dataset::generate(100).people())
    }

    fn indices(text: &str) -> Vec<i64> {
        match run(text) {
            Ok(Value::Sequence(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::Record(p) => p.index,
                    Value::Integer(n) => n,
                    other => panic!("unexpected element {other:?}"),
                })
                .collect(),
            other => panic!("expected a sequence from {text}, got {other:?}"),
        }
    }

    #[test]
    fn test_take_then_order_descending() {
        let got = indices("people.Take(10).OrderByDescending(p => p.Index)");
        assert_eq!(got, (91..=100).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_filter_order_slice() {
        assert_eq!(
            indices("people.Where(p => p.Index % 10 == 0).OrderByDescending(p => p.Index).Skip(1).Take(3)"),
            vec![90, 80, 70]
        );
        assert_eq!(indices("people.Where(Index > 98)"), vec![99, 100]);
        assert_eq!(indices("people.Reverse().Take(2)"), vec![100, 99]);
    }

    #[test]
    fn test_then_by_breaks_ties() {
        assert_eq!(
            indices("people.OrderBy(p => p.Name.Length).ThenByDescending(p => p.Index).Take(3)"),
            vec![9, 8, 7]
        );
    }

    #[test]
    fn test_projection_keeps_field_order() {
        let value = run("people.Where(p => p.Index <= 2).Select(p => new { p.Name, Double = p.Index * 2 })")
            .unwrap();
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"[{"name":"Minion #1","double":2},{"name":"Minion #2","double":4}]"#
        );
    }

    #[test]
    fn test_aggregates() {
        assert_eq!(run("people.Count()").unwrap(), Value::Integer(100));
        assert_eq!(run("people.Count(p => p.Index > 90)").unwrap(), Value::Integer(10));
        assert_eq!(run("people.Sum(p => p.Index)").unwrap(), Value::Integer(5050));
        assert_eq!(run("people.Average(p => p.Index)").unwrap(), Value::Float(50.5));
        assert_eq!(run("people.Max(p => p.Index)").unwrap(), Value::Integer(100));
        assert_eq!(run("people.Min(p => p.Name)").unwrap(), Value::String("Minion #1".into()));
        assert_eq!(run("people.Any(p => p.Index == 42)").unwrap(), Value::Bool(true));
        assert_eq!(run("people.All(p => p.Index > 1)").unwrap(), Value::Bool(false));
        assert_eq!(run("people.Where(p => false).Sum(p => p.Index)").unwrap(), Value::Integer(0));
        assert_eq!(
            run("people.Select(p => p.Index).Contains(7)").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_element_operators() {
        assert_eq!(
            run("people.First()").unwrap(),
            Value::Record(Arc::new(Person::new(1)))
        );
        assert_eq!(
            run("people.Last(p => p.Index < 50)").unwrap(),
            Value::Record(Arc::new(Person::new(49)))
        );
        assert_eq!(run("people.FirstOrDefault(p => p.Index > 500)").unwrap(), Value::Null);
        assert!(!run("people.First(p => p.Index > 500)").unwrap_err().is_parse());
    }

    #[test]
    fn test_string_operations() {
        assert_eq!(
            run("people.Select(p => p.Name + \"!\").First()").unwrap(),
            Value::String("Minion #1!".into())
        );
        assert_eq!(
            run("people.Count(p => p.Name.EndsWith(\"7\"))").unwrap(),
            Value::Integer(10)
        );
        assert_eq!(
            run("people.Select(p => p.Name.ToUpper()).First()").unwrap(),
            Value::String("MINION #1".into())
        );
    }

    #[test]
    fn test_distinct() {
        assert_eq!(indices("people.Select(p => p.Index % 3).Distinct()"), vec![1, 2, 0]);
    }

    #[test]
    fn test_nested_query_sees_outer_parameter() {
        assert_eq!(
            indices("people.Where(p => people.Any(q => q.Index == p.Index * 50))"),
            vec![1, 2]
        );
    }

    #[test]
    fn test_slice_count_from_lambda_parameter() {
        assert_eq!(
            indices("people.Where(p => people.Take(p.Index).Count() == 3)"),
            vec![3]
        );
    }

    #[test]
    fn test_runtime_errors() {
        let cases = [
            "people.Select(p => p.Index / 0)",
            "people.Select(p => p.Index / 0.0)",
            "people.Select(p => p.Index % 0)",
            "people.Select(p => 9223372036854775807 + p.Index)",
            "people.Take(-1)",
            "people.Where(p => false).First()",
            "people.Where(p => false).Max(p => p.Index)",
            "people.Where(p => false).Average(p => p.Index)",
            "people.FirstOrDefault(p => p.Index > 500).Name",
        ];
        for text in cases {
            let err = run(text).unwrap_err();
            assert_eq!(err.kind(), "runtime", "{text}: {err}");
        }
    }

    #[test]
    fn test_take_and_skip_boundaries() {
        assert!(indices("people.Take(0)").is_empty());
        assert_eq!(indices("people.Take(100)"), (1..=100).collect::<Vec<_>>());
        assert_eq!(indices("people.Take(1000)"), (1..=100).collect::<Vec<_>>());
        assert!(indices("people.Skip(100)").is_empty());
        assert_eq!(indices("people.Skip(0).Take(3)"), vec![1, 2, 3]);
    }

    #[test]
    fn test_float_overflow_is_an_error() {
        let big = format!("1{}.0", "0".repeat(300));
        let err = run(&format!("people.Select(p => {big} * {big}).First()")).unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert!(err.to_string().contains("float overflow"), "{err}");

        let near_max = format!("1{}.0", "0".repeat(307));
        for text in [
            format!("people.Average(p => {near_max})"),
            format!("people.Sum(p => {near_max})"),
        ] {
            let err = run(&text).unwrap_err();
            assert!(err.to_string().contains("float overflow"), "{text}: {err}");
        }
    }

    #[test]
    fn test_nested_scans_exhaust_budget() {
        let text = "people.Where(a => people.Any(b => people.Any(c => people.Any(d => people.Any(e => false)))))";
        let err = run(text).unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert!(err.to_string().contains("budget"), "{err}");

        let err = run("people.Select(a => people.Select(b => people.Select(c => people)))").unwrap_err();
        assert!(err.to_string().contains("budget"), "{err}");
    }

    #[test]
    fn test_budget_counts_source_reads() {
        let query = compile("people", "people.Count()").unwrap();
        let data = Dataset::generate(100);
        assert_eq!(
            execute_with_budget(&query, data.people(), 200).unwrap(),
            Value::Integer(100)
        );
        assert!(execute_with_budget(&query, data.people(), 50).is_err());
    }

    #[test]
    fn test_empty_dataset() {
        let query = compile("people", "people.Take(10)").unwrap();
        assert_eq!(execute(&query, &[]).unwrap(), Value::Sequence(vec![]));
    }

    #[test]
    fn test_execution_is_repeatable() {
        let query = compile("people", "people.OrderBy(p => p.Name).Take(5)").unwrap();
        let data = Dataset::generate(100);
        assert_eq!(
            execute(&query, data.people()).unwrap(),
            execute(&query, data.people()).unwrap()
        );
    }
}
