//! Vectorised query execution
//!
//! Plans run against column-major batches. Aggregation evaluates each
//! aggregate argument over the filtered batch, groups row indices, and
//! rewrites the projection so aggregate nodes read synthetic columns of the
//! per-group batch. Window functions get the same treatment: each window
//! node becomes a synthetic column computed per partition in the window's
//! order, scattered back to row positions.

use super::functions::{self, Column};
use super::plan::{BinOp, Expr, OrderKey, ProjItem, SelectPlan, TableRef};
use super::Value;
use crate::{Result, RingError};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Column-major row batch
#[derive(Debug, Clone, Default)]
pub struct Batch {
    names: Vec<String>,
    columns: Vec<Column>,
    rows: usize,
}

impl Batch {
    pub fn new(names: Vec<String>, columns: Vec<Column>) -> Self {
        let rows = columns.first().map(|c| c.len()).unwrap_or(0);
        debug_assert!(columns.iter().all(|c| c.len() == rows));
        Self { names, columns, rows }
    }

    pub fn empty(names: Vec<String>) -> Self {
        let columns = names.iter().map(|_| Vec::new()).collect();
        Self { names, columns, rows: 0 }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| &self.columns[idx])
    }

    pub fn push_column(&mut self, name: String, column: Column) {
        debug_assert!(self.names.is_empty() || column.len() == self.rows);
        if self.names.is_empty() {
            self.rows = column.len();
        }
        self.names.push(name);
        self.columns.push(column);
    }

    /// Keep only the rows at `indices`, in that order
    fn take(&self, indices: &[usize]) -> Batch {
        let columns = self
            .columns
            .iter()
            .map(|col| indices.iter().map(|&i| col[i].clone()).collect())
            .collect();
        Batch {
            names: self.names.clone(),
            columns,
            rows: indices.len(),
        }
    }

    pub fn row(&self, idx: usize) -> Vec<Value> {
        self.columns.iter().map(|col| col[idx].clone()).collect()
    }
}

/// Execute a plan against the registered virtual tables
pub fn run(plan: &SelectPlan, tables: &mut HashMap<String, Batch>) -> Result<Batch> {
    for (name, cte) in &plan.ctes {
        let batch = run(cte, tables)?;
        tables.insert(name.clone(), batch);
    }

    let source = match &plan.from {
        TableRef::Named(name) => tables
            .get(name)
            .cloned()
            .ok_or_else(|| RingError::Validation(format!("unknown table '{}'", name)))?,
        TableRef::Subquery(inner) => run(inner, tables)?,
    };

    let filtered = match &plan.filter {
        Some(predicate) => {
            let mask = eval(&source, predicate)?;
            let indices: Vec<usize> = (0..source.rows())
                .filter(|&i| matches!(mask[i], Value::Bool(true)))
                .collect();
            source.take(&indices)
        }
        None => source,
    };

    let grouping = !plan.group_by.is_empty()
        || plan
            .projection
            .iter()
            .any(|item| matches!(item, ProjItem::Expr { expr, .. } if has_aggregate(expr)))
        || plan.having.as_ref().is_some_and(has_aggregate);

    let (mut current, mut projection, having) = if grouping {
        aggregate(&filtered, plan)?
    } else {
        (filtered, plan.projection.to_vec(), plan.having.clone())
    };

    if let Some(predicate) = having {
        let mask = eval(&current, &predicate)?;
        let indices: Vec<usize> = (0..current.rows())
            .filter(|&i| matches!(mask[i], Value::Bool(true)))
            .collect();
        current = current.take(&indices);
    }

    // window pass: each distinct window node becomes a synthetic column
    let mut windows = Vec::new();
    for item in &projection {
        if let ProjItem::Expr { expr, .. } = item {
            collect_windows(expr, &mut windows);
        }
    }
    for (idx, window) in windows.iter().enumerate() {
        let column = eval_window_node(&current, window)?;
        current.push_column(format!("__win{}", idx), column);
    }
    if !windows.is_empty() {
        projection = projection
            .into_iter()
            .map(|item| match item {
                ProjItem::Expr { expr, name } => ProjItem::Expr {
                    expr: replace_nodes(expr, &windows, "__win"),
                    name,
                },
                other => other,
            })
            .collect();
    }

    let mut output = Batch::default();
    for item in &projection {
        match item {
            ProjItem::Wildcard => {
                if grouping {
                    return Err(RingError::Validation(
                        "SELECT * cannot be combined with aggregation".into(),
                    ));
                }
                for (name, column) in current.names.iter().zip(current.columns.iter()) {
                    if !name.starts_with("__") {
                        output.push_column(name.clone(), column.clone());
                    }
                }
            }
            ProjItem::Expr { expr, name } => {
                output.push_column(name.clone(), eval(&current, expr)?);
            }
        }
    }

    if !plan.order_by.is_empty() {
        let mut keys: Vec<(Column, bool)> = Vec::with_capacity(plan.order_by.len());
        for (key, descending) in &plan.order_by {
            let column = match key {
                OrderKey::Name(name) => output
                    .column(name)
                    .or_else(|| current.column(name))
                    .cloned()
                    .ok_or_else(|| {
                        RingError::Validation(format!("unknown ORDER BY column '{}'", name))
                    })?,
                OrderKey::Expr(expr) => eval(&current, expr)?,
            };
            keys.push((column, *descending));
        }
        let mut order: Vec<usize> = (0..output.rows()).collect();
        order.sort_by(|&a, &b| {
            for (column, descending) in &keys {
                let ord = cmp_values(&column[a], &column[b]);
                if ord != Ordering::Equal {
                    return if *descending { ord.reverse() } else { ord };
                }
            }
            Ordering::Equal
        });
        output = output.take(&order);
    }

    if plan.distinct {
        let mut seen = std::collections::BTreeSet::new();
        let indices: Vec<usize> = (0..output.rows())
            .filter(|&i| seen.insert(output.row(i).iter().map(group_key).collect::<Vec<_>>()))
            .collect();
        output = output.take(&indices);
    }

    if plan.offset.is_some() || plan.limit.is_some() {
        let start = plan.offset.unwrap_or(0).min(output.rows());
        let end = match plan.limit {
            Some(limit) => start.saturating_add(limit).min(output.rows()),
            None => output.rows(),
        };
        let indices: Vec<usize> = (start..end).collect();
        output = output.take(&indices);
    }

    Ok(output)
}

/// Aggregation: group the filtered batch and rewrite the projection against
/// a per-group batch carrying synthetic aggregate columns
fn aggregate(
    filtered: &Batch,
    plan: &SelectPlan,
) -> Result<(Batch, Vec<ProjItem>, Option<Expr>)> {
    let mut aggregates = Vec::new();
    for item in &plan.projection {
        if let ProjItem::Expr { expr, .. } = item {
            collect_aggregates(expr, &mut aggregates);
        }
    }
    if let Some(having) = &plan.having {
        collect_aggregates(having, &mut aggregates);
    }
    for (key, _) in &plan.order_by {
        if let OrderKey::Expr(expr) = key {
            collect_aggregates(expr, &mut aggregates);
        }
    }

    // group indices, ordered by key for deterministic output
    let key_columns: Vec<Column> = plan
        .group_by
        .iter()
        .map(|expr| eval(filtered, expr))
        .collect::<Result<_>>()?;
    let mut groups: BTreeMap<Vec<GroupKey>, Vec<usize>> = BTreeMap::new();
    if key_columns.is_empty() {
        // global aggregate: a single group holding every row
        groups.insert(Vec::new(), (0..filtered.rows()).collect());
    } else {
        for row in 0..filtered.rows() {
            let key: Vec<GroupKey> = key_columns.iter().map(|col| group_key(&col[row])).collect();
            groups.entry(key).or_default().push(row);
        }
    }

    // a global aggregate over an empty input still yields one row; its
    // representative columns are all NULL
    let mut grouped = if key_columns.is_empty() && filtered.rows() == 0 {
        let names = filtered.names().to_vec();
        let columns = names.iter().map(|_| vec![Value::Null]).collect();
        Batch::new(names, columns)
    } else {
        let representatives: Vec<usize> =
            groups.values().map(|indices| indices[0]).collect();
        filtered.take(&representatives)
    };

    for (idx, node) in aggregates.iter().enumerate() {
        let Expr::Aggregate { func, arg } = node else { unreachable!() };
        let arg_column = arg
            .as_ref()
            .map(|expr| eval(filtered, expr))
            .transpose()?;
        let column: Column = groups
            .values()
            .map(|indices| functions::eval_aggregate(*func, arg_column.as_ref(), indices))
            .collect();
        grouped.push_column(format!("__agg{}", idx), column);
    }

    let projection: Vec<ProjItem> = plan
        .projection
        .iter()
        .map(|item| match item {
            ProjItem::Expr { expr, name } => ProjItem::Expr {
                expr: replace_nodes(expr.clone(), &aggregates, "__agg"),
                name: name.clone(),
            },
            other => other.clone(),
        })
        .collect();
    let having = plan
        .having
        .clone()
        .map(|expr| replace_nodes(expr, &aggregates, "__agg"));

    Ok((grouped, projection, having))
}

fn eval_window_node(batch: &Batch, node: &Expr) -> Result<Column> {
    let Expr::Window { func, args, partition_by, order_by } = node else {
        unreachable!()
    };
    let arg_columns: Vec<Column> = args
        .iter()
        .map(|expr| eval(batch, expr))
        .collect::<Result<_>>()?;
    let partition_columns: Vec<Column> = partition_by
        .iter()
        .map(|expr| eval(batch, expr))
        .collect::<Result<_>>()?;
    let order_columns: Vec<(Column, bool)> = order_by
        .iter()
        .map(|(expr, desc)| Ok((eval(batch, expr)?, *desc)))
        .collect::<Result<_>>()?;

    let mut partitions: BTreeMap<Vec<GroupKey>, Vec<usize>> = BTreeMap::new();
    for row in 0..batch.rows() {
        let key: Vec<GroupKey> = partition_columns
            .iter()
            .map(|col| group_key(&col[row]))
            .collect();
        partitions.entry(key).or_default().push(row);
    }

    let mut out = vec![Value::Null; batch.rows()];
    for indices in partitions.into_values() {
        let mut ordered = indices;
        ordered.sort_by(|&a, &b| {
            for (column, descending) in &order_columns {
                let ord = cmp_values(&column[a], &column[b]);
                if ord != Ordering::Equal {
                    return if *descending { ord.reverse() } else { ord };
                }
            }
            Ordering::Equal
        });
        let partition_args: Vec<Column> = arg_columns
            .iter()
            .map(|col| ordered.iter().map(|&i| col[i].clone()).collect())
            .collect();
        let results = functions::eval_window(*func, &partition_args, ordered.len())?;
        for (pos, &row) in ordered.iter().enumerate() {
            out[row] = results[pos].clone();
        }
    }
    Ok(out)
}

/// Evaluate an expression to a column over the batch
pub fn eval(batch: &Batch, expr: &Expr) -> Result<Column> {
    let rows = batch.rows();
    match expr {
        Expr::Column(name) => batch
            .column(name)
            .cloned()
            .ok_or_else(|| RingError::Validation(format!("unknown column '{}'", name))),
        Expr::Literal(value) => Ok(vec![value.clone(); rows]),
        Expr::Negate(inner) => {
            let column = eval(batch, inner)?;
            Ok(column
                .into_iter()
                .map(|v| match v {
                    Value::Int(i) => Value::Int(-i),
                    Value::Float(f) => Value::Float(-f),
                    _ => Value::Null,
                })
                .collect())
        }
        Expr::Not(inner) => {
            let column = eval(batch, inner)?;
            Ok(column
                .into_iter()
                .map(|v| match to_bool(&v) {
                    Some(b) => Value::Bool(!b),
                    None => Value::Null,
                })
                .collect())
        }
        Expr::IsNull { expr, negated } => {
            let column = eval(batch, expr)?;
            Ok(column
                .into_iter()
                .map(|v| Value::Bool(matches!(v, Value::Null) != *negated))
                .collect())
        }
        Expr::Binary { left, op, right } => {
            let lhs = eval(batch, left)?;
            let rhs = eval(batch, right)?;
            Ok(lhs
                .iter()
                .zip(rhs.iter())
                .map(|(a, b)| binary(a, *op, b))
                .collect())
        }
        Expr::InList { expr, list, negated } => {
            let target = eval(batch, expr)?;
            let columns: Vec<Column> = list
                .iter()
                .map(|item| eval(batch, item))
                .collect::<Result<_>>()?;
            Ok((0..rows)
                .map(|i| {
                    if matches!(target[i], Value::Null) {
                        return Value::Null;
                    }
                    let found = columns
                        .iter()
                        .any(|col| matches!(binary(&target[i], BinOp::Eq, &col[i]), Value::Bool(true)));
                    Value::Bool(found != *negated)
                })
                .collect())
        }
        Expr::Between { expr, low, high, negated } => {
            let target = eval(batch, expr)?;
            let low = eval(batch, low)?;
            let high = eval(batch, high)?;
            Ok((0..rows)
                .map(|i| {
                    let ge = binary(&target[i], BinOp::Ge, &low[i]);
                    let le = binary(&target[i], BinOp::Le, &high[i]);
                    match (to_bool(&ge), to_bool(&le)) {
                        (Some(a), Some(b)) => Value::Bool((a && b) != *negated),
                        _ => Value::Null,
                    }
                })
                .collect())
        }
        Expr::Case { operand, whens, otherwise } => {
            let operand = operand
                .as_ref()
                .map(|o| eval(batch, o))
                .transpose()?;
            let whens: Vec<(Column, Column)> = whens
                .iter()
                .map(|(c, r)| Ok((eval(batch, c)?, eval(batch, r)?)))
                .collect::<Result<_>>()?;
            let otherwise = otherwise.as_ref().map(|e| eval(batch, e)).transpose()?;
            Ok((0..rows)
                .map(|i| {
                    for (condition, result) in &whens {
                        let hit = match &operand {
                            Some(op) => {
                                matches!(binary(&op[i], BinOp::Eq, &condition[i]), Value::Bool(true))
                            }
                            None => matches!(to_bool(&condition[i]), Some(true)),
                        };
                        if hit {
                            return result[i].clone();
                        }
                    }
                    otherwise
                        .as_ref()
                        .map(|col| col[i].clone())
                        .unwrap_or(Value::Null)
                })
                .collect())
        }
        Expr::Func { name, args } => {
            let columns: Vec<Column> = args
                .iter()
                .map(|arg| eval(batch, arg))
                .collect::<Result<_>>()?;
            functions::eval_scalar(name, &columns, rows)
        }
        Expr::Aggregate { .. } => Err(RingError::Validation(
            "aggregate function used outside an aggregate context".into(),
        )),
        Expr::Window { .. } => Err(RingError::Validation(
            "window function in an unsupported position".into(),
        )),
    }
}

fn binary(a: &Value, op: BinOp, b: &Value) -> Value {
    match op {
        BinOp::And => match (to_bool(a), to_bool(b)) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        },
        BinOp::Or => match (to_bool(a), to_bool(b)) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        },
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(a, op, b),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            match compare(a, b) {
                None => Value::Null,
                Some(ord) => {
                    let truth = match op {
                        BinOp::Eq => ord == Ordering::Equal,
                        BinOp::Ne => ord != Ordering::Equal,
                        BinOp::Lt => ord == Ordering::Less,
                        BinOp::Le => ord != Ordering::Greater,
                        BinOp::Gt => ord == Ordering::Greater,
                        BinOp::Ge => ord != Ordering::Less,
                        _ => unreachable!(),
                    };
                    Value::Bool(truth)
                }
            }
        }
    }
}

fn arith(a: &Value, op: BinOp, b: &Value) -> Value {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Value::Null,
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BinOp::Add => a.checked_add(b).map(Value::Int).unwrap_or(Value::Null),
                BinOp::Sub => a.checked_sub(b).map(Value::Int).unwrap_or(Value::Null),
                BinOp::Mul => a.checked_mul(b).map(Value::Int).unwrap_or(Value::Null),
                BinOp::Div => a.checked_div(b).map(Value::Int).unwrap_or(Value::Null),
                BinOp::Mod => a.checked_rem(b).map(Value::Int).unwrap_or(Value::Null),
                _ => unreachable!(),
            }
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Value::Float(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                _ => unreachable!(),
            }),
            _ => Value::Null,
        },
    }
}

/// Three-valued comparison; NULL or NaN operands yield None (SQL NULL)
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => {
            let (a, b) = (a.as_f64()?, b.as_f64()?);
            a.partial_cmp(&b)
        }
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

/// Total order for sorting: NULL first, then numbers, strings, booleans;
/// NaN sorts after every number
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Str(_) => 2,
            Value::Bool(_) => 3,
        }
    }
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ if rank(a) == 1 && rank(b) == 1 => {
            let (a, b) = (a.as_f64().unwrap(), b.as_f64().unwrap());
            match (a.is_nan(), b.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => a.partial_cmp(&b).unwrap(),
            }
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Hashable, ordered stand-in for a value in group and distinct keys
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupKey {
    Null,
    Int(i64),
    Float(u64),
    Str(String),
    Bool(bool),
}

fn group_key(value: &Value) -> GroupKey {
    match value {
        Value::Null => GroupKey::Null,
        Value::Int(i) => GroupKey::Int(*i),
        Value::Float(f) => {
            // fold -0.0 into 0.0 and all NaNs into one key
            let normalized = if f.is_nan() {
                f64::NAN
            } else if *f == 0.0 {
                0.0
            } else {
                *f
            };
            if normalized.fract() == 0.0 && normalized.abs() < 9e15 {
                GroupKey::Int(normalized as i64)
            } else {
                GroupKey::Float(normalized.to_bits())
            }
        }
        Value::Str(s) => GroupKey::Str(s.clone()),
        Value::Bool(b) => GroupKey::Bool(*b),
    }
}

fn has_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    walk(expr, &mut |node| {
        if matches!(node, Expr::Aggregate { .. }) {
            found = true;
        }
    });
    found
}

fn collect_aggregates(expr: &Expr, out: &mut Vec<Expr>) {
    walk(expr, &mut |node| {
        if matches!(node, Expr::Aggregate { .. }) && !out.contains(node) {
            out.push(node.clone());
        }
    });
}

fn collect_windows(expr: &Expr, out: &mut Vec<Expr>) {
    walk(expr, &mut |node| {
        if matches!(node, Expr::Window { .. }) && !out.contains(node) {
            out.push(node.clone());
        }
    });
}

/// Replace each expression equal to `nodes[i]` with `Column("{prefix}{i}")`
fn replace_nodes(expr: Expr, nodes: &[Expr], prefix: &str) -> Expr {
    if let Some(idx) = nodes.iter().position(|n| *n == expr) {
        return Expr::Column(format!("{}{}", prefix, idx));
    }
    match expr {
        Expr::Binary { left, op, right } => Expr::Binary {
            left: Box::new(replace_nodes(*left, nodes, prefix)),
            op,
            right: Box::new(replace_nodes(*right, nodes, prefix)),
        },
        Expr::Not(inner) => Expr::Not(Box::new(replace_nodes(*inner, nodes, prefix))),
        Expr::Negate(inner) => Expr::Negate(Box::new(replace_nodes(*inner, nodes, prefix))),
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(replace_nodes(*expr, nodes, prefix)),
            negated,
        },
        Expr::InList { expr, list, negated } => Expr::InList {
            expr: Box::new(replace_nodes(*expr, nodes, prefix)),
            list: list
                .into_iter()
                .map(|item| replace_nodes(item, nodes, prefix))
                .collect(),
            negated,
        },
        Expr::Between { expr, low, high, negated } => Expr::Between {
            expr: Box::new(replace_nodes(*expr, nodes, prefix)),
            low: Box::new(replace_nodes(*low, nodes, prefix)),
            high: Box::new(replace_nodes(*high, nodes, prefix)),
            negated,
        },
        Expr::Case { operand, whens, otherwise } => Expr::Case {
            operand: operand.map(|o| Box::new(replace_nodes(*o, nodes, prefix))),
            whens: whens
                .into_iter()
                .map(|(c, r)| {
                    (
                        replace_nodes(c, nodes, prefix),
                        replace_nodes(r, nodes, prefix),
                    )
                })
                .collect(),
            otherwise: otherwise.map(|e| Box::new(replace_nodes(*e, nodes, prefix))),
        },
        Expr::Func { name, args } => Expr::Func {
            name,
            args: args
                .into_iter()
                .map(|arg| replace_nodes(arg, nodes, prefix))
                .collect(),
        },
        leaf => leaf,
    }
}

fn walk(expr: &Expr, visit: &mut impl FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::Binary { left, right, .. } => {
            walk(left, visit);
            walk(right, visit);
        }
        Expr::Not(inner) | Expr::Negate(inner) => walk(inner, visit),
        Expr::IsNull { expr, .. } => walk(expr, visit),
        Expr::InList { expr, list, .. } => {
            walk(expr, visit);
            for item in list {
                walk(item, visit);
            }
        }
        Expr::Between { expr, low, high, .. } => {
            walk(expr, visit);
            walk(low, visit);
            walk(high, visit);
        }
        Expr::Case { operand, whens, otherwise } => {
            if let Some(operand) = operand {
                walk(operand, visit);
            }
            for (c, r) in whens {
                walk(c, visit);
                walk(r, visit);
            }
            if let Some(otherwise) = otherwise {
                walk(otherwise, visit);
            }
        }
        Expr::Func { args, .. } => {
            for arg in args {
                walk(arg, visit);
            }
        }
        Expr::Aggregate { arg, .. } => {
            if let Some(arg) = arg {
                walk(arg, visit);
            }
        }
        Expr::Window { args, partition_by, order_by, .. } => {
            for arg in args {
                walk(arg, visit);
            }
            for expr in partition_by {
                walk(expr, visit);
            }
            for (expr, _) in order_by {
                walk(expr, visit);
            }
        }
        Expr::Column(_) | Expr::Literal(_) => {}
    }
}
