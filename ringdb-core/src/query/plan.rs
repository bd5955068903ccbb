//! SQL planner
//!
//! Converts a sqlparser AST into the engine's plan IR, validating schema
//! references and function names, and extracts the `metric_id`/`ts`
//! predicates that get pushed into the `samples` provider. Queries that
//! touch `samples` without a `metric_id` predicate are rejected: no
//! unbounded scans.

use super::functions;
use super::Value;
use crate::{Result, RingError};
use sqlparser::ast::{
    self, BinaryOperator, Cte, Expr as SqlExpr, Function, FunctionArg, FunctionArgExpr,
    GroupByExpr, ObjectName, OrderByExpr, Select, SelectItem as SqlSelectItem, SetExpr,
    Statement, TableFactor, UnaryOperator, Value as SqlValue, WindowType,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;

/// The three virtual tables
pub const TABLE_SAMPLES: &str = "samples";
pub const TABLE_METRICS: &str = "metrics";
pub const TABLE_METRIC_TAGS: &str = "metric_tags";

/// Planned expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    /// Scalar UDF or built-in
    Func {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggFunc,
        arg: Option<Box<Expr>>,
    },
    Window {
        func: WinFunc,
        args: Vec<Expr>,
        partition_by: Vec<Expr>,
        order_by: Vec<(Expr, bool)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
}

impl AggFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" | "mean" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "first" => Some(AggFunc::First),
            "last" => Some(AggFunc::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinFunc {
    Lag,
    CounterRate,
    Diff,
    PctChange,
    RollingMean,
    RollingSum,
}

impl WinFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lag" => Some(WinFunc::Lag),
            "counter_rate" => Some(WinFunc::CounterRate),
            "diff" | "period_diff" => Some(WinFunc::Diff),
            "pct_change" => Some(WinFunc::PctChange),
            "rolling_mean" => Some(WinFunc::RollingMean),
            "rolling_sum" => Some(WinFunc::RollingSum),
            _ => None,
        }
    }
}

/// Projection item
#[derive(Debug, Clone, PartialEq)]
pub enum ProjItem {
    Wildcard,
    Expr { expr: Expr, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Named(String),
    Subquery(Box<SelectPlan>),
}

/// One SELECT, post-validation
#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub ctes: Vec<(String, SelectPlan)>,
    pub from: TableRef,
    pub filter: Option<Expr>,
    pub projection: Vec<ProjItem>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<(OrderKey, bool)>,
    pub distinct: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// ORDER BY key: an output column name, or a full expression
#[derive(Debug, Clone, PartialEq)]
pub enum OrderKey {
    Name(String),
    Expr(Expr),
}

/// Predicates extracted for the `samples` provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pushdown {
    pub metric_ids: BTreeSet<i64>,
    pub ts_min: Option<i64>,
    pub ts_max: Option<i64>,
    /// How many `samples` reads contributed; the ts bounds only survive a
    /// merge when every read supplied one
    reads: usize,
}

/// Parse, validate, and analyze a query
pub fn parse(sql: &str) -> Result<(SelectPlan, Pushdown)> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| RingError::SqlParse(e.to_string()))?;
    let query = match statements.as_slice() {
        [] => return Err(RingError::SqlParse("empty query".into())),
        [Statement::Query(query)] => query,
        [_] => {
            return Err(RingError::Validation(
                "only SELECT statements are supported".into(),
            ))
        }
        _ => {
            return Err(RingError::Validation(
                "expected a single SELECT statement".into(),
            ))
        }
    };

    let mut known_tables = vec![
        TABLE_SAMPLES.to_string(),
        TABLE_METRICS.to_string(),
        TABLE_METRIC_TAGS.to_string(),
    ];
    let plan = plan_query(query, &mut known_tables)?;

    let mut pushdown = Pushdown::default();
    analyze_samples_access(&plan, &mut pushdown)?;
    Ok((plan, pushdown))
}

fn plan_query(query: &ast::Query, known_tables: &mut Vec<String>) -> Result<SelectPlan> {
    let mut ctes = Vec::new();
    if let Some(with) = &query.with {
        if with.recursive {
            return Err(RingError::Validation("recursive CTEs are not supported".into()));
        }
        for Cte { alias, query, .. } in &with.cte_tables {
            let name = alias.name.value.to_lowercase();
            let plan = plan_query(query, known_tables)?;
            known_tables.push(name.clone());
            ctes.push((name, plan));
        }
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        SetExpr::Query(inner) => {
            let mut plan = plan_query(inner, known_tables)?;
            plan.ctes.splice(0..0, ctes);
            return Ok(plan);
        }
        _ => {
            return Err(RingError::Validation(
                "set operations are not supported".into(),
            ))
        }
    };

    let mut plan = plan_select(select, known_tables)?;
    plan.ctes = ctes;
    plan.order_by = plan_order_by(&query.order_by, &plan.projection)?;
    plan.limit = match &query.limit {
        Some(SqlExpr::Value(SqlValue::Number(n, _))) => Some(
            n.parse::<usize>()
                .map_err(|_| RingError::SqlParse("invalid LIMIT value".into()))?,
        ),
        Some(_) => return Err(RingError::SqlParse("unsupported LIMIT expression".into())),
        None => None,
    };
    plan.offset = match &query.offset {
        Some(offset) => match &offset.value {
            SqlExpr::Value(SqlValue::Number(n, _)) => Some(
                n.parse::<usize>()
                    .map_err(|_| RingError::SqlParse("invalid OFFSET value".into()))?,
            ),
            _ => return Err(RingError::SqlParse("unsupported OFFSET expression".into())),
        },
        None => None,
    };
    Ok(plan)
}

fn plan_select(select: &Select, known_tables: &mut Vec<String>) -> Result<SelectPlan> {
    if select.from.len() != 1 {
        return Err(RingError::Validation(
            "queries must read exactly one table".into(),
        ));
    }
    let table_with_joins = &select.from[0];
    if !table_with_joins.joins.is_empty() {
        return Err(RingError::Validation("joins are not supported".into()));
    }
    let from = match &table_with_joins.relation {
        TableFactor::Table { name, .. } => {
            let table = object_name(name);
            if !known_tables.contains(&table) {
                return Err(RingError::Validation(format!(
                    "unknown table '{}'; queries may only reference samples, metrics, metric_tags, or an earlier CTE",
                    table
                )));
            }
            TableRef::Named(table)
        }
        TableFactor::Derived { subquery, .. } => {
            TableRef::Subquery(Box::new(plan_query(subquery, known_tables)?))
        }
        _ => return Err(RingError::Validation("unsupported FROM clause".into())),
    };

    let mut projection = Vec::new();
    for (idx, item) in select.projection.iter().enumerate() {
        match item {
            SqlSelectItem::Wildcard(_) => projection.push(ProjItem::Wildcard),
            SqlSelectItem::QualifiedWildcard(..) => projection.push(ProjItem::Wildcard),
            SqlSelectItem::UnnamedExpr(expr) => {
                let planned = plan_expr(expr)?;
                let name = derive_name(expr, idx);
                projection.push(ProjItem::Expr { expr: planned, name });
            }
            SqlSelectItem::ExprWithAlias { expr, alias } => {
                let planned = plan_expr(expr)?;
                projection.push(ProjItem::Expr {
                    expr: planned,
                    name: alias.value.to_lowercase(),
                });
            }
        }
    }

    let filter = select.selection.as_ref().map(plan_expr).transpose()?;

    let group_by = match &select.group_by {
        GroupByExpr::All => {
            return Err(RingError::Validation("GROUP BY ALL is not supported".into()))
        }
        GroupByExpr::Expressions(exprs) => exprs
            .iter()
            .map(|expr| resolve_alias(plan_expr(expr)?, &projection))
            .collect::<Result<Vec<_>>>()?,
    };

    let having = select.having.as_ref().map(plan_expr).transpose()?;

    Ok(SelectPlan {
        ctes: Vec::new(),
        from,
        filter,
        projection,
        group_by,
        having,
        order_by: Vec::new(),
        distinct: select.distinct.is_some(),
        limit: None,
        offset: None,
    })
}

fn plan_order_by(
    order_by: &[OrderByExpr],
    projection: &[ProjItem],
) -> Result<Vec<(OrderKey, bool)>> {
    let mut keys = Vec::with_capacity(order_by.len());
    for item in order_by {
        let descending = item.asc.map(|asc| !asc).unwrap_or(false);
        let key = match &item.expr {
            SqlExpr::Identifier(ident) => OrderKey::Name(ident.value.to_lowercase()),
            other => {
                let planned = resolve_alias(plan_expr(other)?, projection)?;
                OrderKey::Expr(planned)
            }
        };
        keys.push((key, descending));
    }
    Ok(keys)
}

/// `GROUP BY bucket` may name a projection alias; substitute its expression
fn resolve_alias(expr: Expr, projection: &[ProjItem]) -> Result<Expr> {
    if let Expr::Column(name) = &expr {
        for item in projection {
            if let ProjItem::Expr { expr: aliased, name: alias } = item {
                if alias == name && !matches!(aliased, Expr::Column(_)) {
                    return Ok(aliased.clone());
                }
            }
        }
    }
    Ok(expr)
}

fn plan_expr(expr: &SqlExpr) -> Result<Expr> {
    match expr {
        SqlExpr::Identifier(ident) => Ok(Expr::Column(ident.value.to_lowercase())),
        SqlExpr::CompoundIdentifier(idents) => {
            let last = idents
                .last()
                .ok_or_else(|| RingError::SqlParse("empty compound identifier".into()))?;
            Ok(Expr::Column(last.value.to_lowercase()))
        }
        SqlExpr::Value(value) => Ok(Expr::Literal(plan_value(value)?)),
        SqlExpr::Nested(inner) => plan_expr(inner),
        SqlExpr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not => Ok(Expr::Not(Box::new(plan_expr(expr)?))),
            UnaryOperator::Minus => Ok(Expr::Negate(Box::new(plan_expr(expr)?))),
            UnaryOperator::Plus => plan_expr(expr),
            _ => Err(RingError::Validation(format!(
                "unsupported unary operator {:?}",
                op
            ))),
        },
        SqlExpr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Plus => BinOp::Add,
                BinaryOperator::Minus => BinOp::Sub,
                BinaryOperator::Multiply => BinOp::Mul,
                BinaryOperator::Divide => BinOp::Div,
                BinaryOperator::Modulo => BinOp::Mod,
                BinaryOperator::Eq => BinOp::Eq,
                BinaryOperator::NotEq => BinOp::Ne,
                BinaryOperator::Lt => BinOp::Lt,
                BinaryOperator::LtEq => BinOp::Le,
                BinaryOperator::Gt => BinOp::Gt,
                BinaryOperator::GtEq => BinOp::Ge,
                BinaryOperator::And => BinOp::And,
                BinaryOperator::Or => BinOp::Or,
                other => {
                    return Err(RingError::Validation(format!(
                        "unsupported operator {:?}",
                        other
                    )))
                }
            };
            Ok(Expr::Binary {
                left: Box::new(plan_expr(left)?),
                op,
                right: Box::new(plan_expr(right)?),
            })
        }
        SqlExpr::IsNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(plan_expr(inner)?),
            negated: false,
        }),
        SqlExpr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(plan_expr(inner)?),
            negated: true,
        }),
        SqlExpr::InList { expr, list, negated } => Ok(Expr::InList {
            expr: Box::new(plan_expr(expr)?),
            list: list.iter().map(plan_expr).collect::<Result<_>>()?,
            negated: *negated,
        }),
        SqlExpr::Between { expr, negated, low, high } => Ok(Expr::Between {
            expr: Box::new(plan_expr(expr)?),
            low: Box::new(plan_expr(low)?),
            high: Box::new(plan_expr(high)?),
            negated: *negated,
        }),
        SqlExpr::Case { operand, conditions, results, else_result } => {
            let whens = conditions
                .iter()
                .zip(results.iter())
                .map(|(c, r)| Ok((plan_expr(c)?, plan_expr(r)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Case {
                operand: operand.as_ref().map(|o| plan_expr(o).map(Box::new)).transpose()?,
                whens,
                otherwise: else_result
                    .as_ref()
                    .map(|e| plan_expr(e).map(Box::new))
                    .transpose()?,
            })
        }
        SqlExpr::Function(func) => plan_function(func),
        other => Err(RingError::Validation(format!(
            "unsupported expression: {}",
            other
        ))),
    }
}

fn plan_function(func: &Function) -> Result<Expr> {
    let name = object_name(&func.name);
    let mut args = Vec::new();
    let mut count_star = false;
    for arg in &func.args {
        match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => args.push(plan_expr(expr)?),
            FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => count_star = true,
            _ => {
                return Err(RingError::Validation(format!(
                    "unsupported argument in {}()",
                    name
                )))
            }
        }
    }

    if let Some(over) = &func.over {
        let func = WinFunc::from_name(&name).ok_or_else(|| {
            RingError::Validation(format!("unknown window function '{}'", name))
        })?;
        let spec = match over {
            WindowType::WindowSpec(spec) => spec,
            WindowType::NamedWindow(_) => {
                return Err(RingError::Validation("named windows are not supported".into()))
            }
        };
        let partition_by = spec
            .partition_by
            .iter()
            .map(plan_expr)
            .collect::<Result<Vec<_>>>()?;
        let order_by = spec
            .order_by
            .iter()
            .map(|item| {
                let descending = item.asc.map(|asc| !asc).unwrap_or(false);
                Ok((plan_expr(&item.expr)?, descending))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Expr::Window { func, args, partition_by, order_by });
    }

    if let Some(agg) = AggFunc::from_name(&name) {
        if count_star || args.is_empty() {
            if agg != AggFunc::Count {
                return Err(RingError::Validation(format!("{}() requires an argument", name)));
            }
            return Ok(Expr::Aggregate { func: agg, arg: None });
        }
        if args.len() != 1 {
            return Err(RingError::Validation(format!(
                "{}() takes exactly one argument",
                name
            )));
        }
        return Ok(Expr::Aggregate {
            func: agg,
            arg: Some(Box::new(args.remove(0))),
        });
    }

    if WinFunc::from_name(&name).is_some() {
        return Err(RingError::Validation(format!(
            "{}() is a window function and requires an OVER clause",
            name
        )));
    }

    if !functions::is_scalar(&name) {
        return Err(RingError::Validation(format!("unknown function '{}'", name)));
    }
    functions::check_arity(&name, args.len())?;
    Ok(Expr::Func { name, args })
}

fn plan_value(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Number(n, _) => {
            if n.contains('.') || n.contains('e') || n.contains('E') {
                Ok(Value::Float(n.parse().map_err(|_| {
                    RingError::SqlParse(format!("invalid float literal '{}'", n))
                })?))
            } else {
                Ok(Value::Int(n.parse().map_err(|_| {
                    RingError::SqlParse(format!("invalid integer literal '{}'", n))
                })?))
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::Str(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(RingError::Validation(format!(
            "unsupported literal: {:?}",
            other
        ))),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

fn derive_name(expr: &SqlExpr, idx: usize) -> String {
    match expr {
        SqlExpr::Identifier(ident) => ident.value.to_lowercase(),
        SqlExpr::CompoundIdentifier(idents) => idents
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_else(|| format!("column_{}", idx)),
        SqlExpr::Function(func) => object_name(&func.name),
        _ => format!("column_{}", idx),
    }
}

/// Walk every SELECT; any read of `samples` must carry a `metric_id`
/// predicate, whose bounds accumulate into the pushdown
fn analyze_samples_access(plan: &SelectPlan, pushdown: &mut Pushdown) -> Result<()> {
    for (_, cte) in &plan.ctes {
        analyze_samples_access(cte, pushdown)?;
    }
    match &plan.from {
        TableRef::Subquery(inner) => analyze_samples_access(inner, pushdown)?,
        TableRef::Named(name) if name == TABLE_SAMPLES => {
            let mut ids = BTreeSet::new();
            let mut ts_min = None;
            let mut ts_max = None;
            if let Some(filter) = &plan.filter {
                collect_bounds(filter, &mut ids, &mut ts_min, &mut ts_max);
            }
            if ids.is_empty() {
                return Err(RingError::Validation(
                    "queries over samples must constrain metric_id (e.g. metric_id = 42 or metric_id IN (...))"
                        .into(),
                ));
            }
            pushdown.metric_ids.extend(ids);
            if pushdown.reads == 0 {
                pushdown.ts_min = ts_min;
                pushdown.ts_max = ts_max;
            } else {
                pushdown.ts_min = merge_bound(pushdown.ts_min, ts_min, i64::min);
                pushdown.ts_max = merge_bound(pushdown.ts_max, ts_max, i64::max);
            }
            pushdown.reads += 1;
        }
        TableRef::Named(_) => {}
    }
    Ok(())
}

/// Across multiple samples reads the pushdown has to stay conservative:
/// keep a bound only when every read agrees one exists
fn merge_bound(acc: Option<i64>, new: Option<i64>, pick: fn(i64, i64) -> i64) -> Option<i64> {
    match (acc, new) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        _ => None,
    }
}

fn collect_bounds(
    expr: &Expr,
    ids: &mut BTreeSet<i64>,
    ts_min: &mut Option<i64>,
    ts_max: &mut Option<i64>,
) {
    match expr {
        Expr::Binary { left, op: BinOp::And, right } => {
            collect_bounds(left, ids, ts_min, ts_max);
            collect_bounds(right, ids, ts_min, ts_max);
        }
        Expr::Binary { left, op, right } => {
            let (column, literal, op) = match (left.as_ref(), right.as_ref()) {
                (Expr::Column(c), Expr::Literal(v)) => (c.as_str(), v, *op),
                (Expr::Literal(v), Expr::Column(c)) => (c.as_str(), v, flip(*op)),
                _ => return,
            };
            let Some(value) = literal_i64(literal) else { return };
            match (column, op) {
                ("metric_id", BinOp::Eq) => {
                    ids.insert(value);
                }
                ("ts", BinOp::Ge) => merge_min(ts_min, value),
                ("ts", BinOp::Gt) => merge_min(ts_min, value.saturating_add(1)),
                ("ts", BinOp::Le) => merge_max(ts_max, value),
                ("ts", BinOp::Lt) => merge_max(ts_max, value.saturating_sub(1)),
                _ => {}
            }
        }
        Expr::InList { expr, list, negated: false } => {
            if matches!(expr.as_ref(), Expr::Column(c) if c == "metric_id") {
                for item in list {
                    if let Expr::Literal(v) = item {
                        if let Some(id) = literal_i64(v) {
                            ids.insert(id);
                        }
                    }
                }
            }
        }
        Expr::Between { expr, low, high, negated: false } => {
            if matches!(expr.as_ref(), Expr::Column(c) if c == "ts") {
                if let (Expr::Literal(lo), Expr::Literal(hi)) = (low.as_ref(), high.as_ref()) {
                    if let (Some(lo), Some(hi)) = (literal_i64(lo), literal_i64(hi)) {
                        merge_min(ts_min, lo);
                        merge_max(ts_max, hi);
                    }
                }
            }
        }
        _ => {}
    }
}

fn merge_min(bound: &mut Option<i64>, value: i64) {
    *bound = Some(bound.map_or(value, |b| b.max(value)));
}

fn merge_max(bound: &mut Option<i64>, value: i64) {
    *bound = Some(bound.map_or(value, |b| b.min(value)));
}

fn flip(op: BinOp) -> BinOp {
    match op {
        BinOp::Lt => BinOp::Gt,
        BinOp::Le => BinOp::Ge,
        BinOp::Gt => BinOp::Lt,
        BinOp::Ge => BinOp::Le,
        other => other,
    }
}

fn literal_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}
