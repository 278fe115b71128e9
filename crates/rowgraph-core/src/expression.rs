//! Row qualifiers.
//!
//! A small expression tree over column values. Data sources translate it into
//! their own query language; in-memory sources evaluate it with
//! [`Expression::matches`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::row::DataRow;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expression {
    /// Matches every row.
    True,
    /// `column = value`. Never matches NULL.
    Match { column: String, value: Value },
    /// `(c1, c2, ..) IN ((v1, v2, ..), ..)`
    In {
        columns: Vec<String>,
        tuples: Vec<Vec<Value>>,
    },
    And(Vec<Expression>),
    Or(Vec<Expression>),
}

impl Expression {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Expression::Match {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Single-column `IN`.
    pub fn in_values(column: impl Into<String>, values: Vec<Value>) -> Self {
        Expression::In {
            columns: vec![column.into()],
            tuples: values.into_iter().map(|v| vec![v]).collect(),
        }
    }

    /// Multi-column `IN`.
    pub fn in_tuples(columns: Vec<String>, tuples: Vec<Vec<Value>>) -> Self {
        Expression::In { columns, tuples }
    }

    /// Conjunction, flattening nested `And`s and dropping `True`.
    pub fn and(self, other: Expression) -> Self {
        match (self, other) {
            (Expression::True, e) | (e, Expression::True) => e,
            (Expression::And(mut a), Expression::And(b)) => {
                a.extend(b);
                Expression::And(a)
            }
            (Expression::And(mut a), e) => {
                a.push(e);
                Expression::And(a)
            }
            (e, Expression::And(mut b)) => {
                b.insert(0, e);
                Expression::And(b)
            }
            (a, b) => Expression::And(vec![a, b]),
        }
    }

    /// Evaluate against a row. Absent columns read as NULL.
    pub fn matches(&self, row: &DataRow) -> bool {
        match self {
            Expression::True => true,
            Expression::Match { column, value } => {
                let actual = row.value(column);
                !actual.is_null() && actual == value
            }
            Expression::In { columns, tuples } => tuples.iter().any(|tuple| {
                tuple.len() == columns.len()
                    && columns.iter().zip(tuple).all(|(c, v)| {
                        let actual = row.value(c);
                        !actual.is_null() && actual == v
                    })
            }),
            Expression::And(parts) => parts.iter().all(|p| p.matches(row)),
            Expression::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }

    /// Number of value terms, the measure bounded by the max id-qualifier size.
    pub fn term_count(&self) -> usize {
        match self {
            Expression::True => 0,
            Expression::Match { .. } => 1,
            Expression::In { tuples, .. } => tuples.iter().map(Vec::len).sum(),
            Expression::And(parts) | Expression::Or(parts) => {
                parts.iter().map(Expression::term_count).sum()
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::True => write!(f, "true"),
            Expression::Match { column, value } => write!(f, "{column} = {value}"),
            Expression::In { columns, tuples } => {
                write!(f, "({}) in (", columns.join(", "))?;
                for (i, tuple) in tuples.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let parts: Vec<String> = tuple.iter().map(ToString::to_string).collect();
                    write!(f, "({})", parts.join(", "))?;
                }
                write!(f, ")")
            }
            Expression::And(parts) | Expression::Or(parts) => {
                let sep = if matches!(self, Expression::And(_)) { " and " } else { " or " };
                let rendered: Vec<String> = parts.iter().map(|p| format!("({p})")).collect();
                write!(f, "{}", rendered.join(sep))
            }
        }
    }
}
