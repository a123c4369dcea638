//! Typed query results.
//!
//! The backend's response envelope is decoded upstream into a closed
//! tagged union: one variant per result shape the query language can
//! produce. Keeping the union closed means consumers match exhaustively
//! instead of type-asserting against an opaque payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric labels, ordered so two equal label sets compare and hash equal.
pub type LabelSet = BTreeMap<String, String>;

/// The four shapes a query evaluation can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Vector,
    Matrix,
    Scalar,
    String,
}

/// One sampled value at one moment, timestamp in seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: f64,
    pub value: f64,
}

/// An instant-query sample: one point for one labelled series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: LabelSet,
    pub point: Point,
}

/// A range-query series: the points for one labelled series across the
/// queried span, in ascending timestamp order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSeries {
    pub metric: LabelSet,
    pub points: Vec<Point>,
}

impl RangeSeries {
    pub fn new(metric: LabelSet) -> Self {
        Self {
            metric,
            points: Vec::new(),
        }
    }
}

/// The decoded result payload, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryValue {
    Vector(Vec<Sample>),
    Matrix(Vec<RangeSeries>),
    Scalar(Point),
    String { timestamp: f64, value: String },
}

impl QueryValue {
    pub fn result_type(&self) -> ResultType {
        match self {
            QueryValue::Vector(_) => ResultType::Vector,
            QueryValue::Matrix(_) => ResultType::Matrix,
            QueryValue::Scalar(_) => ResultType::Scalar,
            QueryValue::String { .. } => ResultType::String,
        }
    }

    /// The matrix series, if this is a matrix result.
    pub fn as_matrix(&self) -> Option<&[RangeSeries]> {
        match self {
            QueryValue::Matrix(series) => Some(series),
            _ => None,
        }
    }
}

/// A successful query evaluation.
///
/// Failure is represented as `Err(QueryError)`, not as a status field;
/// `warnings` carries the backend's non-fatal annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub value: QueryValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl QueryResult {
    pub fn new(value: QueryValue) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn result_type(&self) -> ResultType {
        self.value.result_type()
    }
}
