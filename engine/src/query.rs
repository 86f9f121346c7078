//! Structured queries: filters, sorting and pagination.
//!
//! Queries are data, not code. A [`Filter`] is a conjunction of field
//! conditions and can be built fluently or parsed from a JSON object such as
//! `{"status": "paid", "total": {"$gte": 100}}`.

use crate::document::{CREATED_AT_FIELD, ID_FIELD};
use crate::{error::Result, Document, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A comparison applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Predicate {
    fn matches(&self, value: Option<&Value>) -> bool {
        let null = Value::Null;
        let actual = value.unwrap_or(&null);
        match self {
            Predicate::Eq(expected) => values_equal(actual, expected),
            Predicate::Ne(expected) => !values_equal(actual, expected),
            Predicate::Gt(bound) => comparable(actual, bound) && compare_values(actual, bound).is_gt(),
            Predicate::Gte(bound) => comparable(actual, bound) && compare_values(actual, bound).is_ge(),
            Predicate::Lt(bound) => comparable(actual, bound) && compare_values(actual, bound).is_lt(),
            Predicate::Lte(bound) => comparable(actual, bound) && compare_values(actual, bound).is_le(),
            Predicate::In(options) => options.iter().any(|o| values_equal(actual, o)),
            Predicate::Nin(options) => !options.iter().any(|o| values_equal(actual, o)),
            Predicate::Exists(expected) => value.is_some() == *expected,
        }
    }
}

/// A predicate bound to a field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(flatten)]
    pub predicate: Predicate,
}

/// Conjunction of conditions. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// A filter matching every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter matching one document by id.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::all().eq(ID_FIELD, Value::String(id.into()))
    }

    fn with(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            predicate,
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Eq(value.into()))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Ne(value.into()))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Gt(value.into()))
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Gte(value.into()))
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Lt(value.into()))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Lte(value.into()))
    }

    pub fn is_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(field, Predicate::In(values))
    }

    pub fn not_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(field, Predicate::Nin(values))
    }

    pub fn exists(self, field: impl Into<String>, exists: bool) -> Self {
        self.with(field, Predicate::Exists(exists))
    }

    /// Parse the JSON filter form.
    ///
    /// Each key is a field path. A plain value means equality; an object
    /// whose keys all start with `$` is a set of operators.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("filter must be an object".into()))?;

        let mut filter = Filter::all();
        for (field, spec) in obj {
            if field.is_empty() || field.starts_with('$') {
                return Err(Error::InvalidQuery(format!(
                    "unsupported filter key '{field}'"
                )));
            }

            match spec {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for (op, operand) in ops {
                        let predicate = parse_operator(field, op, operand)?;
                        filter = filter.with(field.clone(), predicate);
                    }
                }
                other => filter = filter.with(field.clone(), Predicate::Eq(other.clone())),
            }
        }
        Ok(filter)
    }

    /// Whether a document satisfies every condition.
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|c| {
            let value = doc.value_at(&c.field);
            c.predicate.matches(value.as_deref())
        })
    }

    /// The first equality condition on `field`, if any. Used for index lookups.
    pub fn equality_on(&self, field: &str) -> Option<&Value> {
        self.conditions.iter().find_map(|c| match &c.predicate {
            Predicate::Eq(v) if c.field == field => Some(v),
            _ => None,
        })
    }
}

fn parse_operator(field: &str, op: &str, operand: &Value) -> Result<Predicate> {
    let list = |operand: &Value| -> Result<Vec<Value>> {
        operand.as_array().cloned().ok_or_else(|| {
            Error::InvalidQuery(format!("{op} on '{field}' expects an array"))
        })
    };

    Ok(match op {
        "$eq" => Predicate::Eq(operand.clone()),
        "$ne" => Predicate::Ne(operand.clone()),
        "$gt" => Predicate::Gt(operand.clone()),
        "$gte" => Predicate::Gte(operand.clone()),
        "$lt" => Predicate::Lt(operand.clone()),
        "$lte" => Predicate::Lte(operand.clone()),
        "$in" => Predicate::In(list(operand)?),
        "$nin" => Predicate::Nin(list(operand)?),
        "$exists" => Predicate::Exists(operand.as_bool().ok_or_else(|| {
            Error::InvalidQuery(format!("$exists on '{field}' expects a boolean"))
        })?),
        other => {
            return Err(Error::InvalidQuery(format!(
                "unknown operator '{other}' on '{field}'"
            )))
        }
    })
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Range predicates only hold between values of the same kind.
fn comparable(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b) && !a.is_null()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort key for query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    /// Compare two documents; ties are broken by id ascending.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let null = Value::Null;
        let left = a.value_at(&self.field);
        let right = b.value_at(&self.field);
        let ord = compare_values(
            left.as_deref().unwrap_or(&null),
            right.as_deref().unwrap_or(&null),
        );
        let ord = match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        ord.then_with(|| a.id.cmp(&b.id))
    }
}

impl Default for Sort {
    /// Newest documents first.
    fn default() -> Self {
        Sort::desc(CREATED_AT_FIELD)
    }
}

/// Options for `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default)]
    pub sort: Sort,
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted_by(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub documents: Vec<Document>,
    /// Number of matching documents across all pages
    pub total: usize,
    /// 1-based page number
    pub page: usize,
    pub page_count: usize,
}

/// Compute the window of a 1-based page. Returns (skip, page_count).
pub fn page_window(total: usize, page: usize, per_page: usize) -> Result<(usize, usize)> {
    if page == 0 {
        return Err(Error::InvalidQuery("page numbers start at 1".into()));
    }
    if per_page == 0 {
        return Err(Error::InvalidQuery("page size must be positive".into()));
    }
    let page_count = total.div_ceil(per_page);
    Ok(((page - 1).saturating_mul(per_page), page_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, created_at: u64, fields: Value) -> Document {
        Document::from_input(id, fields, created_at, "tester", None).unwrap()
    }

    #[test]
    fn builder_filters() {
        let d = doc("a", 1, json!({"status": "paid", "total": 150, "tags": ["vip"]}));

        assert!(Filter::all().matches(&d));
        assert!(Filter::all().eq("status", "paid").matches(&d));
        assert!(!Filter::all().eq("status", "draft").matches(&d));
        assert!(Filter::all().gte("total", 150).lt("total", 200).matches(&d));
        assert!(!Filter::all().gt("total", 150).matches(&d));
        assert!(Filter::all().ne("status", "draft").matches(&d));
        assert!(Filter::all()
            .is_in("status", vec![json!("paid"), json!("void")])
            .matches(&d));
        assert!(Filter::all().exists("discount", false).matches(&d));
        assert!(Filter::by_id("a").matches(&d));
    }

    #[test]
    fn range_requires_same_kind() {
        let d = doc("a", 1, json!({"total": "150"}));
        assert!(!Filter::all().gt("total", 10).matches(&d));
        assert!(!Filter::all().lt("missing", 10).matches(&d));
    }

    #[test]
    fn numbers_compare_across_representations() {
        let d = doc("a", 1, json!({"qty": 2}));
        assert!(Filter::all().eq("qty", 2.0).matches(&d));
    }

    #[test]
    fn parse_json_filter() {
        let filter =
            Filter::from_json(&json!({"status": "paid", "total": {"$gte": 100, "$lt": 200}}))
                .unwrap();
        assert_eq!(filter.conditions.len(), 3);

        let yes = doc("a", 1, json!({"status": "paid", "total": 120}));
        let no = doc("b", 1, json!({"status": "paid", "total": 220}));
        assert!(filter.matches(&yes));
        assert!(!filter.matches(&no));
    }

    #[test]
    fn parse_rejects_malformed_filters() {
        assert!(matches!(
            Filter::from_json(&json!([1])),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            Filter::from_json(&json!({"total": {"$near": 1}})),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            Filter::from_json(&json!({"$where": "1"})),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            Filter::from_json(&json!({"tag": {"$in": "x"}})),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn nested_object_without_operators_is_equality() {
        let filter = Filter::from_json(&json!({"address": {"city": "Lyon"}})).unwrap();
        let d = doc("a", 1, json!({"address": {"city": "Lyon"}}));
        assert!(filter.matches(&d));
    }

    #[test]
    fn default_sort_is_newest_first() {
        let older = doc("a", 1, json!({}));
        let newer = doc("b", 2, json!({}));
        assert_eq!(Sort::default().compare(&newer, &older), Ordering::Less);
        assert_eq!(Sort::asc("createdAt").compare(&newer, &older), Ordering::Greater);
    }

    #[test]
    fn sort_ties_break_on_id() {
        let a = doc("a", 1, json!({}));
        let b = doc("b", 1, json!({}));
        assert_eq!(Sort::default().compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn value_ordering() {
        assert!(compare_values(&json!(null), &json!(false)).is_lt());
        assert!(compare_values(&json!(true), &json!(0)).is_lt());
        assert!(compare_values(&json!(10), &json!("1")).is_lt());
        assert!(compare_values(&json!(2), &json!(10.5)).is_lt());
        assert!(compare_values(&json!([1, 2]), &json!([1, 3])).is_lt());
    }

    #[test]
    fn page_window_bounds() {
        assert_eq!(page_window(25, 1, 10).unwrap(), (0, 3));
        assert_eq!(page_window(25, 3, 10).unwrap(), (20, 3));
        assert_eq!(page_window(0, 1, 10).unwrap(), (0, 0));
        assert!(page_window(10, 0, 10).is_err());
        assert!(page_window(10, 1, 0).is_err());
    }
}
