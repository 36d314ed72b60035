//! Resource-status predicates.
//!
//! A filter expression is a comma-separated list of clauses, each either a bare
//! field (`failed`) tested for truthiness or a comparison (`change_count > 0`).
//! Field names are matched against a closed set; camelCase, snake_case and a
//! trailing `?` are all accepted. A set of predicates skips a resource unless at
//! least one of them holds.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ReportError, Result};
use crate::report::ResourceStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Resource,
    ResourceType,
    Title,
    Failed,
    Changed,
    Skipped,
    OutOfSync,
    Tags,
    Time,
    EvaluationTime,
    File,
    Line,
    CurrentValues,
    DefaultLogLevel,
    Node,
    SourceDescription,
    ChangeCount,
    OutOfSyncCount,
    PendingCount,
    CompliantCount,
    FailedCount,
    Events,
    ContainmentPath,
}

const ALL_FIELDS: [Field; 23] = [
    Field::Resource, Field::ResourceType, Field::Title, Field::Failed, Field::Changed, Field::Skipped,
    Field::OutOfSync, Field::Tags, Field::Time, Field::EvaluationTime, Field::File, Field::Line,
    Field::CurrentValues, Field::DefaultLogLevel, Field::Node, Field::SourceDescription, Field::ChangeCount,
    Field::OutOfSyncCount, Field::PendingCount, Field::CompliantCount, Field::FailedCount, Field::Events,
    Field::ContainmentPath,
];

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
    /// Collections compare by length.
    List(usize),
}

impl FieldValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            FieldValue::Flag(b) => *b,
            FieldValue::Number(n) => *n != 0.0,
            FieldValue::Text(s) => !s.is_empty(),
            FieldValue::List(n) => *n > 0,
        }
    }
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Resource => "resource",
            Field::ResourceType => "resource_type",
            Field::Title => "title",
            Field::Failed => "failed",
            Field::Changed => "changed",
            Field::Skipped => "skipped",
            Field::OutOfSync => "out_of_sync",
            Field::Tags => "tags",
            Field::Time => "time",
            Field::EvaluationTime => "evaluation_time",
            Field::File => "file",
            Field::Line => "line",
            Field::CurrentValues => "current_values",
            Field::DefaultLogLevel => "default_log_level",
            Field::Node => "node",
            Field::SourceDescription => "source_description",
            Field::ChangeCount => "change_count",
            Field::OutOfSyncCount => "out_of_sync_count",
            Field::PendingCount => "pending_count",
            Field::CompliantCount => "compliant_count",
            Field::FailedCount => "failed_count",
            Field::Events => "events",
            Field::ContainmentPath => "containment_path",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let norm: String = name.trim().trim_end_matches('?').chars().filter(|c| *c != '_').collect::<String>().to_ascii_lowercase();
        ALL_FIELDS.into_iter().find(|f| f.name().replace('_', "") == norm)
    }

    /// `None` when the report did not record the field.
    pub fn read(self, st: &ResourceStatus) -> Option<FieldValue> {
        let text = |v: &Option<String>| v.clone().map(FieldValue::Text);
        let num = |v: Option<i64>| v.map(|n| FieldValue::Number(n as f64));
        match self {
            Field::Resource => st.type_and_title().map(FieldValue::Text),
            Field::ResourceType => text(&st.resource_type),
            Field::Title => text(&st.title),
            Field::Failed => st.failed.map(FieldValue::Flag),
            Field::Changed => st.changed.map(FieldValue::Flag),
            Field::Skipped => st.skipped.map(FieldValue::Flag),
            Field::OutOfSync => st.out_of_sync.map(FieldValue::Flag),
            Field::Tags => Some(FieldValue::List(st.tags.len())),
            Field::Time => text(&st.time),
            Field::EvaluationTime => st.evaluation_time.map(FieldValue::Number),
            Field::File => text(&st.file),
            Field::Line => num(st.line),
            Field::CurrentValues => text(&st.current_values),
            Field::DefaultLogLevel => text(&st.default_log_level),
            Field::Node => text(&st.node),
            Field::SourceDescription => text(&st.source_description),
            Field::ChangeCount => num(st.change_count),
            Field::OutOfSyncCount => num(st.out_of_sync_count),
            Field::PendingCount => num(st.pending_count),
            Field::CompliantCount => num(st.compliant_count),
            Field::FailedCount => num(st.failed_count),
            Field::Events => Some(FieldValue::List(st.events.len())),
            Field::ContainmentPath => Some(FieldValue::List(st.containment_path.len())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator { Gt, Lt, Ge, Le, Eq, Ne }

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ">" => Some(Operator::Gt),
            "<" => Some(Operator::Lt),
            ">=" => Some(Operator::Ge),
            "<=" => Some(Operator::Le),
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self { Operator::Gt => ">", Operator::Lt => "<", Operator::Ge => ">=", Operator::Le => "<=", Operator::Eq => "==", Operator::Ne => "!=" }
    }

    fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Operator::Gt => ord == Greater,
            Operator::Lt => ord == Less,
            Operator::Ge => ord != Less,
            Operator::Le => ord != Greater,
            Operator::Eq => ord == Equal,
            Operator::Ne => ord != Equal,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal { Bool(bool), Number(f64), Text(String) }

impl Literal {
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim();
        let quoted = t.len() >= 2 && ((t.starts_with('"') && t.ends_with('"')) || (t.starts_with('\'') && t.ends_with('\'')));
        if quoted { return Literal::Text(t[1..t.len() - 1].to_string()); }
        match t {
            "true" => Literal::Bool(true),
            "false" => Literal::Bool(false),
            _ => t.parse::<f64>().map(Literal::Number).unwrap_or_else(|_| Literal::Text(t.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub op: Operator,
    pub operand: Literal,
    /// Operand as written, used when a text field meets a non-text literal.
    pub raw: String,
}

impl Comparison {
    pub fn eval(&self, value: &FieldValue) -> bool {
        match (value, &self.operand) {
            (FieldValue::Number(a), Literal::Number(b)) => a.partial_cmp(b).is_some_and(|o| self.op.holds(o)),
            (FieldValue::List(n), Literal::Number(b)) => (*n as f64).partial_cmp(b).is_some_and(|o| self.op.holds(o)),
            (FieldValue::Flag(a), Literal::Bool(b)) => match self.op {
                Operator::Eq => a == b,
                Operator::Ne => a != b,
                _ => false,
            },
            (FieldValue::Text(a), Literal::Text(b)) => self.op.holds(a.as_str().cmp(b.as_str())),
            (FieldValue::Text(a), _) => self.op.holds(a.as_str().cmp(self.raw.as_str())),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    /// Name as written, or the canonical field name when it is known.
    pub method: String,
    pub field: Option<Field>,
    pub comparison: Option<Comparison>,
}

fn clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*\??)\s*(?:(>=|<=|==|!=|>|<)\s*(\S.*?))?\s*$").expect("clause pattern"))
}

impl Predicate {
    pub fn bare(field: Field) -> Self { Predicate { method: field.name().to_string(), field: Some(field), comparison: None } }

    pub fn compare(field: Field, op: Operator, raw: &str) -> Self {
        Predicate { method: field.name().to_string(), field: Some(field), comparison: Some(Comparison { op, operand: Literal::parse(raw), raw: raw.trim().to_string() }) }
    }

    pub fn parse(clause: &str) -> Result<Self> {
        let invalid = |details: &str| ReportError::InvalidFilter { clause: clause.trim().to_string(), details: details.to_string() };
        let caps = clause_re().captures(clause).ok_or_else(|| invalid("expected `field` or `field <op> value` with op one of > < >= <= == !="))?;
        let name = &caps[1];
        let field = Field::from_name(name);
        if field.is_none() { log::warn!("Unknown field '{}' in filter; clause '{}' will never match", name, clause.trim()); }
        let method = field.map(|f| f.name().to_string()).unwrap_or_else(|| name.to_string());
        let comparison = match (caps.get(2), caps.get(3)) {
            (Some(op), Some(val)) => {
                let op = Operator::parse(op.as_str()).ok_or_else(|| invalid("unsupported operator"))?;
                Some(Comparison { op, operand: Literal::parse(val.as_str()), raw: val.as_str().trim().to_string() })
            }
            _ => None,
        };
        Ok(Predicate { method, field, comparison })
    }

    /// Unknown fields and absent values never match.
    pub fn matches(&self, st: &ResourceStatus) -> bool {
        let Some(value) = self.field.and_then(|f| f.read(st)) else { return false };
        match &self.comparison {
            None => value.is_truthy(),
            Some(c) => c.eval(&value),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.comparison {
            None => write!(f, "{}", self.method),
            Some(c) => write!(f, "{} {} {}", self.method, c.op.symbol(), c.raw),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PredicateSet {
    preds: Vec<Predicate>,
}

impl PredicateSet {
    pub fn new() -> Self { Self::default() }

    /// The default changes view: `change_count > 0` or `failed`.
    pub fn changes() -> Self {
        let mut s = Self::new();
        s.insert(Predicate::compare(Field::ChangeCount, Operator::Gt, "0"));
        s.insert(Predicate::bare(Field::Failed));
        s
    }

    pub fn from_expr(expr: &str) -> Result<Self> {
        let mut s = Self::new();
        s.extend_from_expr(expr)?;
        Ok(s)
    }

    /// An identical clause replaces its earlier occurrence.
    pub fn insert(&mut self, p: Predicate) {
        let key = p.to_string();
        self.preds.retain(|q| q.to_string() != key);
        self.preds.push(p);
    }

    pub fn extend_from_expr(&mut self, expr: &str) -> Result<()> {
        for clause in expr.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            self.insert(Predicate::parse(clause)?);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool { self.preds.is_empty() }

    pub fn len(&self) -> usize { self.preds.len() }

    pub fn iter(&self) -> impl Iterator<Item = &Predicate> { self.preds.iter() }

    /// With any predicates present a resource is skipped unless one of them holds.
    pub fn skips(&self, st: &ResourceStatus) -> bool {
        !self.preds.is_empty() && !self.preds.iter().any(|p| p.matches(st))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(change_count: i64, failed: bool) -> ResourceStatus {
        ResourceStatus { change_count: Some(change_count), failed: Some(failed), ..Default::default() }
    }

    #[test]
    fn empty_set_never_skips() {
        let s = PredicateSet::new();
        assert!(!s.skips(&status(0, false)));
        assert!(!s.skips(&ResourceStatus::default()));
    }

    #[test]
    fn changes_view_is_change_count_or_failed() {
        let s = PredicateSet::changes();
        assert_eq!(s.len(), 2);
        assert!(s.skips(&status(0, false)));
        assert!(!s.skips(&status(0, true)));
        assert!(!s.skips(&status(2, false)));
        assert!(s.skips(&ResourceStatus::default()));
    }

    #[test]
    fn clause_parsing() {
        let p = Predicate::parse("changeCount >= 2").unwrap();
        assert_eq!(p.field, Some(Field::ChangeCount));
        assert_eq!(p.to_string(), "change_count >= 2");
        let p = Predicate::parse(" failed? ").unwrap();
        assert_eq!(p.field, Some(Field::Failed));
        assert!(p.comparison.is_none());
        let p = Predicate::parse("resource_type == 'Service'").unwrap();
        assert_eq!(p.comparison.unwrap().operand, Literal::Text("Service".into()));
    }

    #[test]
    fn malformed_clauses_are_rejected() {
        for c in ["> 3", "change_count >", "change_count = 1", "change_count => 1", "1abc"] {
            assert!(matches!(Predicate::parse(c), Err(ReportError::InvalidFilter { .. })), "{c}");
        }
    }

    #[test]
    fn unknown_field_fails_closed() {
        let s = PredicateSet::from_expr("bogus_field, failed").unwrap();
        assert_eq!(s.len(), 2);
        assert!(!s.iter().next().unwrap().matches(&status(5, true)));
        assert!(!s.skips(&status(0, true)));
        let only_unknown = PredicateSet::from_expr("bogus > 1").unwrap();
        assert!(only_unknown.skips(&status(5, true)));
    }

    #[test]
    fn identical_clause_replaces_previous() {
        let mut s = PredicateSet::changes();
        s.extend_from_expr("failed, change_count > 0, skipped").unwrap();
        let shown: Vec<String> = s.iter().map(|p| p.to_string()).collect();
        assert_eq!(shown, vec!["failed", "change_count > 0", "skipped"]);
    }

    #[test]
    fn typed_comparisons() {
        let mut st = status(3, false);
        st.resource_type = Some("File".into());
        st.tags = vec!["a".into(), "b".into()];
        st.line = Some(40);
        st.evaluation_time = Some(1.5);
        assert!(Predicate::parse("change_count == 3").unwrap().matches(&st));
        assert!(Predicate::parse("change_count != 4").unwrap().matches(&st));
        assert!(Predicate::parse("failed == false").unwrap().matches(&st));
        assert!(!Predicate::parse("failed > false").unwrap().matches(&st));
        assert!(Predicate::parse("resource_type == File").unwrap().matches(&st));
        assert!(Predicate::parse("resource_type != \"Service\"").unwrap().matches(&st));
        assert!(Predicate::parse("tags >= 2").unwrap().matches(&st));
        assert!(Predicate::parse("line < 100").unwrap().matches(&st));
        assert!(Predicate::parse("evaluation_time > 1.2").unwrap().matches(&st));
        assert!(!Predicate::parse("change_count > many").unwrap().matches(&st));
        assert!(!Predicate::parse("node == x").unwrap().matches(&st));
    }

    #[test]
    fn bare_truthiness() {
        let mut st = ResourceStatus::default();
        assert!(!Predicate::parse("events").unwrap().matches(&st));
        st.events.push(Default::default());
        assert!(Predicate::parse("events").unwrap().matches(&st));
        st.change_count = Some(0);
        assert!(!Predicate::parse("change_count").unwrap().matches(&st));
        st.file = Some(String::new());
        assert!(!Predicate::parse("file").unwrap().matches(&st));
    }
}
