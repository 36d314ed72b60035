use serde::Serialize;

use crate::predicate::PredicateSet;
use crate::report::{ReportRecord, ResourceStatus};
use crate::tags::TagFilter;

/// Hidden from the changes view unless they failed.
pub const DEFAULT_IGNORED_RESOURCES: &[&str] = &["Notify[environment_notice]"];

#[derive(Clone, Debug)]
pub struct ResourceFilter {
    pub predicates: PredicateSet,
    pub tags: TagFilter,
    pub ignore_resources: Vec<String>,
}

impl Default for ResourceFilter {
    fn default() -> Self {
        Self {
            predicates: PredicateSet::changes(),
            tags: TagFilter::Any,
            ignore_resources: DEFAULT_IGNORED_RESOURCES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QualifiedResource<'a> {
    pub key: &'a str,
    pub status: &'a ResourceStatus,
    pub matched_tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FilteredReport<'a> {
    pub report: &'a ReportRecord,
    pub resources: Vec<QualifiedResource<'a>>,
}

impl ResourceFilter {
    fn ignored(&self, key: &str, st: &ResourceStatus) -> bool {
        if st.is_failed() { return false; }
        let name = st.type_and_title();
        self.ignore_resources.iter().any(|r| r == key || name.as_deref() == Some(r.as_str()))
    }

    /// Both the predicate stage and the tag stage must pass; returns the matched tags when they do.
    pub fn admit(&self, key: &str, st: &ResourceStatus) -> Option<Vec<String>> {
        if self.ignored(key, st) { return None; }
        if self.predicates.skips(st) { return None; }
        let m = self.tags.check(&st.tags);
        if m.passed { Some(m.matched) } else { None }
    }

    pub fn filter_report<'a>(&self, report: &'a ReportRecord) -> FilteredReport<'a> {
        let resources = report
            .resource_statuses
            .iter()
            .filter_map(|(key, st)| self.admit(key, st).map(|matched_tags| QualifiedResource { key, status: st, matched_tags }))
            .collect();
        FilteredReport { report, resources }
    }

    pub fn filter_reports<'a>(&self, reports: &[&'a ReportRecord]) -> Vec<FilteredReport<'a>> {
        reports.iter().map(|r| self.filter_report(r)).collect()
    }
}
