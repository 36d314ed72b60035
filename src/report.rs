//! Puppet run report model and the YAML loader.
//!
//! Report files are Ruby-flavoured YAML (`!ruby/object:Puppet::Transaction::Report`,
//! `!ruby/sym info`, ...). Tags are dropped before the document is mapped onto the
//! structs below, and every field is optional so older report formats load cleanly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{ReportError, Result};
use crate::indexer::ReportFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel { Debug, Info, Notice, Warning, Err, Alert, Emerg, Crit }

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches(':').to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "notice" => Some(Self::Notice),
            "warning" => Some(Self::Warning),
            "err" => Some(Self::Err),
            "alert" => Some(Self::Alert),
            "emerg" => Some(Self::Emerg),
            "crit" => Some(Self::Crit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Err => "err",
            Self::Alert => "alert",
            Self::Emerg => "emerg",
            Self::Crit => "crit",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogEntry {
    #[serde(deserialize_with = "lenient::text")]
    pub level: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub time: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub source: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub tags: Vec<String>,
}

impl LogEntry {
    pub fn severity(&self) -> Option<LogLevel> { self.level.as_deref().and_then(LogLevel::parse) }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(deserialize_with = "lenient::text")]
    pub property: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub previous_value: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub desired_value: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub time: Option<String>,
    #[serde(deserialize_with = "lenient::flag")]
    pub audited: Option<bool>,
}

impl Event {
    /// `property: old -> new (status)`, falling back to the event message.
    pub fn summary(&self) -> String {
        let mut s = match (&self.property, &self.previous_value, &self.desired_value) {
            (Some(p), prev, want) if prev.is_some() || want.is_some() => format!(
                "{}: {} -> {}",
                p,
                prev.as_deref().unwrap_or("nil"),
                want.as_deref().unwrap_or("nil"),
            ),
            (Some(p), _, _) => p.clone(),
            (None, _, _) => self.message.clone().or_else(|| self.name.clone()).unwrap_or_default(),
        };
        if let Some(st) = self.status.as_ref() { s.push_str(&format!(" ({})", st)); }
        s
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceStatus {
    #[serde(deserialize_with = "lenient::text")]
    pub resource: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub resource_type: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient::flag")]
    pub failed: Option<bool>,
    #[serde(deserialize_with = "lenient::flag")]
    pub changed: Option<bool>,
    #[serde(deserialize_with = "lenient::flag")]
    pub skipped: Option<bool>,
    #[serde(deserialize_with = "lenient::flag")]
    pub out_of_sync: Option<bool>,
    #[serde(deserialize_with = "lenient::list")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub time: Option<String>,
    #[serde(deserialize_with = "lenient::float")]
    pub evaluation_time: Option<f64>,
    #[serde(deserialize_with = "lenient::text")]
    pub file: Option<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub line: Option<i64>,
    #[serde(deserialize_with = "lenient::text")]
    pub current_values: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub default_log_level: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub node: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub source_description: Option<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub change_count: Option<i64>,
    #[serde(deserialize_with = "lenient::count")]
    pub out_of_sync_count: Option<i64>,
    #[serde(deserialize_with = "lenient::count")]
    pub pending_count: Option<i64>,
    #[serde(deserialize_with = "lenient::count")]
    pub compliant_count: Option<i64>,
    #[serde(deserialize_with = "lenient::count")]
    pub failed_count: Option<i64>,
    #[serde(deserialize_with = "lenient::seq")]
    pub events: Vec<Event>,
    #[serde(deserialize_with = "lenient::list")]
    pub containment_path: Vec<String>,
}

impl ResourceStatus {
    /// `Type[title]` as recorded, or rebuilt from type and title.
    pub fn type_and_title(&self) -> Option<String> {
        if let Some(r) = self.resource.as_ref() { return Some(r.clone()); }
        match (&self.resource_type, &self.title) {
            (Some(t), Some(title)) => Some(format!("{}[{}]", t, title)),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool { self.failed.unwrap_or(false) }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metric {
    #[serde(deserialize_with = "lenient::text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub label: Option<String>,
    #[serde(deserialize_with = "lenient::seq")]
    pub values: Vec<Vec<Value>>,
}

impl Metric {
    /// Looks up a `[name, label, value]` triple.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.iter().find_map(|row| {
            if row.first().and_then(Value::as_str) != Some(name) { return None; }
            match row.last()? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            }
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportRecord {
    #[serde(skip_deserializing)]
    pub source: PathBuf,
    #[serde(deserialize_with = "lenient::text")]
    pub host: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub time: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub configuration_version: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub report_format: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub puppet_version: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub environment: Option<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub pending_count: Option<i64>,
    #[serde(deserialize_with = "lenient::count")]
    pub compliant_count: Option<i64>,
    #[serde(deserialize_with = "lenient::count")]
    pub failed_count: Option<i64>,
    #[serde(deserialize_with = "lenient::seq")]
    pub logs: Vec<LogEntry>,
    #[serde(deserialize_with = "lenient::map")]
    pub resource_statuses: BTreeMap<String, ResourceStatus>,
    #[serde(deserialize_with = "lenient::map")]
    pub metrics: BTreeMap<String, Metric>,
}

impl ReportRecord {
    pub fn host_name(&self) -> &str { self.host.as_deref().unwrap_or("") }

    pub fn is_status(&self, status: &str) -> bool { self.status.as_deref() == Some(status) }

    pub fn parsed_time(&self) -> Option<DateTime<Utc>> { self.time.as_deref().and_then(parse_report_time) }

    /// Failed resources: explicit count, then the `resources` metric, then the statuses themselves.
    pub fn failed_resources(&self) -> Option<i64> {
        if let Some(n) = self.failed_count { return Some(n); }
        if let Some(v) = self.metrics.get("resources").and_then(|m| m.value("failed")) { return Some(v as i64); }
        if self.resource_statuses.is_empty() { return None; }
        Some(self.resource_statuses.values().filter(|s| s.is_failed()).count() as i64)
    }

    pub fn pending_resources(&self) -> Option<i64> {
        self.pending_count.or_else(|| sum_counts(self.resource_statuses.values().map(|s| s.pending_count)))
    }

    pub fn compliant_resources(&self) -> Option<i64> {
        self.compliant_count.or_else(|| sum_counts(self.resource_statuses.values().map(|s| s.compliant_count)))
    }
}

fn sum_counts(it: impl Iterator<Item = Option<i64>>) -> Option<i64> {
    it.fold(None, |acc, c| match (acc, c) { (None, c) => c, (a, None) => a, (Some(a), Some(b)) => Some(a + b) })
}

/// Puppet writes `2024-01-02 00:00:01.123456 +00:00`; RFC 3339 shows up in newer agents.
pub fn parse_report_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) { return Some(dt.with_timezone(&Utc)); }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f %:z", "%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) { return Some(dt.with_timezone(&Utc)); }
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") { return Some(naive.and_utc()); }
    None
}

fn strip_tags(v: Value) -> Value {
    match v {
        Value::Tagged(t) => strip_tags(t.value),
        Value::Sequence(s) => Value::Sequence(s.into_iter().map(strip_tags).collect()),
        Value::Mapping(m) => Value::Mapping(m.into_iter().map(|(k, v)| (strip_tags(k), strip_tags(v))).collect()),
        other => other,
    }
}

/// Parses one report document; the error string describes why it is not a report.
pub fn parse_report(text: &str) -> std::result::Result<ReportRecord, String> {
    let raw: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    let plain = strip_tags(raw);
    if !plain.is_mapping() { return Err("document is not a mapping".to_string()); }
    serde_yaml::from_value(plain).map_err(|e| e.to_string())
}

pub trait ReportLoader {
    fn load(&self, path: &Path) -> Result<ReportRecord>;
}

/// Reads report files from disk on every call; nothing is cached.
#[derive(Clone, Copy, Debug, Default)]
pub struct YamlReportLoader;

impl ReportLoader for YamlReportLoader {
    fn load(&self, path: &Path) -> Result<ReportRecord> {
        let data = std::fs::read_to_string(path).map_err(|e| ReportError::MalformedReport { path: path.to_path_buf(), details: e.to_string() })?;
        let mut rec = parse_report(&data).map_err(|details| ReportError::MalformedReport { path: path.to_path_buf(), details })?;
        rec.source = path.to_path_buf();
        Ok(rec)
    }
}

/// Loads `files` in order. Unreadable or malformed reports are logged and returned separately.
pub fn load_reports(loader: &dyn ReportLoader, files: &[ReportFile], pb: Option<&indicatif::ProgressBar>) -> (Vec<ReportRecord>, Vec<ReportError>) {
    let mut records = Vec::with_capacity(files.len());
    let mut failures = vec![];
    for (i, f) in files.iter().enumerate() {
        if let Some(pb) = pb && i % 50 == 0 { pb.tick(); pb.set_message(format!("Loaded {} of {} reports", i, files.len())); }
        match loader.load(&f.path) {
            Ok(r) => records.push(r),
            Err(e) => { log::warn!("Skipping report: {}", e); failures.push(e); }
        }
    }
    (records, failures)
}

mod lenient {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer};
    use serde_yaml::Value;

    pub fn flatten(v: &Value) -> Option<String> {
        match v {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Sequence(items) => Some(format!("[{}]", items.iter().filter_map(flatten).collect::<Vec<_>>().join(", "))),
            Value::Mapping(m) => {
                let parts: Vec<String> = m.iter().map(|(k, v)| format!("{} => {}", flatten(k).unwrap_or_default(), flatten(v).unwrap_or_else(|| "nil".to_string()))).collect();
                Some(format!("{{{}}}", parts.join(", ")))
            }
            Value::Tagged(t) => flatten(&t.value),
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<Value>::deserialize(d)?.as_ref().and_then(flatten))
    }

    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn float<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::String(s)) => match s.trim() { "true" => Some(true), "false" => Some(false), _ => None },
            _ => None,
        })
    }

    pub fn list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Sequence(items)) => items.iter().filter_map(flatten).collect(),
            Some(Value::String(s)) => vec![s],
            _ => vec![],
        })
    }

    pub fn seq<'de, D: Deserializer<'de>, T: Deserialize<'de>>(d: D) -> Result<Vec<T>, D::Error> {
        Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
    }

    pub fn map<'de, D: Deserializer<'de>, T: Deserialize<'de>>(d: D) -> Result<BTreeMap<String, T>, D::Error> {
        Ok(Option::<BTreeMap<String, T>>::deserialize(d)?.unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A trimmed report in the shape `puppet agent` writes with `reports = store`.
    pub fn report_yaml(host: &str, time: &str, status: &str) -> String {
        format!(r#"--- !ruby/object:Puppet::Transaction::Report
  host: {host}
  time: {time}
  configuration_version: 1704153600
  report_format: 4
  puppet_version: "3.8.7"
  kind: apply
  status: {status}
  environment: production
  logs:
    - !ruby/object:Puppet::Util::Log
      level: !ruby/sym debug
      message: "Loaded state in 0.01 seconds"
      source: Puppet
      time: {time}
    - !ruby/object:Puppet::Util::Log
      level: !ruby/sym notice
      message: "ensure changed 'stopped' to 'running'"
      source: "/Stage[main]/App::Deploy/Service[app]/ensure"
      tags: [notice, service, app]
      time: {time}
    - !ruby/object:Puppet::Util::Log
      level: !ruby/sym err
      message: "Could not start Service[worker]"
      source: "/Stage[main]/App::Deploy/Service[worker]"
      time: {time}
  metrics:
    resources: !ruby/object:Puppet::Util::Metric
      name: resources
      label: Resources
      values:
        - [total, Total, 4]
        - [failed, Failed, 1]
        - [changed, Changed, 1]
  resource_statuses:
    "Service[app]": !ruby/object:Puppet::Resource::Status
      resource: "Service[app]"
      resource_type: Service
      title: app
      file: /etc/puppet/modules/app/manifests/deploy.pp
      line: 12
      evaluation_time: 0.25
      change_count: 1
      out_of_sync_count: 1
      changed: true
      failed: false
      skipped: false
      tags: [service, app, "app::deploy", class]
      time: {time}
      events:
        - !ruby/object:Puppet::Transaction::Event
          property: ensure
          previous_value: !ruby/sym stopped
          desired_value: !ruby/sym running
          message: "ensure changed 'stopped' to 'running'"
          name: !ruby/sym service_started
          status: success
    "Service[worker]": !ruby/object:Puppet::Resource::Status
      resource: "Service[worker]"
      file: /etc/puppet/modules/app/manifests/deploy.pp
      line: 20
      change_count: 0
      failed: true
      tags: [service, worker, "app::deploy"]
      events: []
    "File[/etc/motd]": !ruby/object:Puppet::Resource::Status
      resource: "File[/etc/motd]"
      change_count: 0
      failed: false
      tags: [file, motd, "base::secret"]
    "Notify[environment_notice]": !ruby/object:Puppet::Resource::Status
      resource: "Notify[environment_notice]"
      change_count: 1
      failed: false
      tags: [notify]
"#)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_puppet_report() {
        let rec = parse_report(&fixtures::report_yaml("web1", "2024-01-02 00:00:05.5 +00:00", "changed")).unwrap();
        assert_eq!(rec.host_name(), "web1");
        assert!(rec.is_status("changed"));
        assert_eq!(rec.report_format.as_deref(), Some("4"));
        assert_eq!(rec.configuration_version.as_deref(), Some("1704153600"));
        assert_eq!(rec.logs.len(), 3);
        assert_eq!(rec.logs[1].severity(), Some(LogLevel::Notice));
        assert_eq!(rec.resource_statuses.len(), 4);
        let app = &rec.resource_statuses["Service[app]"];
        assert_eq!(app.change_count, Some(1));
        assert_eq!(app.line, Some(12));
        assert!(app.tags.contains(&"app::deploy".to_string()));
        assert_eq!(app.events[0].summary(), "ensure: stopped -> running (success)");
        assert!(rec.resource_statuses["Service[worker]"].is_failed());
    }

    #[test]
    fn counts_fall_back_to_metrics_and_statuses() {
        let rec = parse_report(&fixtures::report_yaml("web1", "2024-01-02 00:00:00 +00:00", "failed")).unwrap();
        assert_eq!(rec.failed_count, None);
        assert_eq!(rec.failed_resources(), Some(1));
        assert_eq!(rec.pending_resources(), None);
        assert_eq!(rec.metrics["resources"].value("total"), Some(4.0));
    }

    #[test]
    fn partial_schema_is_not_an_error() {
        let rec = parse_report("--- !ruby/object:Puppet::Transaction::Report\n  host: old1\n  logs: ~\n  resource_statuses: {}\n").unwrap();
        assert_eq!(rec.host_name(), "old1");
        assert!(rec.time.is_none());
        assert!(rec.logs.is_empty());
        assert!(rec.failed_resources().is_none());
    }

    #[test]
    fn lenient_scalars() {
        let rec = parse_report("host: h\nfailed_count: \"3\"\nresource_statuses:\n  \"File[a]\":\n    failed: \"true\"\n    line: \"7\"\n    current_values: {ensure: file}\n").unwrap();
        assert_eq!(rec.failed_count, Some(3));
        let st = &rec.resource_statuses["File[a]"];
        assert_eq!(st.failed, Some(true));
        assert_eq!(st.line, Some(7));
        assert_eq!(st.current_values.as_deref(), Some("{ensure => file}"));
        assert_eq!(st.type_and_title(), None);
    }

    #[test]
    fn non_mapping_is_malformed() {
        assert!(parse_report("- just\n- a list\n").is_err());
        assert!(parse_report("host: [unclosed").is_err());
    }

    #[test]
    fn loader_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("202401010000.yaml");
        std::fs::write(&bad, "host: [unclosed").unwrap();
        let good = dir.path().join("202401020000.yaml");
        std::fs::write(&good, fixtures::report_yaml("web1", "2024-01-02 00:00:00 +00:00", "changed")).unwrap();
        let files: Vec<ReportFile> = [bad.clone(), dir.path().join("202401030000.yaml"), good.clone()]
            .into_iter()
            .map(|p| ReportFile { timestamp_key: crate::indexer::timestamp_key(&p.file_name().unwrap().to_string_lossy()).unwrap(), path: p, host: String::new() })
            .collect();
        let (records, failures) = load_reports(&YamlReportLoader, &files, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, good);
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|e| matches!(e, ReportError::MalformedReport { .. })));
    }

    #[test]
    fn report_time_formats() {
        let a = parse_report_time("2024-01-02 06:00:00.123456 +00:00").unwrap();
        let b = parse_report_time("2024-01-02T07:00:00+01:00").unwrap();
        assert_eq!(a.timestamp(), b.timestamp());
        assert!(parse_report_time("yesterday").is_none());
    }

    #[test]
    fn level_order() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Err > LogLevel::Warning);
        assert_eq!(LogLevel::parse(":warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("verbose"), None);
    }
}
