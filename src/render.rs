use std::path::Path;

use comfy_table::{ContentArrangement, Table};
use serde::Serialize;

use crate::filter::{FilteredReport, QualifiedResource};
use crate::indexer::FileIndex;
use crate::report::{LogEntry, LogLevel, ReportRecord, ResourceStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOrder {
    /// Ascending report time, then host.
    Chronological,
    /// Keep the order the caller already established.
    Preserve,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RenderOptions {
    pub verbose: bool,
    pub color: bool,
}

fn paint(s: &str, code: &str, color: bool) -> String {
    if color { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}

fn or_dash(v: Option<&str>) -> &str { v.unwrap_or("-") }

pub fn order_reports(records: &[ReportRecord], order: RenderOrder) -> Vec<&ReportRecord> {
    let mut out: Vec<&ReportRecord> = records.iter().collect();
    if order == RenderOrder::Chronological {
        out.sort_by(|a, b| {
            a.parsed_time()
                .cmp(&b.parsed_time())
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.host_name().cmp(b.host_name()))
        });
    }
    out
}

fn attributes(st: &ResourceStatus, verbose: bool) -> Vec<(&'static str, String)> {
    let mut a: Vec<(&'static str, String)> = vec![];
    if st.is_failed() { a.push(("failed", "true".to_string())); }
    if let Some(n) = st.change_count { a.push(("change_count", n.to_string())); }
    if !st.events.is_empty() {
        let ev: Vec<String> = st.events.iter().map(|e| e.summary()).collect();
        a.push(("events", format!("[{}]", ev.join("; "))));
    }
    if !verbose { return a; }
    if let Some(r) = st.type_and_title() { a.insert(0, ("resource", r)); }
    if let Some(n) = st.out_of_sync_count { a.push(("out_of_sync_count", n.to_string())); }
    if let Some(v) = st.time.as_ref() { a.push(("time", v.clone())); }
    if let Some(v) = st.evaluation_time { a.push(("evaluation_time", format!("{}", v))); }
    if let Some(v) = st.file.as_ref() { a.push(("file", v.clone())); }
    if let Some(v) = st.line { a.push(("line", v.to_string())); }
    if let Some(v) = st.current_values.as_ref() { a.push(("current_values", v.clone())); }
    if let Some(v) = st.default_log_level.as_ref() { a.push(("default_log_level", v.clone())); }
    if let Some(v) = st.node.as_ref() { a.push(("node", v.clone())); }
    if let Some(v) = st.source_description.as_ref() { a.push(("source_description", v.clone())); }
    if st.skipped == Some(true) { a.push(("skipped", "true".to_string())); }
    a
}

fn resource_line(r: &QualifiedResource, opts: RenderOptions) -> String {
    let mut s = format!("\t{}", paint(r.key, "1", opts.color));
    for (k, v) in attributes(r.status, opts.verbose) { s.push_str(&format!("  {}: {}", k, v.replace('\n', " "))); }
    if opts.verbose && !r.matched_tags.is_empty() { s.push_str(&format!("  tags matched: {}", r.matched_tags.join(", "))); }
    s
}

/// One block per report that still has qualifying resources.
pub fn render_changes(filtered: &[FilteredReport], opts: RenderOptions) -> String {
    let mut s = String::new();
    for fr in filtered {
        if fr.resources.is_empty() { continue; }
        let r = fr.report;
        let status = or_dash(r.status.as_deref());
        let status_code = match status { "failed" => "1;31", "changed" => "1;33", _ => "1;32" };
        s.push_str(&format!(
            "\nReport({}): {}  {}  Config:{}  {}\n",
            r.report_format.as_deref().unwrap_or(""),
            paint(r.host_name(), "1;36", opts.color),
            or_dash(r.time.as_deref()),
            or_dash(r.configuration_version.as_deref()),
            paint(status, status_code, opts.color),
        ));
        if opts.verbose {
            let mut extra: Vec<String> = vec![];
            if let Some(v) = r.puppet_version.as_ref() { extra.push(format!("puppet {}", v)); }
            if let Some(v) = r.environment.as_ref() { extra.push(format!("environment {}", v)); }
            if let Some(v) = r.kind.as_ref() { extra.push(format!("kind {}", v)); }
            if let Some(n) = r.failed_resources() { extra.push(format!("failed {}", n)); }
            if let Some(n) = r.pending_resources() { extra.push(format!("pending {}", n)); }
            if let Some(n) = r.compliant_resources() { extra.push(format!("compliant {}", n)); }
            if !extra.is_empty() { s.push_str(&format!("\t{}\n", extra.join("  "))); }
        }
        for q in &fr.resources {
            s.push_str(&resource_line(q, opts));
            s.push('\n');
        }
    }
    s
}

/// Informational and more severe; entries with an unrecognised level are kept.
pub fn visible_logs(r: &ReportRecord) -> Vec<&LogEntry> {
    r.logs.iter().filter(|l| l.severity().is_none_or(|lv| lv >= LogLevel::Info)).collect()
}

fn level_code(l: Option<LogLevel>) -> &'static str {
    match l {
        Some(LogLevel::Err | LogLevel::Alert | LogLevel::Emerg | LogLevel::Crit) => "31",
        Some(LogLevel::Warning) => "33",
        Some(LogLevel::Notice) => "36",
        _ => "37",
    }
}

/// Log lines of changed reports.
pub fn render_logs(reports: &[&ReportRecord], opts: RenderOptions) -> String {
    let mut s = String::new();
    for r in reports {
        if !r.is_status("changed") { continue; }
        let logs = visible_logs(r);
        if logs.is_empty() { continue; }
        s.push_str(&format!("\nReport: {}  {}  {}\n", paint(r.host_name(), "1;36", opts.color), or_dash(r.time.as_deref()), or_dash(r.status.as_deref())));
        for l in logs {
            let lvl = l.severity().map(LogLevel::as_str).or(l.level.as_deref()).unwrap_or("?");
            s.push_str(&format!("\t{} {}", paint(&format!("[{}]", lvl), level_code(l.severity()), opts.color), or_dash(l.time.as_deref())));
            if opts.verbose && let Some(src) = l.source.as_ref() { s.push_str(&format!(" {}", src)); }
            s.push_str(&format!(": {}\n", l.message.as_deref().unwrap_or("").replace('\n', " ")));
        }
    }
    s
}

pub fn render_host_index(index: &FileIndex, as_table: bool) -> String {
    let latest = |host: &str| index.latest_for(host).map(|f| f.path.to_string_lossy().into_owned()).unwrap_or_else(|| "-".to_string());
    if as_table {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Index", "Host", "Latest report"]);
        for (i, h) in index.hosts.iter().enumerate() { table.add_row(vec![i.to_string(), h.host.clone(), latest(&h.host)]); }
        return format!("{}\n", table);
    }
    let mut s = String::from("Found the following host entries:\n");
    for (i, h) in index.hosts.iter().enumerate() { s.push_str(&format!("\t{:>3}: {}  {}\n", i, h.host, latest(&h.host))); }
    s
}

#[derive(Serialize)]
struct ReportChanges<'a> {
    source: &'a Path,
    host: Option<&'a str>,
    time: Option<&'a str>,
    status: Option<&'a str>,
    configuration_version: Option<&'a str>,
    report_format: Option<&'a str>,
    resources: &'a [QualifiedResource<'a>],
}

#[derive(Serialize)]
struct ReportLogs<'a> {
    source: &'a Path,
    host: Option<&'a str>,
    time: Option<&'a str>,
    status: Option<&'a str>,
    logs: Vec<&'a LogEntry>,
}

pub fn changes_value(filtered: &[FilteredReport]) -> serde_json::Result<serde_json::Value> {
    let view: Vec<ReportChanges> = filtered
        .iter()
        .filter(|f| !f.resources.is_empty())
        .map(|f| ReportChanges {
            source: &f.report.source,
            host: f.report.host.as_deref(),
            time: f.report.time.as_deref(),
            status: f.report.status.as_deref(),
            configuration_version: f.report.configuration_version.as_deref(),
            report_format: f.report.report_format.as_deref(),
            resources: &f.resources,
        })
        .collect();
    serde_json::to_value(&view)
}

pub fn logs_value(reports: &[&ReportRecord]) -> serde_json::Result<serde_json::Value> {
    let view: Vec<ReportLogs> = reports
        .iter()
        .filter(|r| r.is_status("changed"))
        .map(|r| ReportLogs { source: &r.source, host: r.host.as_deref(), time: r.time.as_deref(), status: r.status.as_deref(), logs: visible_logs(r) })
        .filter(|v| !v.logs.is_empty())
        .collect();
    serde_json::to_value(&view)
}

pub fn write_csv(path: &Path, filtered: &[FilteredReport]) -> Result<(), std::io::Error> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["host", "time", "status", "resource", "change_count", "failed", "file", "line", "matched_tags"])?;
    for fr in filtered {
        let r = fr.report;
        for q in &fr.resources {
            let st = q.status;
            wtr.write_record([
                r.host_name().to_string(),
                r.time.clone().unwrap_or_default(),
                r.status.clone().unwrap_or_default(),
                q.key.to_string(),
                st.change_count.map(|n| n.to_string()).unwrap_or_default(),
                st.is_failed().to_string(),
                st.file.clone().unwrap_or_default(),
                st.line.map(|n| n.to_string()).unwrap_or_default(),
                q.matched_tags.join(" "),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ResourceFilter;
    use crate::indexer::{HostIndexEntry, ReportFile};
    use crate::report::{fixtures, parse_report};
    use crate::tags::TagFilter;

    fn rec(host: &str, time: &str, status: &str) -> ReportRecord { parse_report(&fixtures::report_yaml(host, time, status)).unwrap() }

    #[test]
    fn changes_block_lists_qualifying_resources() {
        let r = rec("web1", "2024-01-02 00:00:00 +00:00", "changed");
        let filtered = vec![ResourceFilter::default().filter_report(&r)];
        let out = render_changes(&filtered, RenderOptions::default());
        assert!(out.starts_with("\nReport(4): web1  2024-01-02 00:00:00 +00:00  Config:1704153600  changed\n"));
        assert!(out.contains("\tService[app]  change_count: 1  events: [ensure: stopped -> running (success)]\n"));
        assert!(out.contains("\tService[worker]  failed: true  change_count: 0\n"));
        assert!(!out.contains("File[/etc/motd]"));
        assert!(!out.contains("environment_notice"));
    }

    #[test]
    fn verbose_adds_attributes_and_matched_tags() {
        let r = rec("web1", "2024-01-02 00:00:00 +00:00", "changed");
        let f = ResourceFilter { tags: TagFilter::new(Some("deploy"), None).unwrap(), ..Default::default() };
        let out = render_changes(&[f.filter_report(&r)], RenderOptions { verbose: true, color: false });
        assert!(out.contains("\tpuppet 3.8.7  environment production  kind apply  failed 1\n"));
        assert!(out.contains("resource: Service[app]"));
        assert!(out.contains("line: 12"));
        assert!(out.contains("tags matched: app::deploy"));
    }

    #[test]
    fn empty_reports_are_suppressed() {
        let r = rec("web1", "2024-01-02 00:00:00 +00:00", "changed");
        let f = ResourceFilter { tags: TagFilter::new(Some("network"), None).unwrap(), ..Default::default() };
        assert_eq!(render_changes(&[f.filter_report(&r)], RenderOptions::default()), "");
        assert_eq!(changes_value(&[f.filter_report(&r)]).unwrap(), serde_json::json!([]));
    }

    #[test]
    fn chronological_then_host() {
        let recs = vec![
            rec("web2", "2024-01-02 00:00:00 +00:00", "changed"),
            rec("web1", "2024-01-02 00:00:00 +00:00", "changed"),
            rec("db1", "2024-01-01 23:00:00 -02:00", "changed"),
        ];
        let hosts: Vec<&str> = order_reports(&recs, RenderOrder::Chronological).iter().map(|r| r.host_name()).collect();
        assert_eq!(hosts, vec!["web1", "web2", "db1"]);
        let kept: Vec<&str> = order_reports(&recs, RenderOrder::Preserve).iter().map(|r| r.host_name()).collect();
        assert_eq!(kept, vec!["web2", "web1", "db1"]);
    }

    #[test]
    fn logs_drop_debug_and_unchanged_reports() {
        let changed = rec("web1", "2024-01-02 00:00:00 +00:00", "changed");
        let steady = rec("web2", "2024-01-02 00:00:00 +00:00", "unchanged");
        let out = render_logs(&[&changed, &steady], RenderOptions::default());
        assert!(out.starts_with("\nReport: web1  2024-01-02 00:00:00 +00:00  changed\n"));
        assert!(out.contains("\t[notice] 2024-01-02 00:00:00 +00:00: ensure changed 'stopped' to 'running'\n"));
        assert!(out.contains("[err]"));
        assert!(!out.contains("[debug]"));
        assert!(!out.contains("web2"));
    }

    #[test]
    fn logs_suppressed_when_only_debug() {
        let mut r = rec("web1", "2024-01-02 00:00:00 +00:00", "changed");
        r.logs.retain(|l| l.severity() == Some(LogLevel::Debug));
        assert_eq!(render_logs(&[&r], RenderOptions::default()), "");
        assert_eq!(logs_value(&[&r]).unwrap(), serde_json::json!([]));
    }

    #[test]
    fn rendering_is_idempotent() {
        let recs = vec![rec("web2", "2024-01-02 01:00:00 +00:00", "changed"), rec("web1", "2024-01-02 00:00:00 +00:00", "failed")];
        let ordered = order_reports(&recs, RenderOrder::Chronological);
        let filtered = ResourceFilter::default().filter_reports(&ordered);
        let opts = RenderOptions { verbose: true, color: true };
        assert_eq!(render_changes(&filtered, opts), render_changes(&filtered, opts));
        assert_eq!(render_logs(&ordered, opts), render_logs(&ordered, opts));
        assert_eq!(changes_value(&filtered).unwrap(), changes_value(&filtered).unwrap());
    }

    #[test]
    fn host_index_listing() {
        let index = FileIndex {
            root: "/r".into(),
            files: vec![],
            hosts: vec![
                HostIndexEntry { host: "web1".into(), latest_report: Some(ReportFile { path: "/r/web1/202401020000.yaml".into(), host: "web1".into(), timestamp_key: "202401020000".into() }) },
                HostIndexEntry { host: "web2".into(), latest_report: None },
            ],
        };
        let lines = render_host_index(&index, false);
        assert_eq!(lines, "Found the following host entries:\n\t  0: web1  /r/web1/202401020000.yaml\n\t  1: web2  -\n");
        let table = render_host_index(&index, true);
        assert!(table.contains("Latest report"));
        assert!(table.contains("web2"));
    }

    #[test]
    fn csv_has_one_row_per_resource() {
        let r = rec("web1", "2024-01-02 00:00:00 +00:00", "changed");
        let filtered = vec![ResourceFilter::default().filter_report(&r)];
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("changes.csv");
        write_csv(&p, &filtered).unwrap();
        let data = std::fs::read_to_string(&p).unwrap();
        assert_eq!(data.lines().count(), 3);
        assert!(data.lines().next().unwrap().starts_with("host,time,status,resource"));
        assert!(data.contains("Service[worker]"));
    }
}
