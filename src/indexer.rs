use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use globset::GlobBuilder;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{ReportError, Result};

pub const DEFAULT_ARCHIVE_DIR: &str = "archive";

fn report_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]{12})\.yaml\z").expect("report name pattern"))
}

/// Extracts the 12-digit `YYYYMMDDHHMM` key that must immediately precede `.yaml`.
pub fn timestamp_key(file_name: &str) -> Option<String> {
    report_name_re().captures(file_name).map(|c| c[1].to_string())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportFile {
    pub path: PathBuf,
    /// First path component under the root; empty for files sitting directly in the root.
    pub host: String,
    pub timestamp_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostIndexEntry {
    pub host: String,
    pub latest_report: Option<ReportFile>,
}

#[derive(Clone, Debug)]
pub struct FileIndex {
    pub root: PathBuf,
    /// Every matching report, ascending by path.
    pub files: Vec<ReportFile>,
    /// One entry per immediate subdirectory of the root, ascending by name.
    pub hosts: Vec<HostIndexEntry>,
}

fn is_newer(candidate: &ReportFile, current: &ReportFile) -> bool {
    (&candidate.timestamp_key, &candidate.path) > (&current.timestamp_key, &current.path)
}

fn host_of(root: &Path, path: &Path) -> String {
    let rel = match path.strip_prefix(root) { Ok(r) => r, Err(_) => return String::new() };
    let comps: Vec<Component> = rel.components().collect();
    if comps.len() < 2 { return String::new(); }
    comps[0].as_os_str().to_string_lossy().into_owned()
}

/// Walks `root` and indexes every report file, skipping any directory named `archive_dir`.
pub fn index_reports(root: &Path, archive_dir: &str) -> Result<FileIndex> {
    if !root.is_dir() { return Err(ReportError::InvalidDirectory { path: root.to_path_buf() }); }
    let mut latest: BTreeMap<String, Option<ReportFile>> = BTreeMap::new();
    let rd = std::fs::read_dir(root).map_err(|source| ReportError::Io { path: root.to_path_buf(), source })?;
    for de in rd.filter_map(|r| r.ok()) {
        let is_dir = de.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let name = de.file_name().to_string_lossy().into_owned();
        if is_dir && name != archive_dir { latest.insert(name, None); }
    }

    let mut files: Vec<ReportFile> = vec![];
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && e.file_name() == archive_dir));
    for de in walker {
        let de = match de { Ok(d) => d, Err(e) => { log::warn!("Skipping unreadable entry under {}: {}", root.display(), e); continue } };
        if !de.file_type().is_file() { continue; }
        let name = de.file_name().to_string_lossy();
        let Some(key) = timestamp_key(&name) else { continue };
        let path = de.path().to_path_buf();
        let host = host_of(root, &path);
        let file = ReportFile { path, host, timestamp_key: key };
        if !file.host.is_empty() {
            let slot = latest.entry(file.host.clone()).or_insert(None);
            let replace = match slot.as_ref() { Some(cur) => is_newer(&file, cur), None => true };
            if replace { *slot = Some(file.clone()); }
        }
        files.push(file);
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let hosts = latest.into_iter().map(|(host, latest_report)| HostIndexEntry { host, latest_report }).collect();
    log::debug!("Indexed {} report files under {}", files.len(), root.display());
    Ok(FileIndex { root: root.to_path_buf(), files, hosts })
}

impl FileIndex {
    pub fn host_names(&self) -> Vec<&str> { self.hosts.iter().map(|h| h.host.as_str()).collect() }

    pub fn latest_for(&self, host: &str) -> Option<&ReportFile> {
        self.hosts.iter().find(|h| h.host == host).and_then(|h| h.latest_report.as_ref())
    }

    pub fn files_for_host(&self, host: &str) -> Vec<ReportFile> {
        self.files.iter().filter(|f| f.host == host).cloned().collect()
    }

    /// Resolves a host selector: `all`, an exact host name, a position in the host listing, or a glob.
    pub fn select(&self, selector: Option<&str>) -> Result<Vec<ReportFile>> {
        let sel = match selector.map(str::trim) {
            None | Some("all") => return Ok(self.files.clone()),
            Some(s) => s,
        };
        let invalid = |details: &str| ReportError::InvalidSelection { selector: sel.to_string(), details: details.to_string() };
        if sel.is_empty() { return Err(invalid("empty host selector")); }
        if self.hosts.iter().any(|h| h.host == sel) { return Ok(self.files_for_host(sel)); }
        if let Ok(i) = sel.parse::<usize>() {
            return match self.hosts.get(i) {
                Some(h) => Ok(self.files_for_host(&h.host)),
                None => Err(invalid(&format!("index out of range (0..{})", self.hosts.len()))),
            };
        }
        if sel.contains(['*', '?', '[']) {
            let glob = GlobBuilder::new(sel).literal_separator(true).build().map_err(|e| invalid(&e.to_string()))?;
            let m = glob.compile_matcher();
            let picked: Vec<&str> = self.host_names().into_iter().filter(|h| m.is_match(h)).collect();
            if picked.is_empty() { return Err(invalid("pattern matches no host")); }
            return Ok(self.files.iter().filter(|f| picked.contains(&f.host.as_str())).cloned().collect());
        }
        Err(invalid("no such host"))
    }
}
