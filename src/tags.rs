use regex::Regex;

use crate::error::{ReportError, Result};

#[derive(Clone, Debug)]
pub enum TagFilter {
    Any,
    Include(Regex),
    Exclude(Regex),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagMatch {
    pub passed: bool,
    /// Tags that satisfied an include pattern.
    pub matched: Vec<String>,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ReportError::InvalidFilter { clause: pattern.to_string(), details: e.to_string() })
}

impl TagFilter {
    /// Include and exclude are meant to be exclusive; if both arrive the include pattern is used.
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        match (include, exclude) {
            (Some(inc), ex) => {
                if ex.is_some() { log::warn!("Both include and exclude tag patterns given; using include '{}'", inc); }
                Ok(TagFilter::Include(compile(inc)?))
            }
            (None, Some(ex)) => Ok(TagFilter::Exclude(compile(ex)?)),
            (None, None) => Ok(TagFilter::Any),
        }
    }

    pub fn check(&self, tags: &[String]) -> TagMatch {
        match self {
            TagFilter::Any => TagMatch { passed: true, matched: vec![] },
            TagFilter::Include(re) => {
                let matched: Vec<String> = tags.iter().filter(|t| re.is_match(t)).cloned().collect();
                TagMatch { passed: !matched.is_empty(), matched }
            }
            TagFilter::Exclude(re) => {
                let vetoed = tags.iter().find(|t| re.is_match(t));
                if let Some(t) = vetoed { log::trace!("Tag '{}' excludes resource", t); }
                TagMatch { passed: vetoed.is_none(), matched: vec![] }
            }
        }
    }
}
