//! Prohibited-keyword filter.
//!
//! The lexicon itself is maintained externally; this module only loads
//! `config/ng_keywords.json` and strips matches from product text before
//! it reaches the store.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize)]
struct NgKeywordFile {
    keywords: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NgKeywordFilter {
    keywords: Vec<String>,
}

impl NgKeywordFilter {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    /// Load the lexicon from `config/ng_keywords.json`. A missing file is
    /// not an error: the filter runs empty and passes text through.
    pub fn load(config_dir: &Path) -> Self {
        let path: PathBuf = config_dir.join("ng_keywords.json");
        match Self::load_file(&path) {
            Ok(filter) => filter,
            Err(e) => {
                warn!("NG keyword lexicon unavailable ({}): {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let file: NgKeywordFile =
            serde_json::from_str(&raw).context("parse ng_keywords.json")?;
        Ok(Self::new(file.keywords))
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Remove every prohibited keyword from `text`. Returns the cleaned
    /// text and the keywords that were actually removed.
    pub fn clean(&self, text: &str) -> (String, Vec<String>) {
        let mut cleaned = text.to_string();
        let mut removed = Vec::new();

        for keyword in &self.keywords {
            if keyword.is_empty() {
                continue;
            }
            if cleaned.contains(keyword.as_str()) {
                cleaned = cleaned.replace(keyword.as_str(), "");
                removed.push(keyword.clone());
            }
        }

        if !removed.is_empty() {
            // Collapse the double spaces left behind by removals
            while cleaned.contains("  ") {
                cleaned = cleaned.replace("  ", " ");
            }
            cleaned = cleaned.trim().to_string();
        }

        (cleaned, removed)
    }

    /// Clean an optional text field in place, reporting removed keywords.
    pub fn clean_opt(&self, text: &mut Option<String>) -> Vec<String> {
        if let Some(t) = text.as_ref() {
            let (cleaned, removed) = self.clean(t);
            if !removed.is_empty() {
                *text = Some(cleaned);
            }
            removed
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_keywords_and_reports_them() {
        let filter = NgKeywordFilter::new(vec!["forbidden".into(), "banned".into()]);
        let (cleaned, removed) = filter.clean("a forbidden word and a banned one");
        assert!(!cleaned.contains("forbidden"));
        assert!(!cleaned.contains("banned"));
        assert_eq!(removed.len(), 2);
    }

    #[test]
    fn untouched_text_reports_nothing() {
        let filter = NgKeywordFilter::new(vec!["forbidden".into()]);
        let (cleaned, removed) = filter.clean("all clear");
        assert_eq!(cleaned, "all clear");
        assert!(removed.is_empty());
    }

    #[test]
    fn empty_filter_passes_through() {
        let filter = NgKeywordFilter::default();
        let mut text = Some("anything".to_string());
        assert!(filter.clean_opt(&mut text).is_empty());
        assert_eq!(text.as_deref(), Some("anything"));
    }
}
