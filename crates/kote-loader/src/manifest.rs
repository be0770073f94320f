//! Module manifest parsing and validation.
//!
//! A script's leading `//!` block is its documentation. It may embed a
//! `<manifest>…</manifest>` section of `key: value` lines; everything
//! else in the block is the module description.
//!
//! ```text
//! //! <manifest>
//! //! version: 1.0.3
//! //! source: https://example.org/modules/ping.rhai
//! //! author: Kote
//! //! </manifest>
//! //!
//! //! Replies with pong.
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

const OPEN_TAG: &str = "<manifest>";
const CLOSE_TAG: &str = "</manifest>";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleManifest {
    pub description: String,
    pub version: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    /// Any other manifest keys, lower-cased.
    pub extra: BTreeMap<String, String>,
}

impl ModuleManifest {
    /// Parse the leading documentation block of a script.
    pub fn parse(source: &str) -> Self {
        Self::from_doc(&leading_doc(source))
    }

    /// Parse an already extracted documentation block.
    pub fn from_doc(doc: &str) -> Self {
        let mut manifest = ModuleManifest::default();

        let (block, description) = match (doc.find(OPEN_TAG), doc.find(CLOSE_TAG)) {
            (Some(start), Some(end)) if end > start => {
                let block = &doc[start + OPEN_TAG.len()..end];
                let rest = format!("{}{}", &doc[..start], &doc[end + CLOSE_TAG.len()..]);
                (Some(block.to_string()), rest)
            }
            _ => (None, doc.to_string()),
        };
        manifest.description = description.trim().to_string();

        for line in block.iter().flat_map(|b| b.lines()) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            match key.as_str() {
                "version" => manifest.version = Some(value),
                "source" => manifest.source = Some(value),
                "author" => manifest.author = Some(value),
                _ => {
                    manifest.extra.insert(key, value);
                }
            }
        }

        manifest
    }

    /// Validation issues. These are reported as warnings; a module with
    /// a sloppy manifest still loads.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if let Some(version) = &self.version {
            if let Err(issue) = validate_semver(version, "version") {
                issues.push(issue);
            }
        }
        if let Some(source) = &self.source {
            if let Err(issue) = validate_source_url(source) {
                issues.push(issue);
            }
        }
        issues
    }

    /// Human-readable card used by `minfo` and the inline module view.
    pub fn render(&self, name: &str) -> String {
        let mut out = format!("📦 {name}");
        out.push_str(&format!(
            "\nversion: {}",
            self.version.as_deref().unwrap_or("N/A")
        ));
        out.push_str(&format!(
            "\nauthor: {}",
            self.author.as_deref().unwrap_or("unknown")
        ));
        if let Some(source) = &self.source {
            out.push_str(&format!("\nsource: {source}"));
        }
        out.push_str("\n\n");
        if self.description.is_empty() {
            out.push_str("No description.");
        } else {
            out.push_str(&self.description);
        }
        out
    }
}

/// Collect the leading `//!` lines of a script, markers stripped.
pub fn leading_doc(source: &str) -> String {
    source
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .map_while(|line| line.trim_start().strip_prefix("//!"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Validation helpers ─────────────────────────────────────────────

fn validate_semver(value: &str, field_name: &str) -> Result<(), String> {
    semver::Version::parse(value)
        .map(|_| ())
        .map_err(|_| format!("{field_name} is not valid semver: '{value}'"))
}

fn validate_source_url(value: &str) -> Result<(), String> {
    let parsed =
        url::Url::parse(value).map_err(|e| format!("source is not a valid URL: {e}"))?;
    if parsed.scheme() != "https" {
        return Err(format!(
            "source must use https, got '{}'",
            parsed.scheme()
        ));
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────
