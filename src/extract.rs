//! Extraction collaborator contract.
//!
//! Turning free protocol text into candidate criterion clauses is delegated
//! to an [`ExtractionService`]. The service is an opaque capability: the
//! parser invokes it exactly once per protocol text and treats malformed
//! clauses as diagnostics, never as crashes. LLM-backed implementations
//! live outside this crate; [`RuleBasedExtractor`] is the deterministic
//! in-crate reference backend.

use crate::schema::AttributeSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Whether a clause narrows who may enroll or who must be excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseKind {
    Inclusion,
    Exclusion,
}

/// Operator proposed by the extraction backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Between,
    In,
}

/// Value proposed by the extraction backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClauseValue {
    Number(f64),
    Text(String),
    Flag(bool),
    Range(f64, f64),
    Set(Vec<String>),
}

/// One candidate criterion clause, as segmented by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedClause {
    /// Original clause text, kept for diagnostics
    pub text: String,
    pub attribute: String,
    pub op: ClauseOp,
    pub value: ClauseValue,
    pub kind: ClauseKind,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("extraction backend failure: {0}")]
    Backend(String),
}

/// Capability for segmenting protocol text into criterion clauses.
///
/// Implementations own the blocking call and must honor `timeout`,
/// returning [`ExtractionError::Timeout`] when exceeded. Retrying is the
/// caller's decision; implementations must not retry internally.
pub trait ExtractionService: Send + Sync {
    fn extract(
        &self,
        text: &str,
        schema: &AttributeSchema,
        timeout: Duration,
    ) -> Result<Vec<ExtractedClause>, ExtractionError>;

    fn name(&self) -> &str;
}

/// Deterministic regex-driven extraction backend.
///
/// Conservative by design: it recognizes age ranges, numeric comparisons,
/// set membership, and biomarker-status phrases, and falls back to a
/// boolean flag named after the clause itself. Clauses whose guessed
/// attribute is not in the schema are dropped downstream as diagnostics.
pub struct RuleBasedExtractor {
    inclusion_block: Regex,
    exclusion_block: Regex,
    age_range: Regex,
    comparison: Regex,
    membership: Regex,
    status: Regex,
    negation: Regex,
}

impl RuleBasedExtractor {
    pub fn new() -> Self {
        Self {
            inclusion_block: Regex::new(
                r"(?is)inclusions?(?:\s+criteria)?\s*[:\s]\s*(.+?)(?:exclusions?(?:\s+criteria)?\s*[:\s]|sample\s+size|primary\s+endpoint|\z)",
            )
            .expect("static regex"),
            exclusion_block: Regex::new(
                r"(?is)exclusions?(?:\s+criteria)?\s*[:\s]\s*(.+?)(?:inclusions?(?:\s+criteria)?\s*[:\s]|sample\s+size|primary\s+endpoint|\z)",
            )
            .expect("static regex"),
            age_range: Regex::new(
                r"(?i)age\s*(?:between|from)?\s*(\d{1,3})\s*(?:and|to|-)\s*(\d{1,3})",
            )
            .expect("static regex"),
            comparison: Regex::new(
                r"(?i)([a-z][a-z0-9_]*)\s*(>=|<=|==|!=|>|<|=)\s*(-?\d+(?:\.\d+)?)",
            )
            .expect("static regex"),
            membership: Regex::new(r"(?i)([a-z][a-z0-9_]*)\s+in\s+[\[{(]([^\]})]*)[\]})]")
                .expect("static regex"),
            status: Regex::new(r"(?i)([a-z][a-z0-9_]*?)(?:[_\s]status)?\s+(negative|positive)")
                .expect("static regex"),
            negation: Regex::new(r"(?i)^no\s+([a-z][a-z0-9_\s]*)$").expect("static regex"),
        }
    }

    fn block<'t>(&self, re: &Regex, text: &'t str) -> Option<&'t str> {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Split a criteria block into clause candidates: one per line, then
    /// one per comma/semicolon-separated segment (brackets protected),
    /// bullets stripped.
    fn clause_texts(block: &str) -> Vec<String> {
        fn split_top_level(line: &str) -> Vec<&str> {
            let mut out = Vec::new();
            let mut depth = 0usize;
            let mut start = 0;
            for (i, c) in line.char_indices() {
                match c {
                    '{' | '[' | '(' => depth += 1,
                    '}' | ']' | ')' => depth = depth.saturating_sub(1),
                    ',' | ';' if depth == 0 => {
                        out.push(&line[start..i]);
                        start = i + 1;
                    }
                    _ => {}
                }
            }
            out.push(&line[start..]);
            out
        }

        block
            .lines()
            .flat_map(split_top_level)
            .map(|s| s.trim_matches(|c: char| c.is_whitespace() || "-•*.".contains(c)).to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse_clause(&self, text: &str, kind: ClauseKind) -> Option<ExtractedClause> {
        if let Some(caps) = self.age_range.captures(text) {
            let lo: f64 = caps[1].parse().ok()?;
            let hi: f64 = caps[2].parse().ok()?;
            return Some(ExtractedClause {
                text: text.to_string(),
                attribute: "age".to_string(),
                op: ClauseOp::Between,
                value: ClauseValue::Range(lo, hi),
                kind,
            });
        }

        if let Some(caps) = self.comparison.captures(text) {
            let op = match &caps[2] {
                "<" => ClauseOp::Lt,
                "<=" => ClauseOp::Le,
                ">" => ClauseOp::Gt,
                ">=" => ClauseOp::Ge,
                "!=" => ClauseOp::Ne,
                _ => ClauseOp::Eq,
            };
            let value: f64 = caps[3].parse().ok()?;
            return Some(ExtractedClause {
                text: text.to_string(),
                attribute: caps[1].to_lowercase(),
                op,
                value: ClauseValue::Number(value),
                kind,
            });
        }

        if let Some(caps) = self.membership.captures(text) {
            let set: Vec<String> = caps[2]
                .split(['|', '/', ','])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !set.is_empty() {
                return Some(ExtractedClause {
                    text: text.to_string(),
                    attribute: caps[1].to_lowercase(),
                    op: ClauseOp::In,
                    value: ClauseValue::Set(set),
                    kind,
                });
            }
        }

        if let Some(caps) = self.status.captures(text) {
            return Some(ExtractedClause {
                text: text.to_string(),
                attribute: format!("{}_status", caps[1].to_lowercase()),
                op: ClauseOp::Eq,
                value: ClauseValue::Text(caps[2].to_lowercase()),
                kind,
            });
        }

        if let Some(caps) = self.negation.captures(text) {
            return Some(ExtractedClause {
                text: text.to_string(),
                attribute: slugify(&caps[1]),
                op: ClauseOp::Eq,
                value: ClauseValue::Flag(false),
                kind,
            });
        }

        // Fallback: treat the whole clause as a boolean flag named after it
        let slug = slugify(text);
        if slug.is_empty() {
            return None;
        }
        Some(ExtractedClause {
            text: text.to_string(),
            attribute: slug,
            op: ClauseOp::Eq,
            value: ClauseValue::Flag(true),
            kind,
        })
    }
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionService for RuleBasedExtractor {
    fn extract(
        &self,
        text: &str,
        _schema: &AttributeSchema,
        _timeout: Duration,
    ) -> Result<Vec<ExtractedClause>, ExtractionError> {
        // Purely local and effectively instantaneous; the timeout never binds.
        let mut clauses = Vec::new();

        if let Some(block) = self.block(&self.inclusion_block, text) {
            for clause in Self::clause_texts(block) {
                if let Some(parsed) = self.parse_clause(&clause, ClauseKind::Inclusion) {
                    clauses.push(parsed);
                }
            }
        }
        if let Some(block) = self.block(&self.exclusion_block, text) {
            for clause in Self::clause_texts(block) {
                if let Some(parsed) = self.parse_clause(&clause, ClauseKind::Exclusion) {
                    clauses.push(parsed);
                }
            }
        }

        Ok(clauses)
    }

    fn name(&self) -> &str {
        "rule_based"
    }
}

/// Lowercase, replace non-alphanumerics with underscores, collapse repeats
fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_underscore = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
