//! Protocol parsing: free text to validated eligibility criteria.
//!
//! The parser delegates clause segmentation to an [`ExtractionService`],
//! then maps each proposed clause onto the criteria tree, validating it
//! against the attribute schema. Clauses that fail validation are dropped
//! and recorded as [`UnparsedClause`] diagnostics; the parse itself only
//! fails when the extraction call fails. The result is always a usable,
//! possibly incomplete, criteria set.

use crate::criteria::{ComparisonOp, CriteriaAst, CriteriaError, CriterionNode, CriterionValue};
use crate::extract::{
    ClauseKind, ClauseOp, ClauseValue, ExtractedClause, ExtractionError, ExtractionService,
};
use crate::schema::AttributeSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Parser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Budget for the single extraction-service call
    pub extraction_timeout: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            extraction_timeout: Duration::from_secs(30),
        }
    }
}

/// Protocol metadata recovered from the raw text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSummary {
    pub title: String,
    pub synopsis: String,
    pub sample_size: Option<usize>,
    pub primary_endpoint: Option<String>,
}

impl ProtocolSummary {
    /// Heuristic metadata recovery: first short line as title, leading lines
    /// as synopsis, `n=...` sample size, `Primary endpoint: ...` marker.
    pub fn from_text(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        let (title, synopsis) = match lines.first() {
            Some(first) if first.split_whitespace().count() <= 10 => (
                first.to_string(),
                lines.iter().skip(1).take(4).copied().collect::<Vec<_>>().join("\n"),
            ),
            Some(_) => (
                String::new(),
                lines.iter().take(4).copied().collect::<Vec<_>>().join("\n"),
            ),
            None => (String::new(), String::new()),
        };

        let sample_size = Regex::new(r"(?i)(?:sample\s+size|\bn\s*=\s*)\D*?(\d{2,6})")
            .expect("static regex")
            .captures(text)
            .and_then(|c| c[1].parse().ok());

        let primary_endpoint = Regex::new(r"(?i)primary\s+(?:endpoint|outcome)s?\s*[:\-]\s*(.+)")
            .expect("static regex")
            .captures(text)
            .map(|c| c[1].lines().next().unwrap_or("").trim().to_string())
            .filter(|s| !s.is_empty());

        let synopsis = if synopsis.is_empty() {
            text.chars().take(400).collect()
        } else {
            synopsis
        };

        Self {
            title: if title.is_empty() {
                "Protocol (unspecified title)".to_string()
            } else {
                title
            },
            synopsis,
            sample_size,
            primary_endpoint,
        }
    }
}

/// A clause the parser had to drop, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnparsedClause {
    pub text: String,
    pub kind: ClauseKind,
    pub reason: String,
}

/// Full parse result: metadata, validated criteria, dropped-clause diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedProtocol {
    pub summary: ProtocolSummary,
    pub criteria: CriteriaAst,
    pub diagnostics: Vec<UnparsedClause>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("extraction service timed out after {timeout:?}")]
    ExtractionTimeout { timeout: Duration },

    #[error("extraction service failed: {message}")]
    Extraction { message: String },

    #[error("criteria assembly failed: {0}")]
    Criteria(#[from] CriteriaError),
}

/// Parse protocol text into a validated criteria set.
///
/// The extraction service is invoked exactly once; a timeout is fatal to
/// the parse and retrying is the caller's decision. Given identical
/// extraction output the result is structurally identical across calls.
pub fn parse_protocol(
    text: &str,
    service: &dyn ExtractionService,
    schema: &AttributeSchema,
    config: &ParserConfig,
) -> Result<ParsedProtocol, ParseError> {
    let summary = ProtocolSummary::from_text(text);

    let clauses = service
        .extract(text, schema, config.extraction_timeout)
        .map_err(|e| match e {
            ExtractionError::Timeout(timeout) => ParseError::ExtractionTimeout { timeout },
            ExtractionError::Backend(message) => ParseError::Extraction { message },
        })?;
    debug!(
        backend = service.name(),
        clauses = clauses.len(),
        "extraction complete"
    );

    let mut inclusion = Vec::new();
    let mut exclusion = Vec::new();
    let mut diagnostics = Vec::new();

    for clause in clauses {
        match clause_to_node(&clause, schema) {
            Ok(node) => match clause.kind {
                ClauseKind::Inclusion => inclusion.push(node),
                ClauseKind::Exclusion => exclusion.push(node),
            },
            Err(reason) => {
                warn!(clause = %clause.text, %reason, "dropping clause");
                diagnostics.push(UnparsedClause {
                    text: clause.text,
                    kind: clause.kind,
                    reason,
                });
            }
        }
    }

    let criteria = assemble(inclusion, exclusion, schema)?;

    Ok(ParsedProtocol {
        summary,
        criteria,
        diagnostics,
    })
}

/// Inclusions under an `And` root; exclusions under `Not(Or(..))`, combined
/// with the inclusion group via `And`. No valid clauses at all yields the
/// accept-all criteria set.
fn assemble(
    inclusion: Vec<CriterionNode>,
    exclusion: Vec<CriterionNode>,
    schema: &AttributeSchema,
) -> Result<CriteriaAst, ParseError> {
    let mut children = inclusion;
    if !exclusion.is_empty() {
        children.push(CriterionNode::not(
            "no exclusion criterion met",
            CriterionNode::or("any exclusion criterion", exclusion),
        ));
    }
    if children.is_empty() {
        return Ok(CriteriaAst::accept_all());
    }
    let root = CriterionNode::and("eligibility criteria", children);
    Ok(CriteriaAst::new(root, schema)?)
}

/// Map one extracted clause to a leaf node, validating it against the schema
fn clause_to_node(clause: &ExtractedClause, schema: &AttributeSchema) -> Result<CriterionNode, String> {
    let node = match (&clause.op, &clause.value) {
        (ClauseOp::In, ClauseValue::Set(set)) => {
            CriterionNode::membership(&clause.text, &clause.attribute, set.clone())
        }
        (ClauseOp::In, _) => {
            return Err("membership operator requires a set value".to_string());
        }
        (ClauseOp::Between, ClauseValue::Range(lo, hi)) => CriterionNode::comparison(
            &clause.text,
            &clause.attribute,
            ComparisonOp::Between,
            CriterionValue::Range(*lo, *hi),
        ),
        (ClauseOp::Between, _) => {
            return Err("between operator requires a range value".to_string());
        }
        (op, value) => {
            let op = match op {
                ClauseOp::Lt => ComparisonOp::Lt,
                ClauseOp::Le => ComparisonOp::Le,
                ClauseOp::Gt => ComparisonOp::Gt,
                ClauseOp::Ge => ComparisonOp::Ge,
                ClauseOp::Eq => ComparisonOp::Eq,
                ClauseOp::Ne => ComparisonOp::Ne,
                ClauseOp::Between | ClauseOp::In => unreachable!("handled above"),
            };
            let value = match value {
                ClauseValue::Number(n) => CriterionValue::Number(*n),
                ClauseValue::Text(t) => CriterionValue::Text(t.clone()),
                ClauseValue::Flag(b) => CriterionValue::Flag(*b),
                ClauseValue::Range(_, _) | ClauseValue::Set(_) => {
                    return Err(format!("operator {} cannot take a compound value", op));
                }
            };
            CriterionNode::comparison(&clause.text, &clause.attribute, op, value)
        }
    };

    // Leaf-level schema validation, reusing the AST validator
    CriteriaAst::new(node.clone(), schema).map_err(|e| e.to_string())?;
    Ok(node)
}
