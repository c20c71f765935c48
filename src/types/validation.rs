use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Basic,
    #[default]
    Standard,
    Strict,
    Paranoid,
}

impl Strictness {
    /// Strict and paranoid validation escalate security findings and enable
    /// the import allow-list and style checks.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Strictness::Strict | Strictness::Paranoid)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Strictness::Basic => "basic",
            Strictness::Standard => "standard",
            Strictness::Strict => "strict",
            Strictness::Paranoid => "paranoid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown strictness '{0}'")]
pub struct UnknownStrictness(pub String);

impl FromStr for Strictness {
    type Err = UnknownStrictness;

    /// Case-insensitive.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "basic" => Ok(Strictness::Basic),
            "standard" => Ok(Strictness::Standard),
            "strict" => Ok(Strictness::Strict),
            "paranoid" => Ok(Strictness::Paranoid),
            _ => Err(UnknownStrictness(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn penalty(&self) -> u8 {
        match self {
            Severity::Error => 25,
            Severity::Warning => 10,
            Severity::Info => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Security,
    Performance,
    Correctness,
    Style,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    Passed,
    Warning,
    Failed,
    Blocked,
}

impl ValidationVerdict {
    /// Whether code with this verdict may proceed to execution.
    pub fn allows_execution(&self) -> bool {
        matches!(self, ValidationVerdict::Passed | ValidationVerdict::Warning)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub code: String,
    pub message: String,
    pub line: Option<usize>,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn new(
        severity: Severity,
        category: IssueCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            code: code.into(),
            message: message.into(),
            line: None,
            suggestion: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Per-category scores, each in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScores {
    pub security: u8,
    pub performance: u8,
    pub correctness: u8,
    pub style: u8,
}

impl Default for CategoryScores {
    fn default() -> Self {
        Self {
            security: 100,
            performance: 100,
            correctness: 100,
            style: 100,
        }
    }
}

impl CategoryScores {
    pub fn from_issues(issues: &[ValidationIssue]) -> Self {
        let mut scores = Self::default();
        for issue in issues {
            let slot = scores.get_mut(issue.category);
            *slot = slot.saturating_sub(issue.severity.penalty());
        }
        scores
    }

    pub fn get(&self, category: IssueCategory) -> u8 {
        match category {
            IssueCategory::Security => self.security,
            IssueCategory::Performance => self.performance,
            IssueCategory::Correctness => self.correctness,
            IssueCategory::Style => self.style,
        }
    }

    fn get_mut(&mut self, category: IssueCategory) -> &mut u8 {
        match category {
            IssueCategory::Security => &mut self.security,
            IssueCategory::Performance => &mut self.performance,
            IssueCategory::Correctness => &mut self.correctness,
            IssueCategory::Style => &mut self.style,
        }
    }

    pub fn overall(&self) -> f32 {
        (self.security as f32 + self.performance as f32 + self.correctness as f32 + self.style as f32)
            / 4.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub handler_name: String,
    pub strictness: Strictness,
    pub verdict: ValidationVerdict,
    pub issues: Vec<ValidationIssue>,
    pub scores: CategoryScores,
    pub overall_score: f32,
    pub content_hash: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn issues_in(&self, category: IssueCategory) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.category == category)
    }

    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary {
            verdict: self.verdict,
            overall_score: self.overall_score,
            error_count: self.count(Severity::Error),
            warning_count: self.count(Severity::Warning),
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Compact form of a report attached to execution results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub verdict: ValidationVerdict,
    pub overall_score: f32,
    pub error_count: usize,
    pub warning_count: usize,
    pub content_hash: String,
}
