use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{parser, rules, ValidationSettings};
use crate::storage::StateStore;
use crate::types::{
    CategoryScores, IssueCategory, Severity, Strictness, ValidationIssue, ValidationReport,
    ValidationVerdict,
};

const CACHE_PREFIX: &str = "validation";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Static analysis gate for submitted handler source.
pub struct CodeValidator {
    store: Arc<dyn StateStore>,
    settings: ValidationSettings,
    cached_keys: tokio::sync::Mutex<HashSet<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

pub fn content_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

fn decide_verdict(issues: &[ValidationIssue], strictness: Strictness) -> ValidationVerdict {
    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    let warnings = issues.iter().filter(|i| i.severity == Severity::Warning).count();

    if errors > 0 {
        return ValidationVerdict::Failed;
    }
    if warnings == 0 {
        return ValidationVerdict::Passed;
    }
    match strictness {
        Strictness::Paranoid => ValidationVerdict::Blocked,
        Strictness::Strict if warnings > 3 => ValidationVerdict::Blocked,
        _ => ValidationVerdict::Warning,
    }
}

fn build_report(
    name: &str,
    strictness: Strictness,
    content_hash: String,
    issues: Vec<ValidationIssue>,
    verdict: ValidationVerdict,
) -> ValidationReport {
    let scores = CategoryScores::from_issues(&issues);
    ValidationReport {
        handler_name: name.to_string(),
        strictness,
        verdict,
        overall_score: scores.overall(),
        scores,
        issues,
        content_hash,
        validated_at: Utc::now(),
    }
}

/// Report for a submission that could not be analysed at all.
pub fn failure_report(
    name: &str,
    strictness: Strictness,
    content_hash: String,
    code: &str,
    message: String,
    line: Option<usize>,
) -> ValidationReport {
    let mut issue = ValidationIssue::new(Severity::Error, IssueCategory::Correctness, code, message);
    issue.line = line;
    build_report(
        name,
        strictness,
        content_hash,
        vec![issue],
        ValidationVerdict::Failed,
    )
}

impl CodeValidator {
    pub fn new(store: Arc<dyn StateStore>, settings: ValidationSettings) -> Self {
        Self {
            store,
            settings,
            cached_keys: tokio::sync::Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    fn cache_key(hash: &str, strictness: Strictness) -> String {
        format!("{}:{}:{}", CACHE_PREFIX, hash, strictness.as_str())
    }

    /// Validates `source`, serving identical submissions from the cache
    /// while their report is younger than the cache TTL.
    pub async fn validate(
        &self,
        source: &str,
        name: &str,
        strictness: Strictness,
    ) -> Result<ValidationReport> {
        let hash = content_hash(source);
        let key = Self::cache_key(&hash, strictness);

        if let Some(cached) = self.store.get(&key).await? {
            match serde_json::from_value::<ValidationReport>(cached) {
                Ok(report) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Validation cache hit for '{}' ({})", name, &hash[..12]);
                    return Ok(report);
                }
                Err(e) => log::warn!("Discarding unreadable cached report {}: {}", key, e),
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let report = self.analyze(source, name, strictness);

        let ttl = Duration::from_secs(self.settings.cache_ttl_secs);
        self.store
            .set(&key, serde_json::to_value(&report)?, Some(ttl))
            .await?;
        self.cached_keys.lock().await.insert(key);

        Ok(report)
    }

    /// Runs the full rule set without consulting the cache.
    pub fn analyze(&self, source: &str, name: &str, strictness: Strictness) -> ValidationReport {
        let hash = content_hash(source);

        let parsed = match parser::parse(source) {
            Ok(parsed) => parsed,
            Err(e) => {
                return failure_report(
                    name,
                    strictness,
                    hash,
                    "syntax-error",
                    format!("Syntax error: {}", e.message),
                    Some(e.line),
                );
            }
        };

        let mut issues = rules::check_security(&parsed, strictness);
        issues.extend(rules::check_performance(&parsed, &self.settings));
        issues.extend(rules::check_correctness(&parsed, strictness));
        issues.extend(rules::check_style(source, &parsed, strictness, &self.settings));

        let verdict = decide_verdict(&issues, strictness);
        build_report(name, strictness, hash, issues, verdict)
    }

    /// Validates many handlers concurrently. A validation that errors or
    /// panics yields a synthetic `failed` report for that name only.
    pub async fn validate_batch(
        self: &Arc<Self>,
        sources: HashMap<String, String>,
        strictness: Strictness,
    ) -> HashMap<String, ValidationReport> {
        let tasks = sources.into_iter().map(|(name, source)| {
            let validator = Arc::clone(self);
            async move {
                let hash = content_hash(&source);
                let task_name = name.clone();
                let handle = tokio::spawn(async move {
                    validator.validate(&source, &task_name, strictness).await
                });

                let report = match handle.await {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => failure_report(
                        &name,
                        strictness,
                        hash,
                        "validation-error",
                        format!("Validation failed: {}", e),
                        None,
                    ),
                    Err(e) => failure_report(
                        &name,
                        strictness,
                        hash,
                        "validation-error",
                        format!("Validation task aborted: {}", e),
                        None,
                    ),
                };
                (name, report)
            }
        });

        join_all(tasks).await.into_iter().collect()
    }

    /// Drops every report this validator cached. Returns how many were live.
    pub async fn clear_cache(&self) -> Result<usize> {
        let keys: Vec<String> = self.cached_keys.lock().await.drain().collect();
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
