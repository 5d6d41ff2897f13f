//! Failure taxonomy, classification and the per-run execution log.
//!
//! Every unrecovered fault observed during a run is recorded as a
//! `FailureRecord`. A user-supplied classifier may override the failure's
//! source label; when the classifier itself misbehaves, a secondary
//! *diagnostic* record is written instead of losing the original failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// User-code exception during a step body.
    Step,
    /// Framework-internal fault.
    Infra,
    /// Registration-time or graph-time problem.
    Validation,
}

/// Who a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureSource {
    UserCode,
    Framework,
    ExternalDep,
}

/// Fine-grained failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    StepError,
    Timeout,
    ValidationError,
    ClassifierError,
    StepNotFound,
    HookError,
    InternalError,
}

/// One recorded failure or diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub source: FailureSource,
    pub reason: FailureReason,
    /// Short human-readable message.
    pub error_message: String,
    /// Step the failure is attributed to, if any.
    pub step: Option<String>,
    /// Rendered error chain, if an error value was available.
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Everything a classifier gets to look at.
#[derive(Debug)]
pub struct FailureClassificationContext<'a> {
    pub error: Option<&'a anyhow::Error>,
    pub kind: FailureKind,
    pub reason: FailureReason,
    pub step: Option<&'a str>,
    pub default_source: FailureSource,
}

/// User-supplied source classifier. Returning `Ok(None)` defers to the
/// built-in rule; returning `Err` is recorded as a diagnostic.
pub type SourceClassifier =
    Arc<dyn Fn(&FailureClassificationContext<'_>) -> anyhow::Result<Option<FailureSource>> + Send + Sync>;

/// Classification configuration attached to a pipeline.
#[derive(Clone, Default)]
pub struct FailureClassificationConfig {
    /// Optional override classifier.
    pub source_classifier: Option<SourceClassifier>,
    /// Extra origin prefixes classified as external dependencies, merged
    /// with the built-in set.
    pub external_dependency_prefixes: Vec<String>,
}

impl std::fmt::Debug for FailureClassificationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureClassificationConfig")
            .field("source_classifier", &self.source_classifier.is_some())
            .field(
                "external_dependency_prefixes",
                &self.external_dependency_prefixes,
            )
            .finish()
    }
}

/// Failures and diagnostics accumulated across one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    pub failures: Vec<FailureRecord>,
    pub diagnostics: Vec<FailureRecord>,
}

/// An error tagged with the namespace it escaped from.
///
/// Wrap an external crate's error in this (anywhere in an `anyhow` chain) so
/// the built-in classifier can attribute the failure to that dependency.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct OriginatedError {
    /// Namespace the error originated in, e.g. `"reqwest::connect"`.
    pub origin: String,
    pub message: String,
}

impl OriginatedError {
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

/// Origin namespaces of well-known external dependencies.
static DEFAULT_EXTERNAL_DEP_PREFIXES: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "reqwest",
        "hyper",
        "sqlx",
        "rusqlite",
        "redis",
        "tokio_postgres",
        "mongodb",
        "lapin",
        "rdkafka",
        "aws_sdk",
        "aws_smithy",
        "openai",
        "async_openai",
        "anthropic",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
});

/// Records failures into an [`ExecutionLog`], resolving the source label
/// through the user classifier and the built-in prefix rule.
#[derive(Debug)]
pub struct FailureJournal {
    config: FailureClassificationConfig,
    external_dep_prefixes: Vec<String>,
}

impl Default for FailureJournal {
    fn default() -> Self {
        Self::new(FailureClassificationConfig::default())
    }
}

impl FailureJournal {
    /// Build a journal; custom prefixes are appended to the built-in set.
    pub fn new(config: FailureClassificationConfig) -> Self {
        let mut prefixes = DEFAULT_EXTERNAL_DEP_PREFIXES.clone();
        prefixes.extend(config.external_dependency_prefixes.iter().cloned());
        Self {
            config,
            external_dep_prefixes: prefixes,
        }
    }

    /// Record one failure, plus a diagnostic if the classifier misbehaved.
    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        &self,
        log: &mut ExecutionLog,
        kind: FailureKind,
        default_source: FailureSource,
        reason: FailureReason,
        error_message: &str,
        step: Option<&str>,
        error: Option<&anyhow::Error>,
    ) {
        let (source, diagnostic) =
            self.resolve_failure_source(error, kind, reason, step, default_source);
        log.failures.push(FailureRecord {
            kind,
            source,
            reason,
            error_message: error_message.to_string(),
            step: step.map(str::to_string),
            error: error.map(|e| format!("{e:#}")),
            at: Utc::now(),
        });
        if let Some(diag) = diagnostic {
            log.diagnostics.push(diag);
        }
    }

    /// Resolve the failure source: user classifier first, built-in rule as
    /// the fallback. A misbehaving classifier yields a diagnostic.
    pub(crate) fn resolve_failure_source(
        &self,
        error: Option<&anyhow::Error>,
        kind: FailureKind,
        reason: FailureReason,
        step: Option<&str>,
        default_source: FailureSource,
    ) -> (FailureSource, Option<FailureRecord>) {
        let builtin = self.classify_builtin(error, default_source);

        let Some(classifier) = &self.config.source_classifier else {
            return (builtin, None);
        };

        let ctx = FailureClassificationContext {
            error,
            kind,
            reason,
            step,
            default_source,
        };
        match classifier(&ctx) {
            Ok(Some(source)) => (source, None),
            Ok(None) => (builtin, None),
            Err(e) => {
                let diagnostic = FailureRecord {
                    kind: FailureKind::Infra,
                    source: FailureSource::Framework,
                    reason: FailureReason::ClassifierError,
                    error_message: "failure source classifier raised".to_string(),
                    step: step.map(str::to_string),
                    error: Some(format!("{e:#}")),
                    at: Utc::now(),
                };
                (builtin, Some(diagnostic))
            }
        }
    }

    /// Built-in rule: errors originating in a known external-dependency
    /// namespace are classified `EXTERNAL_DEP`; everything else keeps the
    /// caller's default.
    pub(crate) fn classify_builtin(
        &self,
        error: Option<&anyhow::Error>,
        default_source: FailureSource,
    ) -> FailureSource {
        let Some(error) = error else {
            return default_source;
        };
        for cause in error.chain() {
            if let Some(originated) = cause.downcast_ref::<OriginatedError>() {
                let origin = originated.origin.as_str();
                let external = self.external_dep_prefixes.iter().any(|p| {
                    origin == p
                        || origin.starts_with(&format!("{p}::"))
                        || origin.starts_with(&format!("{p}."))
                });
                if external {
                    return FailureSource::ExternalDep;
                }
            }
        }
        default_source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn external_error() -> anyhow::Error {
        anyhow::Error::new(OriginatedError::new("reqwest::connect", "connection refused"))
    }

    #[test]
    fn test_default_prefixes_present() {
        let journal = FailureJournal::default();
        assert!(journal.external_dep_prefixes.iter().any(|p| p == "reqwest"));
        assert!(journal.external_dep_prefixes.iter().any(|p| p == "sqlx"));
        assert!(journal.external_dep_prefixes.iter().any(|p| p == "redis"));
        assert!(journal
            .external_dep_prefixes
            .iter()
            .any(|p| p == "tokio_postgres"));
    }

    #[test]
    fn test_custom_prefixes_merge_with_defaults() {
        let journal = FailureJournal::new(FailureClassificationConfig {
            external_dependency_prefixes: vec!["mylib".to_string(), "custom_sdk".to_string()],
            ..Default::default()
        });
        assert!(journal.external_dep_prefixes.iter().any(|p| p == "reqwest"));
        assert!(journal.external_dep_prefixes.iter().any(|p| p == "mylib"));
        assert!(journal
            .external_dep_prefixes
            .iter()
            .any(|p| p == "custom_sdk"));
    }

    #[test]
    fn test_builtin_external_dep_origin() {
        let journal = FailureJournal::default();
        let err = external_error();
        assert_eq!(
            journal.classify_builtin(Some(&err), FailureSource::UserCode),
            FailureSource::ExternalDep
        );
    }

    #[test]
    fn test_builtin_none_error_keeps_default() {
        let journal = FailureJournal::default();
        assert_eq!(
            journal.classify_builtin(None, FailureSource::Framework),
            FailureSource::Framework
        );
    }

    #[test]
    fn test_builtin_plain_error_keeps_default() {
        let journal = FailureJournal::default();
        let err = anyhow!("bad value");
        assert_eq!(
            journal.classify_builtin(Some(&err), FailureSource::UserCode),
            FailureSource::UserCode
        );
    }

    #[test]
    fn test_classifier_override_wins() {
        let journal = FailureJournal::new(FailureClassificationConfig {
            source_classifier: Some(Arc::new(|_| Ok(Some(FailureSource::ExternalDep)))),
            ..Default::default()
        });
        let err = anyhow!("boom");
        let (source, diagnostic) = journal.resolve_failure_source(
            Some(&err),
            FailureKind::Step,
            FailureReason::StepError,
            Some("my_step"),
            FailureSource::UserCode,
        );
        assert_eq!(source, FailureSource::ExternalDep);
        assert!(diagnostic.is_none());
    }

    #[test]
    fn test_classifier_none_defers_to_builtin() {
        let journal = FailureJournal::new(FailureClassificationConfig {
            source_classifier: Some(Arc::new(|_| Ok(None))),
            ..Default::default()
        });
        let err = anyhow!("boom");
        let (source, diagnostic) = journal.resolve_failure_source(
            Some(&err),
            FailureKind::Step,
            FailureReason::StepError,
            Some("my_step"),
            FailureSource::UserCode,
        );
        assert_eq!(source, FailureSource::UserCode);
        assert!(diagnostic.is_none());
    }

    #[test]
    fn test_classifier_error_records_diagnostic_and_uses_builtin() {
        let journal = FailureJournal::new(FailureClassificationConfig {
            source_classifier: Some(Arc::new(|_| Err(anyhow!("classifier broke")))),
            ..Default::default()
        });
        let err = anyhow!("original");
        let (source, diagnostic) = journal.resolve_failure_source(
            Some(&err),
            FailureKind::Step,
            FailureReason::StepError,
            Some("bad_step"),
            FailureSource::UserCode,
        );
        assert_eq!(source, FailureSource::UserCode);
        let diag = diagnostic.expect("diagnostic recorded");
        assert_eq!(diag.kind, FailureKind::Infra);
        assert_eq!(diag.source, FailureSource::Framework);
        assert_eq!(diag.reason, FailureReason::ClassifierError);
        assert_eq!(diag.step.as_deref(), Some("bad_step"));
        assert!(diag.error.as_deref().unwrap().contains("classifier broke"));
    }

    #[test]
    fn test_record_failure_writes_log_and_diagnostic() {
        let journal = FailureJournal::new(FailureClassificationConfig {
            source_classifier: Some(Arc::new(|_| Err(anyhow!("TypeError: bad classifier")))),
            ..Default::default()
        });
        let mut log = ExecutionLog::default();
        let err = anyhow!("root cause");

        journal.record_failure(
            &mut log,
            FailureKind::Step,
            FailureSource::UserCode,
            FailureReason::StepError,
            "step failed",
            Some("failing_step"),
            Some(&err),
        );

        assert_eq!(log.failures.len(), 1);
        let entry = &log.failures[0];
        assert_eq!(entry.kind, FailureKind::Step);
        assert_eq!(entry.source, FailureSource::UserCode);
        assert_eq!(entry.reason, FailureReason::StepError);
        assert_eq!(entry.error_message, "step failed");
        assert_eq!(entry.step.as_deref(), Some("failing_step"));
        assert!(entry.error.as_deref().unwrap().contains("root cause"));

        assert_eq!(log.diagnostics.len(), 1);
        let diag = &log.diagnostics[0];
        assert_eq!(diag.reason, FailureReason::ClassifierError);
        assert!(diag.error.as_deref().unwrap().contains("TypeError"));
    }

    #[test]
    fn test_record_failure_no_diagnostic_when_classifier_succeeds() {
        let journal = FailureJournal::new(FailureClassificationConfig {
            source_classifier: Some(Arc::new(|_| Ok(Some(FailureSource::ExternalDep)))),
            ..Default::default()
        });
        let mut log = ExecutionLog::default();
        let err = external_error();

        journal.record_failure(
            &mut log,
            FailureKind::Step,
            FailureSource::UserCode,
            FailureReason::StepError,
            "timeout",
            Some("api_call"),
            Some(&err),
        );

        assert_eq!(log.failures.len(), 1);
        assert_eq!(log.failures[0].source, FailureSource::ExternalDep);
        assert!(log.diagnostics.is_empty());
    }
}
