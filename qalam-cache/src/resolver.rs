//! Ordered fallback across backend sources.

use std::sync::Arc;

use async_trait::async_trait;
use qalam_core::{EntityKind, QalamError, QalamResult, Resolved, SourceError, SubjectId};
use tracing::{debug, trace, warn};

/// One place an entity may live.
#[async_trait]
pub trait SourceProbe<V>: Send + Sync {
    /// Stable source name, reported with the value.
    fn name(&self) -> &str;

    /// `Ok(None)` means the source has nothing for this subject.
    async fn probe(&self, subject: &SubjectId, kind: EntityKind) -> QalamResult<Option<V>>;
}

/// Single-shot fix for values that fail a validity heuristic.
#[async_trait]
pub trait ValueRepair<V>: Send + Sync {
    /// True if `value`, as produced by `source`, is unusable as is.
    fn needs_repair(&self, source: &str, value: &V) -> bool;

    /// Re-derive the value. `Ok(None)` means it cannot be repaired.
    async fn repair(&self, subject: &SubjectId, value: &V) -> QalamResult<Option<V>>;
}

/// Tries probes in order and returns the first usable value.
///
/// Probe errors are logged and skipped. A value that needs repair gets one
/// repair attempt per resolve call; if that fails the resolver moves on to
/// the next probe. Adding a source means adding a probe, nothing else.
pub struct SourceFallbackResolver<V> {
    probes: Vec<Arc<dyn SourceProbe<V>>>,
    repair: Option<Arc<dyn ValueRepair<V>>>,
}

impl<V> Clone for SourceFallbackResolver<V> {
    fn clone(&self) -> Self {
        Self {
            probes: self.probes.clone(),
            repair: self.repair.clone(),
        }
    }
}

impl<V> Default for SourceFallbackResolver<V> {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            repair: None,
        }
    }
}

struct Outcome<V> {
    resolved: Resolved<V>,
    errors: usize,
    probed: usize,
}

impl<V> SourceFallbackResolver<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a probe; probes run in insertion order.
    pub fn with_probe(mut self, probe: impl SourceProbe<V> + 'static) -> Self {
        self.probes.push(Arc::new(probe));
        self
    }

    pub fn with_repair(mut self, repair: impl ValueRepair<V> + 'static) -> Self {
        self.repair = Some(Arc::new(repair));
        self
    }

    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// First usable value, or [`Resolved::Absent`] when no source has one.
    /// Never fails.
    pub async fn resolve(&self, subject: &SubjectId, kind: EntityKind) -> Resolved<V> {
        self.run(subject, kind).await.resolved
    }

    /// Like [`SourceFallbackResolver::resolve`], but reports an error when
    /// every probe failed, so a full outage is not mistaken for absence.
    pub async fn try_resolve(&self, subject: &SubjectId, kind: EntityKind) -> QalamResult<Resolved<V>> {
        let outcome = self.run(subject, kind).await;
        if outcome.resolved.is_absent() && outcome.probed > 0 && outcome.errors == outcome.probed {
            return Err(QalamError::Source(SourceError::Unavailable {
                source_name: self.probe_names().join(","),
                reason: format!("all {} sources failed for {} {}", outcome.probed, kind, subject),
            }));
        }
        Ok(outcome.resolved)
    }

    async fn run(&self, subject: &SubjectId, kind: EntityKind) -> Outcome<V> {
        let mut repair_spent = false;
        let mut errors = 0;

        for probe in &self.probes {
            let source = probe.name();
            let value = match probe.probe(subject, kind).await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    trace!(subject = %subject, kind = %kind, source, "Source empty");
                    continue;
                }
                Err(e) => {
                    errors += 1;
                    warn!(subject = %subject, kind = %kind, source, error = %e, "Source probe failed");
                    continue;
                }
            };

            let Some(repair) = self.repair.as_ref().filter(|r| r.needs_repair(source, &value)) else {
                debug!(subject = %subject, kind = %kind, source, "Resolved");
                return Outcome {
                    resolved: Resolved::found(value, source),
                    errors,
                    probed: self.probes.len(),
                };
            };

            if repair_spent {
                debug!(subject = %subject, source, "Value needs repair, attempt already used");
                continue;
            }
            repair_spent = true;
            match repair.repair(subject, &value).await {
                Ok(Some(fixed)) => {
                    debug!(subject = %subject, kind = %kind, source, "Resolved after repair");
                    return Outcome {
                        resolved: Resolved::found(fixed, source),
                        errors,
                        probed: self.probes.len(),
                    };
                }
                Ok(None) => {
                    debug!(subject = %subject, source, "Value could not be repaired, falling through");
                }
                Err(e) => {
                    warn!(subject = %subject, source, error = %e, "Repair failed, falling through");
                }
            }
        }

        debug!(subject = %subject, kind = %kind, "No source yielded a value");
        Outcome {
            resolved: Resolved::Absent,
            errors,
            probed: self.probes.len(),
        }
    }
}
