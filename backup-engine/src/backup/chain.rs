//! Validation of backup chains: a full backup followed by incrementals.

use super::manifest::BackupManifest;
use crate::catalog::descriptor::{DescriptorId, TableDescriptor};
use crate::kv::keys::{subtract_spans, Span};
use crate::kv::Timestamp;
use crate::utils::errors::{EngineError, Result};

/// Checks that `manifests` form one contiguous history starting at zero.
pub fn validate_chain(manifests: &[BackupManifest]) -> Result<()> {
    let Some(first) = manifests.first() else {
        return Err(EngineError::Manifest("no backups specified".into()));
    };
    for m in manifests {
        if !m.completed {
            return Err(EngineError::Manifest(format!(
                "backup {} ending at {} is not complete",
                m.id, m.end_time
            )));
        }
        if m.cluster_id != first.cluster_id {
            return Err(EngineError::ChainClusterMismatch {
                expected: first.cluster_id.to_string(),
                found: m.cluster_id.to_string(),
            });
        }
    }
    for pair in manifests.windows(2) {
        if pair[1].start_time < pair[0].end_time {
            return Err(EngineError::BackupsOutOfOrder {
                previous_end: pair[0].end_time,
                next_start: pair[1].start_time,
            });
        }
    }
    if !first.start_time.is_zero() {
        return Err(EngineError::NoBackupCoversTime {
            start: Timestamp::ZERO,
            end: first.start_time,
            detail: "the first backup is not a full backup".into(),
        });
    }
    for pair in manifests.windows(2) {
        if pair[1].start_time > pair[0].end_time {
            return Err(EngineError::NoBackupCoversTime {
                start: pair[0].end_time,
                end: pair[1].start_time,
                detail: "gap between backups".into(),
            });
        }
    }
    Ok(())
}

/// Truncates a validated chain to the backups needed to restore `as_of`.
///
/// `None` restores the end of the chain.
pub fn resolve_as_of(manifests: &[BackupManifest], as_of: Option<Timestamp>) -> Result<&[BackupManifest]> {
    let Some(as_of) = as_of else {
        return Ok(manifests);
    };
    let Some(idx) = manifests.iter().position(|m| m.end_time >= as_of) else {
        let end = manifests.last().map(|m| m.end_time).unwrap_or(Timestamp::ZERO);
        return Err(EngineError::NoBackupCoversTime {
            start: end,
            end: as_of,
            detail: "the requested time is after the end of the backup chain".into(),
        });
    };
    let covering = &manifests[idx];
    if covering.end_time != as_of && !covering.revision_history {
        return Err(EngineError::IncompatibleRestoreTimestamp(as_of));
    }
    Ok(&manifests[..=idx])
}

/// Every span must be covered by every backup of the chain.
pub fn check_coverage(spans: &[Span], manifests: &[BackupManifest]) -> Result<()> {
    for m in manifests {
        if let Some(missing) = subtract_spans(spans, &m.spans).into_iter().next() {
            return Err(EngineError::NoBackupCoversTime {
                start: m.start_time,
                end: m.end_time,
                detail: missing.to_string(),
            });
        }
    }
    Ok(())
}

/// A table introduced after the full backup must have been exported from
/// time zero in the backup that introduced it, and kept thereafter.
pub fn check_table_coverage(manifests: &[BackupManifest], table: &TableDescriptor) -> Result<()> {
    let present: Vec<bool> = manifests.iter().map(|m| m.table(table.id).is_some()).collect();
    let Some(first) = present.iter().position(|p| *p) else {
        return Err(EngineError::TableCoverage {
            table: table.name.clone(),
            detail: "not found in any backup".into(),
        });
    };
    if let Some(gap) = present[first..].iter().position(|p| !*p) {
        let m = &manifests[first + gap];
        return Err(EngineError::TableCoverage {
            table: table.name.clone(),
            detail: format!("missing from backup covering ({}, {}]", m.start_time, m.end_time),
        });
    }
    if first == 0 || table.is_view() {
        return Ok(());
    }
    let introduced = &manifests[first];
    let span = table.table_span();
    let exported_from_zero = introduced
        .files
        .iter()
        .filter(|f| f.span.overlaps(&span))
        .all(|f| f.start_time.is_zero());
    if !exported_from_zero {
        return Err(EngineError::TableCoverage {
            table: table.name.clone(),
            detail: format!(
                "introduced in incremental backup ({}, {}] without its earlier history",
                introduced.start_time, introduced.end_time
            ),
        });
    }
    Ok(())
}

/// Preconditions for an incremental backup on top of `previous`.
///
/// `tables` are the tables the new backup targets; any never seen by the
/// chain (created or truncated since) require a new full backup.
pub fn check_incremental(
    previous: &[BackupManifest],
    tables: &[&TableDescriptor],
    spans: &[Span],
    end_time: Timestamp,
) -> Result<()> {
    validate_chain(previous)?;
    let known: std::collections::HashSet<DescriptorId> =
        previous.iter().flat_map(|m| m.table_ids()).collect();
    if let Some(new) = tables.iter().find(|t| !known.contains(&t.id)) {
        return Err(EngineError::NewFullBackupRequired(new.name.clone()));
    }
    check_coverage(spans, previous)?;
    let previous_end = previous.last().map(|m| m.end_time).unwrap_or(Timestamp::ZERO);
    if end_time <= previous_end {
        return Err(EngineError::IncrementalNotAfter {
            end: end_time,
            previous: previous_end,
        });
    }
    Ok(())
}
