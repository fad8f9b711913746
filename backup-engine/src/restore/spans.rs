//! Import span construction.
//!
//! Restored table spans are cut at every file boundary across the chain, so
//! each import span reads a fixed set of files from every backup. Spans are
//! ordered by key; everything below the low-water mark is already imported.

use crate::backup::manifest::{BackupManifest, ManifestFile};
use crate::kv::keys::{Key, Span};

/// A data file of backup `backup` in the chain (0 = full backup).
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    pub backup: usize,
    pub file: ManifestFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSpan {
    pub span: Span,
    pub files: Vec<FileRef>,
}

/// Import spans for `source_spans`, skipping parts below `low_water_mark`.
pub fn import_spans(
    source_spans: &[Span],
    manifests: &[BackupManifest],
    low_water_mark: Option<&Key>,
) -> Vec<ImportSpan> {
    let mut out = Vec::new();
    for source in source_spans {
        let mut bounds = vec![source.key.clone(), source.end_key.clone()];
        for m in manifests {
            for f in m.files.iter().filter(|f| f.has_data() && f.span.overlaps(source)) {
                for k in [&f.span.key, &f.span.end_key] {
                    if source.contains_key(k) {
                        bounds.push(k.clone());
                    }
                }
            }
        }
        bounds.sort();
        bounds.dedup();

        for pair in bounds.windows(2) {
            let mut span = Span::new(pair[0].clone(), pair[1].clone());
            let files: Vec<FileRef> = manifests
                .iter()
                .enumerate()
                .flat_map(|(backup, m)| {
                    m.files_overlapping(&span).map(move |f| FileRef {
                        backup,
                        file: f.clone(),
                    })
                })
                .collect();
            if files.is_empty() {
                continue;
            }
            if let Some(lwm) = low_water_mark {
                if &span.end_key <= lwm {
                    continue;
                }
                if &span.key < lwm {
                    span.key = lwm.clone();
                }
            }
            out.push(ImportSpan { span, files });
        }
    }
    out.sort_by(|a, b| a.span.cmp(&b.span));
    out
}

/// Number of import spans wholly below `low_water_mark`.
pub fn spans_below(source_spans: &[Span], manifests: &[BackupManifest], low_water_mark: Option<&Key>) -> usize {
    match low_water_mark {
        Some(lwm) => import_spans(source_spans, manifests, None)
            .iter()
            .filter(|s| &s.span.end_key <= lwm)
            .count(),
        None => 0,
    }
}

/// Start of the first span not yet done; past the end when all are done.
pub fn low_water_mark(spans: &[ImportSpan], done: &[bool]) -> Option<Key> {
    match done.iter().position(|d| !d) {
        Some(i) => spans.get(i).map(|s| s.span.key.clone()),
        None => spans.last().map(|s| s.span.end_key.clone()),
    }
}
