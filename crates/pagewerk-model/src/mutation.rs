// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page-sequence mutations.
//
// Every function here is pure: it takes the current page sequence and the
// operation parameters and returns the new sequence (plus any derived
// documents). Pages are addressed by stable id so the same operation can be
// reapplied to a fresher sequence after an optimistic-commit conflict.

use std::collections::{HashMap, HashSet};

use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{
    DerivedDocument, DocumentId, Operation, PageArtifact, PageId, PageRef, Rotation, StepKey,
};

/// The effect of one step on a document: its new page sequence and any
/// documents the step creates alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    pub pages: Vec<PageRef>,
    pub derived: Vec<DerivedDocument>,
}

impl Mutation {
    pub fn pages(pages: Vec<PageRef>) -> Self {
        Self {
            pages,
            derived: Vec::new(),
        }
    }
}

/// Inputs a mutation needs beyond the target's own pages.
pub struct MutationContext<'a> {
    /// Step being applied; seeds every derived identity.
    pub step: StepKey,
    pub target: DocumentId,
    /// Page sequences of merge sources other than the target.
    pub sources: &'a HashMap<DocumentId, Vec<PageRef>>,
    /// Blob replacements produced by content-level executors.
    pub artifacts: &'a [PageArtifact],
}

fn invalid(message: impl Into<String>) -> PagewerkError {
    PagewerkError::PermanentOperation(message.into())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn require_non_empty(ids: &[PageId], what: &str) -> Result<()> {
    if ids.is_empty() {
        return Err(invalid(format!("{what}: no pages selected")));
    }
    Ok(())
}

fn require_present(pages: &[PageRef], ids: &[PageId], what: &str) -> Result<()> {
    let present: HashSet<&PageId> = pages.iter().map(|p| &p.id).collect();
    match ids.iter().find(|id| !present.contains(id)) {
        Some(missing) => Err(invalid(format!(
            "{what}: page {missing} is not in the document"
        ))),
        None => Ok(()),
    }
}

fn require_distinct(ids: &[PageId], what: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(ids.len());
    match ids.iter().find(|id| !seen.insert(**id)) {
        Some(dup) => Err(invalid(format!("{what}: page {dup} listed twice"))),
        None => Ok(()),
    }
}

fn check_bijection(pages: &[PageRef], order: &[PageId]) -> Result<()> {
    if order.len() != pages.len() {
        return Err(invalid(format!(
            "reorder: order names {} pages but the document has {}",
            order.len(),
            pages.len()
        )));
    }
    require_distinct(order, "reorder")?;
    require_present(pages, order, "reorder")
}

fn check_boundaries(boundaries: &[u32], len: usize) -> Result<()> {
    if boundaries.is_empty() {
        return Err(invalid("split: at least one boundary is required"));
    }
    let mut previous = 0u32;
    for &boundary in boundaries {
        if boundary <= previous || boundary as usize >= len {
            return Err(invalid(format!(
                "split: boundary {boundary} must be increasing and inside 1..{len}"
            )));
        }
        previous = boundary;
    }
    Ok(())
}

/// Check an operation's parameters against a page sequence.
pub fn validate(op: &Operation, pages: &[PageRef]) -> Result<()> {
    match op {
        Operation::Merge { documents } => {
            if documents.is_empty() {
                return Err(invalid("merge: no source documents"));
            }
            Ok(())
        }
        Operation::Split { boundaries } => check_boundaries(boundaries, pages.len()),
        Operation::Rotate { pages: ids, .. } => {
            require_non_empty(ids, "rotate")?;
            require_present(pages, ids, "rotate")
        }
        Operation::Reorder { order } => check_bijection(pages, order),
        Operation::Delete { pages: ids } => {
            require_non_empty(ids, "delete")?;
            require_present(pages, ids, "delete")
        }
        Operation::Extract { pages: ids } => {
            require_non_empty(ids, "extract")?;
            require_distinct(ids, "extract")?;
            require_present(pages, ids, "extract")
        }
        Operation::Overlay { pages: ids, .. } => {
            require_non_empty(ids, "overlay")?;
            require_present(pages, ids, "overlay")
        }
        Operation::External { pages: ids, .. } => require_present(pages, ids, "external"),
    }
}

// ---------------------------------------------------------------------------
// Identity derivation
// ---------------------------------------------------------------------------

/// Id of the `part`-th document a step derives.
pub fn derived_document_id(step: &StepKey, label: &str, part: usize) -> DocumentId {
    DocumentId::derived(&step.job_id.0, &format!("{}/{label}/{part}", step.step_index))
}

/// Ids of every document `op` derives when run as `step`, in part order.
pub fn derived_ids(op: &Operation, step: &StepKey) -> Vec<DocumentId> {
    match op {
        Operation::Split { boundaries } => (0..=boundaries.len())
            .map(|part| derived_document_id(step, "split", part))
            .collect(),
        Operation::Extract { pages } => (0..pages.len())
            .map(|part| derived_document_id(step, "extract", part))
            .collect(),
        _ => Vec::new(),
    }
}

/// Copy pages into another document, giving each a fresh id scoped to it.
fn copy_into(document: DocumentId, pages: &[PageRef]) -> Vec<PageRef> {
    let mut occurrences: HashMap<PageId, u32> = HashMap::new();
    pages
        .iter()
        .map(|page| {
            let n = occurrences.entry(page.id).or_insert(0);
            let id = PageId::derived(&document.0, &format!("{}/{n}", page.id));
            *n += 1;
            PageRef { id, ..page.clone() }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Permute pages into exactly `order`.
pub fn reorder(pages: &[PageRef], order: &[PageId]) -> Result<Vec<PageRef>> {
    check_bijection(pages, order)?;
    let by_id: HashMap<PageId, &PageRef> = pages.iter().map(|p| (p.id, p)).collect();
    Ok(order
        .iter()
        .filter_map(|id| by_id.get(id).map(|p| (*p).clone()))
        .collect())
}

/// Add `angle` (mod 360) to each targeted page's rotation.
pub fn rotate(pages: &[PageRef], targets: &[PageId], angle: Rotation) -> Result<Vec<PageRef>> {
    require_non_empty(targets, "rotate")?;
    require_present(pages, targets, "rotate")?;
    let targets: HashSet<&PageId> = targets.iter().collect();
    Ok(pages
        .iter()
        .map(|page| {
            let mut page = page.clone();
            if targets.contains(&page.id) {
                page.rotation = page.rotation.add(angle);
            }
            page
        })
        .collect())
}

/// Remove pages, keeping survivors in their relative order.
pub fn delete(pages: &[PageRef], targets: &[PageId]) -> Result<Vec<PageRef>> {
    require_non_empty(targets, "delete")?;
    require_present(pages, targets, "delete")?;
    let targets: HashSet<&PageId> = targets.iter().collect();
    Ok(pages
        .iter()
        .filter(|p| !targets.contains(&p.id))
        .cloned()
        .collect())
}

/// Cut the sequence at each boundary index into `boundaries.len() + 1`
/// contiguous documents. Provenance is carried over unchanged.
pub fn split(pages: &[PageRef], boundaries: &[u32], step: &StepKey) -> Result<Vec<DerivedDocument>> {
    check_boundaries(boundaries, pages.len())?;
    let mut cuts = Vec::with_capacity(boundaries.len() + 2);
    cuts.push(0usize);
    cuts.extend(boundaries.iter().map(|b| *b as usize));
    cuts.push(pages.len());

    Ok(cuts
        .windows(2)
        .enumerate()
        .map(|(part, range)| {
            let id = derived_document_id(step, "split", part);
            DerivedDocument {
                id,
                pages: copy_into(id, &pages[range[0]..range[1]]),
            }
        })
        .collect())
}

/// Concatenate the page sequences of `documents`, in order.
///
/// The target's own pages keep their ids on first occurrence; every other
/// page gets an id derived from the step so ids stay unique in the result.
pub fn merge(
    target: DocumentId,
    target_pages: &[PageRef],
    documents: &[DocumentId],
    sources: &HashMap<DocumentId, Vec<PageRef>>,
    step: &StepKey,
) -> Result<Vec<PageRef>> {
    if documents.is_empty() {
        return Err(invalid("merge: no source documents"));
    }
    let mut merged = Vec::new();
    let mut kept: HashSet<PageId> = HashSet::new();
    let mut occurrences: HashMap<(DocumentId, PageId), u32> = HashMap::new();

    for document in documents {
        let source_pages = if *document == target {
            target_pages
        } else {
            sources
                .get(document)
                .map(Vec::as_slice)
                .ok_or_else(|| invalid(format!("merge: source document {document} not loaded")))?
        };
        for page in source_pages {
            if *document == target && kept.insert(page.id) {
                merged.push(page.clone());
                continue;
            }
            let n = occurrences.entry((*document, page.id)).or_insert(0);
            let id = PageId::derived(&target.0, &format!("{step}/{document}/{}/{n}", page.id));
            *n += 1;
            merged.push(PageRef { id, ..page.clone() });
        }
    }
    Ok(merged)
}

/// One new single-page document per selected page, in selection order.
pub fn extract(
    pages: &[PageRef],
    targets: &[PageId],
    step: &StepKey,
) -> Result<Vec<DerivedDocument>> {
    require_non_empty(targets, "extract")?;
    require_distinct(targets, "extract")?;
    require_present(pages, targets, "extract")?;
    let by_id: HashMap<PageId, &PageRef> = pages.iter().map(|p| (p.id, p)).collect();

    Ok(targets
        .iter()
        .enumerate()
        .filter_map(|(i, page_id)| by_id.get(page_id).map(|page| (i, *page)))
        .map(|(i, page)| {
            let id = derived_document_id(step, "extract", i);
            DerivedDocument {
                id,
                pages: copy_into(id, std::slice::from_ref(page)),
            }
        })
        .collect())
}

/// Swap in new content for the pages named by `artifacts`.
pub fn replace_blobs(pages: &[PageRef], artifacts: &[PageArtifact]) -> Result<Vec<PageRef>> {
    let replacements: HashMap<PageId, &PageArtifact> =
        artifacts.iter().map(|a| (a.page_id, a)).collect();
    let ids: Vec<PageId> = replacements.keys().copied().collect();
    require_present(pages, &ids, "content update")?;
    Ok(pages
        .iter()
        .map(|page| match replacements.get(&page.id) {
            Some(artifact) => PageRef {
                blob: artifact.blob.clone(),
                ..page.clone()
            },
            None => page.clone(),
        })
        .collect())
}

/// Apply `op` to `pages`.
///
/// This is the single entry point used both by built-in executors and when
/// the orchestrator reapplies a step against a newer page sequence.
pub fn apply(op: &Operation, pages: &[PageRef], ctx: &MutationContext<'_>) -> Result<Mutation> {
    match op {
        Operation::Merge { documents } => Ok(Mutation::pages(merge(
            ctx.target,
            pages,
            documents,
            ctx.sources,
            &ctx.step,
        )?)),
        Operation::Split { boundaries } => Ok(Mutation {
            pages: pages.to_vec(),
            derived: split(pages, boundaries, &ctx.step)?,
        }),
        Operation::Rotate { pages: ids, angle } => Ok(Mutation::pages(rotate(pages, ids, *angle)?)),
        Operation::Reorder { order } => Ok(Mutation::pages(reorder(pages, order)?)),
        Operation::Delete { pages: ids } => Ok(Mutation::pages(delete(pages, ids)?)),
        Operation::Extract { pages: ids } => Ok(Mutation {
            pages: pages.to_vec(),
            derived: extract(pages, ids, &ctx.step)?,
        }),
        Operation::Overlay { .. } | Operation::External { .. } => {
            validate(op, pages)?;
            Ok(Mutation::pages(replace_blobs(pages, ctx.artifacts)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewerk_core::{BlobRef, JobId, Provenance};

    fn doc_pages(document: DocumentId, n: u32) -> Vec<PageRef> {
        (0..n)
            .map(|i| PageRef {
                id: PageId::new(),
                blob: BlobRef {
                    hash: format!("{i:064x}"),
                    size: 10 + u64::from(i),
                },
                rotation: Rotation::Deg0,
                provenance: Provenance {
                    document_id: document,
                    page_index: i,
                },
            })
            .collect()
    }

    fn ids(pages: &[PageRef]) -> Vec<PageId> {
        pages.iter().map(|p| p.id).collect()
    }

    /// Content view of a sequence, ignoring ids and provenance.
    fn content(pages: &[PageRef]) -> Vec<(String, Rotation)> {
        pages.iter().map(|p| (p.blob.hash.clone(), p.rotation)).collect()
    }

    fn step() -> StepKey {
        StepKey::new(JobId::new(), 0)
    }

    #[test]
    fn rotate_then_delete_keeps_relative_order() {
        let d0 = DocumentId::new();
        let pages = doc_pages(d0, 5);
        let rotated = rotate(&pages, &[pages[1].id, pages[3].id], Rotation::Deg90).unwrap();
        let result = delete(&rotated, &[pages[2].id]).unwrap();

        assert_eq!(ids(&result), vec![pages[0].id, pages[1].id, pages[3].id, pages[4].id]);
        assert_eq!(result[1].rotation, Rotation::Deg90);
        assert_eq!(result[2].rotation, Rotation::Deg90);
        assert_eq!(result[0].rotation, Rotation::Deg0);
    }

    #[test]
    fn rotation_accumulates_modulo_360() {
        let pages = doc_pages(DocumentId::new(), 1);
        let once = rotate(&pages, &[pages[0].id], Rotation::Deg270).unwrap();
        let twice = rotate(&once, &[pages[0].id], Rotation::Deg180).unwrap();
        assert_eq!(twice[0].rotation, Rotation::Deg90);
    }

    #[test]
    fn reorder_requires_a_bijection() {
        let pages = doc_pages(DocumentId::new(), 3);
        let reversed: Vec<PageId> = ids(&pages).into_iter().rev().collect();
        assert_eq!(ids(&reorder(&pages, &reversed).unwrap()), reversed);

        let duplicated = vec![pages[0].id, pages[0].id, pages[1].id];
        assert!(reorder(&pages, &duplicated).is_err());
        assert!(reorder(&pages, &ids(&pages)[..2]).is_err());
        let foreign = vec![pages[0].id, pages[1].id, PageId::new()];
        assert!(reorder(&pages, &foreign).is_err());
    }

    #[test]
    fn missing_target_is_a_permanent_error() {
        let pages = doc_pages(DocumentId::new(), 2);
        let err = rotate(&pages, &[PageId::new()], Rotation::Deg90).unwrap_err();
        assert!(matches!(err, PagewerkError::PermanentOperation(_)));
    }

    #[test]
    fn deleting_every_page_leaves_an_empty_document() {
        let pages = doc_pages(DocumentId::new(), 2);
        assert!(delete(&pages, &ids(&pages)).unwrap().is_empty());
    }

    #[test]
    fn split_produces_contiguous_parts_with_provenance() {
        let d0 = DocumentId::new();
        let pages = doc_pages(d0, 5);
        let parts = split(&pages, &[2], &step()).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(content(&parts[0].pages), content(&pages[..2]));
        assert_eq!(content(&parts[1].pages), content(&pages[2..]));
        let indices: Vec<u32> = parts[1].pages.iter().map(|p| p.provenance.page_index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
        assert!(parts.iter().flat_map(|d| &d.pages).all(|p| p.provenance.document_id == d0));
    }

    #[test]
    fn split_rejects_bad_boundaries() {
        let pages = doc_pages(DocumentId::new(), 4);
        for bad in [vec![], vec![0], vec![4], vec![2, 2], vec![3, 1]] {
            assert!(split(&pages, &bad, &step()).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn derived_identities_are_stable_across_reexecution() {
        let pages = doc_pages(DocumentId::new(), 4);
        let key = step();
        let first = split(&pages, &[1, 3], &key).unwrap();
        let again = split(&pages, &[1, 3], &key).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.len(), 3);

        let op = Operation::Split { boundaries: vec![1, 3] };
        let ids: Vec<DocumentId> = first.iter().map(|d| d.id).collect();
        assert_eq!(derived_ids(&op, &key), ids);
    }

    #[test]
    fn merge_of_split_reconstructs_the_original() {
        let pages = doc_pages(DocumentId::new(), 5);
        let parts = split(&pages, &[2], &step()).unwrap();
        let target = DocumentId::new();
        let sources: HashMap<DocumentId, Vec<PageRef>> =
            parts.iter().map(|d| (d.id, d.pages.clone())).collect();
        let order: Vec<DocumentId> = parts.iter().map(|d| d.id).collect();

        let merged = merge(target, &[], &order, &sources, &step()).unwrap();
        assert_eq!(content(&merged), content(&pages));
    }

    #[test]
    fn merging_a_document_with_itself_keeps_ids_unique() {
        let target = DocumentId::new();
        let pages = doc_pages(target, 2);
        let merged = merge(target, &pages, &[target, target], &HashMap::new(), &step()).unwrap();

        assert_eq!(merged.len(), 4);
        assert_eq!(&ids(&merged)[..2], &ids(&pages)[..]);
        let unique: HashSet<PageId> = ids(&merged).into_iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn merge_requires_loaded_sources() {
        let target = DocumentId::new();
        let err = merge(target, &[], &[DocumentId::new()], &HashMap::new(), &step()).unwrap_err();
        assert!(matches!(err, PagewerkError::PermanentOperation(_)));
    }

    #[test]
    fn extract_makes_one_document_per_page_in_selection_order() {
        let d0 = DocumentId::new();
        let pages = doc_pages(d0, 4);
        let docs = extract(&pages, &[pages[3].id, pages[0].id], &step()).unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].pages[0].provenance.page_index, 3);
        assert_eq!(docs[1].pages[0].provenance.page_index, 0);
        assert_ne!(docs[0].id, docs[1].id);
    }

    #[test]
    fn content_updates_replace_only_named_pages() {
        let pages = doc_pages(DocumentId::new(), 3);
        let stamped = BlobRef {
            hash: "f".repeat(64),
            size: 1,
        };
        let updated = replace_blobs(
            &pages,
            &[PageArtifact {
                page_id: pages[1].id,
                blob: stamped.clone(),
            }],
        )
        .unwrap();
        assert_eq!(updated[1].blob, stamped);
        assert_eq!(updated[0], pages[0]);

        let stale = PageArtifact {
            page_id: PageId::new(),
            blob: stamped,
        };
        assert!(replace_blobs(&pages, &[stale]).is_err());
    }

    #[test]
    fn apply_reuses_split_output_against_unchanged_target() {
        let target = DocumentId::new();
        let pages = doc_pages(target, 3);
        let sources = HashMap::new();
        let ctx = MutationContext {
            step: step(),
            target,
            sources: &sources,
            artifacts: &[],
        };
        let mutation = apply(&Operation::Split { boundaries: vec![1] }, &pages, &ctx).unwrap();
        assert_eq!(mutation.pages, pages);
        assert_eq!(mutation.derived.len(), 2);
    }
}
