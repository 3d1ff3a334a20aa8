//! Resolution of segmentations to the series they were drawn on.

use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::organs::{normalize_label, OrganDictionary};
use crate::segmentation::{ReferenceUid, SegmentationRecord};
use crate::series::RawSeries;

/// Recoverable problems found while linking. Never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkWarning {
    /// No available series matches the segmentation; it is dropped.
    UnresolvedReference {
        source: PathBuf,
        reference: Option<ReferenceUid>,
    },
    /// Several series match; the first candidate was used.
    AmbiguousReference {
        source: PathBuf,
        reference: Option<ReferenceUid>,
        candidates: Vec<String>,
    },
}

impl fmt::Display for LinkWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let describe = |reference: &Option<ReferenceUid>| {
            reference
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "no reference, shape match".to_string())
        };
        match self {
            LinkWarning::UnresolvedReference { source, reference } => {
                write!(f, "unresolved reference in {:?} ({})", source, describe(reference))
            }
            LinkWarning::AmbiguousReference {
                source,
                reference,
                candidates,
            } => write!(
                f,
                "ambiguous reference in {:?} ({}): {} candidates, linked to {}",
                source,
                describe(reference),
                candidates.len(),
                candidates.first().map(String::as_str).unwrap_or("-")
            ),
        }
    }
}

/// A segmentation attached to a series.
#[derive(Debug)]
pub struct Link {
    pub series_uid: String,
    pub organ: String,
    pub record: SegmentationRecord,
}

#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub links: Vec<Link>,
    pub warnings: Vec<LinkWarning>,
}

pub struct SegmentationLinker<'a> {
    organs: &'a OrganDictionary,
}

impl<'a> SegmentationLinker<'a> {
    pub fn new(organs: &'a OrganDictionary) -> Self {
        Self { organs }
    }

    /// Links every segmentation to a series in `available`. Candidates are
    /// tried in the order given; the first one wins on collisions.
    pub fn link(&self, segmentations: Vec<SegmentationRecord>, available: &[&RawSeries]) -> LinkOutcome {
        let mut outcome = LinkOutcome::default();

        for record in segmentations {
            let candidates = candidates(&record, available);
            let Some(first) = candidates.first() else {
                let warning = LinkWarning::UnresolvedReference {
                    source: record.source.clone(),
                    reference: record.reference.clone(),
                };
                warn!("{}", warning);
                outcome.warnings.push(warning);
                continue;
            };

            let series_uid = first.series_uid.clone();
            if candidates.len() > 1 {
                let warning = LinkWarning::AmbiguousReference {
                    source: record.source.clone(),
                    reference: record.reference.clone(),
                    candidates: candidates.iter().map(|s| s.series_uid.clone()).collect(),
                };
                warn!("{}", warning);
                outcome.warnings.push(warning);
            }

            let organ = self.resolve_organ(&record);
            outcome.links.push(Link {
                series_uid,
                organ,
                record,
            });
        }

        outcome
    }

    /// Organ name of a segmentation: the dictionary entry for its label when
    /// there is one, else the normalised label, else the normalised file stem.
    pub fn resolve_organ(&self, record: &SegmentationRecord) -> String {
        let label = record
            .label
            .as_deref()
            .map(str::to_string)
            .filter(|l| !normalize_label(l).is_empty())
            .unwrap_or_else(|| record.stem());

        if let Some(organ) = self.organs.lookup(&label) {
            return organ.to_string();
        }
        let normalized = normalize_label(&label);
        if normalized.is_empty() {
            "segment".to_string()
        } else {
            normalized
        }
    }
}

fn candidates<'s>(record: &SegmentationRecord, available: &[&'s RawSeries]) -> Vec<&'s RawSeries> {
    let by_series = |uid: &str| -> Vec<&'s RawSeries> {
        available.iter().copied().filter(|s| s.series_uid == uid).collect()
    };
    let by_frame = |uid: &str| -> Vec<&'s RawSeries> {
        available
            .iter()
            .copied()
            .filter(|s| s.frame_of_reference_uid.as_deref() == Some(uid))
            .collect()
    };

    match &record.reference {
        Some(ReferenceUid::Series(uid)) => by_series(uid),
        Some(ReferenceUid::FrameOfReference(uid)) => by_frame(uid),
        Some(ReferenceUid::Unqualified(uid)) => {
            let found = by_series(uid);
            if found.is_empty() { by_frame(uid) } else { found }
        }
        None => match record.mask.shape() {
            Some(shape) => available.iter().copied().filter(|s| s.shape() == shape).collect(),
            None => Vec::new(),
        },
    }
}
