//! Per-patient selection of series and attachment of segmentations.
//!
//! A series is included when its description matches a role, when a
//! segmentation references it, or both. The two channels are independent
//! and their union is kept; the reason is recorded on every association.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PatientLayout, ScanOptions};
use crate::criteria::{role_for, SelectionCriteria};
use crate::dicom_reader::{ImageReader, PatientInfo};
use crate::error::Result;
use crate::linker::{Link, LinkWarning, SegmentationLinker};
use crate::organs::OrganDictionary;
use crate::segmentation::{collect_segmentations, SegmentationReader, SegmentationRecord};
use crate::series::{RawSeries, SeriesCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InclusionReason {
    ByDescription,
    BySegmentation,
    Both,
}

impl InclusionReason {
    pub fn from_channels(by_description: bool, by_segmentation: bool) -> Option<Self> {
        match (by_description, by_segmentation) {
            (true, true) => Some(InclusionReason::Both),
            (true, false) => Some(InclusionReason::ByDescription),
            (false, true) => Some(InclusionReason::BySegmentation),
            (false, false) => None,
        }
    }

    pub fn by_description(self) -> bool {
        matches!(self, InclusionReason::ByDescription | InclusionReason::Both)
    }

    pub fn by_segmentation(self) -> bool {
        matches!(self, InclusionReason::BySegmentation | InclusionReason::Both)
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_channels(
            self.by_description() || other.by_description(),
            self.by_segmentation() || other.by_segmentation(),
        )
        .unwrap_or(self)
    }
}

#[derive(Debug)]
pub struct LinkedSegmentation {
    pub organ: String,
    pub record: SegmentationRecord,
}

/// One included series and the segmentations drawn on it.
#[derive(Debug)]
pub struct ImageAssociation {
    pub series: RawSeries,
    /// Role matched by description, if any
    pub role: Option<String>,
    pub reason: InclusionReason,
    pub segmentations: Vec<LinkedSegmentation>,
}

/// Recoverable conditions met while assembling one patient.
#[derive(Debug, Clone, PartialEq)]
pub enum PatientWarning {
    MalformedSeries(String),
    Link(LinkWarning),
    DuplicateSeries { series_uid: String },
}

impl fmt::Display for PatientWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientWarning::MalformedSeries(message) => write!(f, "{message}"),
            PatientWarning::Link(warning) => write!(f, "{warning}"),
            PatientWarning::DuplicateSeries { series_uid } => {
                write!(f, "series {series_uid} included twice, merged")
            }
        }
    }
}

#[derive(Debug)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient: PatientInfo,
    pub images: Vec<ImageAssociation>,
    pub warnings: Vec<PatientWarning>,
}

impl PatientRecord {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn image(&self, series_uid: &str) -> Option<&ImageAssociation> {
        self.images.iter().find(|i| i.series.series_uid == series_uid)
    }
}

/// Decides whether a series that matches no role should be kept anyway.
/// Returning a role registers the series description under it.
pub trait SeriesDecider {
    fn decide(&mut self, patient_id: &str, series: &RawSeries, criteria: &SelectionCriteria) -> Option<String>;
}

/// Never keeps unmatched series.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepMatchedOnly;

impl SeriesDecider for KeepMatchedOnly {
    fn decide(&mut self, _: &str, _: &RawSeries, _: &SelectionCriteria) -> Option<String> {
        None
    }
}

/// Adapts a closure into a [`SeriesDecider`].
pub struct FnDecider<F>(pub F);

impl<F> SeriesDecider for FnDecider<F>
where
    F: FnMut(&str, &RawSeries, &SelectionCriteria) -> Option<String>,
{
    fn decide(&mut self, patient_id: &str, series: &RawSeries, criteria: &SelectionCriteria) -> Option<String> {
        (self.0)(patient_id, series, criteria)
    }
}

/// Asks on a terminal which role an unmatched series belongs to.
pub struct PromptDecider<R, W> {
    input: R,
    output: W,
}

impl PromptDecider<io::StdinLock<'static>, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> PromptDecider<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, patient_id: &str, series: &RawSeries, criteria: &SelectionCriteria) -> io::Result<Option<String>> {
        let roles: Vec<&str> = criteria.roles().collect();
        writeln!(
            self.output,
            "Patient {}: series {:?} ({}, {} files) matches no role.",
            patient_id,
            series.description.as_deref().unwrap_or(""),
            series.modality.as_deref().unwrap_or("?"),
            series.files.len()
        )?;
        write!(
            self.output,
            "Known roles [{}]. Role to keep it under (empty to skip): ",
            roles.join(", ")
        )?;
        self.output.flush()?;

        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        let answer = answer.trim();
        Ok((!answer.is_empty()).then(|| answer.to_string()))
    }
}

impl<R: BufRead, W: Write> SeriesDecider for PromptDecider<R, W> {
    fn decide(&mut self, patient_id: &str, series: &RawSeries, criteria: &SelectionCriteria) -> Option<String> {
        match self.ask(patient_id, series, criteria) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Prompt failed, keeping series unselected: {}", e);
                None
            }
        }
    }
}

/// Insertion-ordered associations keyed by series UID.
#[derive(Debug, Default)]
pub struct AssociationSet {
    images: Vec<ImageAssociation>,
    index: HashMap<String, usize>,
}

impl AssociationSet {
    /// Adds an association, merging it into an existing one with the same
    /// series UID. Returns `true` when a merge happened.
    pub fn insert(&mut self, image: ImageAssociation) -> bool {
        match self.index.get(&image.series.series_uid) {
            Some(&slot) => {
                let existing = &mut self.images[slot];
                existing.reason = existing.reason.union(image.reason);
                if existing.role.is_none() {
                    existing.role = image.role;
                }
                existing.segmentations.extend(image.segmentations);
                true
            }
            None => {
                self.index.insert(image.series.series_uid.clone(), self.images.len());
                self.images.push(image);
                false
            }
        }
    }

    /// Attaches a link to its series. Returns the link back when the series
    /// is not part of the set.
    pub fn attach(&mut self, link: Link) -> std::result::Result<(), Link> {
        match self.index.get(&link.series_uid) {
            Some(&slot) => {
                self.images[slot].segmentations.push(LinkedSegmentation {
                    organ: link.organ,
                    record: link.record,
                });
                Ok(())
            }
            None => Err(link),
        }
    }

    pub fn into_vec(self) -> Vec<ImageAssociation> {
        self.images
    }
}

/// Turns one patient directory into a [`PatientRecord`].
pub struct AssociationEngine<'a> {
    image_reader: &'a dyn ImageReader,
    segmentation_reader: &'a dyn SegmentationReader,
    organs: &'a OrganDictionary,
    layout: PatientLayout,
    scan: ScanOptions,
}

impl<'a> AssociationEngine<'a> {
    pub fn new(
        image_reader: &'a dyn ImageReader,
        segmentation_reader: &'a dyn SegmentationReader,
        organs: &'a OrganDictionary,
    ) -> Self {
        Self {
            image_reader,
            segmentation_reader,
            organs,
            layout: PatientLayout::default(),
            scan: ScanOptions::default(),
        }
    }

    pub fn with_layout(mut self, layout: PatientLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    pub fn image_reader(&self) -> &'a dyn ImageReader {
        self.image_reader
    }

    /// Catalogues, selects and links one patient.
    ///
    /// Only patient-fatal conditions are returned as errors; everything
    /// recoverable ends up in [`PatientRecord::warnings`]. Descriptions
    /// registered through `decider` are written into `criteria`.
    pub fn associate<D>(
        &self,
        patient_dir: &Path,
        mut criteria: Option<&mut SelectionCriteria>,
        decider: &mut D,
    ) -> Result<PatientRecord>
    where
        D: SeriesDecider + ?Sized,
    {
        let patient_id = patient_id_of(patient_dir);
        let catalog = SeriesCatalog::new(self.image_reader, self.scan)
            .collect(&patient_dir.join(&self.layout.images_dir))?;
        let segmentations = collect_segmentations(
            self.segmentation_reader,
            &patient_dir.join(&self.layout.segmentations_dir),
            self.scan.max_depth,
        );
        debug!(
            "Patient {}: {} series, {} segmentations",
            patient_id,
            catalog.series.len(),
            segmentations.len()
        );

        let mut warnings: Vec<PatientWarning> = catalog
            .malformed
            .iter()
            .map(|e| PatientWarning::MalformedSeries(e.to_string()))
            .collect();

        let mut roles: Vec<Option<String>> = catalog
            .series
            .iter()
            .map(|s| role_for(criteria.as_deref(), s.description.as_deref()))
            .collect();

        // Description-selected series are offered to the linker first so
        // they win frame-of-reference collisions.
        let mut order: Vec<usize> = (0..catalog.series.len()).collect();
        order.sort_by_key(|&i| roles[i].is_none());
        let candidates: Vec<&RawSeries> = order.iter().map(|&i| &catalog.series[i]).collect();
        let linked = SegmentationLinker::new(self.organs).link(segmentations, &candidates);
        warnings.extend(linked.warnings.into_iter().map(PatientWarning::Link));

        let segmented: HashSet<String> = linked.links.iter().map(|l| l.series_uid.clone()).collect();

        if let Some(criteria) = criteria.as_deref_mut() {
            for (series, role) in catalog.series.iter().zip(roles.iter_mut()) {
                if role.is_some() || segmented.contains(&series.series_uid) {
                    continue;
                }
                let Some(description) = series.description.as_deref() else {
                    continue;
                };
                if let Some(known) = criteria.matches(description) {
                    *role = Some(known.to_string());
                    continue;
                }
                if let Some(chosen) = decider.decide(&patient_id, series, criteria) {
                    info!("Registering {:?} under role {:?}", description, chosen);
                    criteria.register(&chosen, description);
                    *role = Some(chosen);
                }
            }
        }

        let mut set = AssociationSet::default();
        for (series, role) in catalog.series.into_iter().zip(roles) {
            let by_segmentation = segmented.contains(&series.series_uid);
            let Some(reason) = InclusionReason::from_channels(role.is_some(), by_segmentation) else {
                debug!("Patient {}: excluding series {:?}", patient_id, series.label());
                continue;
            };
            let series_uid = series.series_uid.clone();
            let merged = set.insert(ImageAssociation {
                series,
                role,
                reason,
                segmentations: Vec::new(),
            });
            if merged {
                warn!("Patient {}: series {} included twice, merged", patient_id, series_uid);
                warnings.push(PatientWarning::DuplicateSeries { series_uid });
            }
        }

        for link in linked.links {
            if let Err(link) = set.attach(link) {
                warn!("Dropping segmentation {:?}: series {} not included", link.record.source, link.series_uid);
            }
        }

        Ok(PatientRecord {
            patient_id,
            patient: catalog.patient,
            images: set.into_vec(),
            warnings,
        })
    }
}

pub fn patient_id_of(patient_dir: &Path) -> String {
    patient_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| patient_dir.to_string_lossy().into_owned())
}
