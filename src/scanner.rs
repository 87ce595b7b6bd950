//! Batch duplicate detection over existing stores.
//!
//! The scanner groups stored records by canonical identifier, describes
//! each group (do the names, dates of birth and genders agree?), decides
//! how a group could be resolved, and reports data-quality problems. It
//! never writes to a store; acting on a plan is the cleanup orchestrator's
//! job.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::SeverityThresholds;
use crate::document::DocumentRecord;
use crate::error::{LedgerError, LedgerResult, Severity};
use crate::identifier::DocumentType;
use crate::storage::{documents, SqliteStore, Stores};

/// How much the members of a duplicate group agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAnalysis {
    /// All present names are equal ignoring case and surrounding spaces.
    pub same_name: bool,
    /// All present dates of birth are equal.
    pub same_dob: bool,
    /// All present genders are equal ignoring case.
    pub same_gender: bool,
    /// Distinct upper-cased names.
    pub unique_names: Vec<String>,
    /// Mean extraction confidence.
    pub avg_confidence: f64,
    /// Oldest member.
    pub earliest: DateTime<Utc>,
    /// Newest member.
    pub latest: DateTime<Utc>,
}

/// Records sharing one canonical identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Store the group was found in.
    pub document_type: DocumentType,
    /// Shared canonical identifier.
    pub canonical_identifier: String,
    /// Members, oldest first.
    pub members: Vec<DocumentRecord>,
    /// Agreement summary.
    pub analysis: GroupAnalysis,
}

impl DuplicateGroup {
    /// Number of records in the group.
    #[must_use]
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// How a group is to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// Same name and date of birth: keep the best record.
    TrivialDuplicate,
    /// Same name, other fields differ: keep the most confident record.
    NameVariation,
    /// Names differ: a person has to decide.
    ManualReview,
}

/// Planned outcome for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResolution {
    /// Store.
    pub document_type: DocumentType,
    /// Shared identifier.
    pub canonical_identifier: String,
    /// Classification.
    pub kind: ResolutionKind,
    /// Survivor, for auto-resolved groups.
    pub keep: Option<DocumentRecord>,
    /// Records to delete, for auto-resolved groups.
    pub remove: Vec<DocumentRecord>,
    /// Untouched records, for manual-review groups.
    pub manual_review: Vec<DocumentRecord>,
    /// Why this classification was chosen.
    pub reason: String,
}

impl GroupResolution {
    /// True unless the group needs manual review.
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        self.kind != ResolutionKind::ManualReview
    }
}

/// Resolutions for a set of groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupPlan {
    /// One entry per group.
    pub resolutions: Vec<GroupResolution>,
}

impl CleanupPlan {
    /// Groups that will be resolved automatically.
    pub fn automatic(&self) -> impl Iterator<Item = &GroupResolution> {
        self.resolutions.iter().filter(|r| r.is_automatic())
    }

    /// Groups left for manual review.
    pub fn manual(&self) -> impl Iterator<Item = &GroupResolution> {
        self.resolutions.iter().filter(|r| !r.is_automatic())
    }

    /// Survivors across automatic groups.
    #[must_use]
    pub fn records_to_keep(&self) -> usize {
        self.automatic().filter(|r| r.keep.is_some()).count()
    }

    /// Deletions across automatic groups.
    #[must_use]
    pub fn records_to_remove(&self) -> usize {
        self.automatic().map(|r| r.remove.len()).sum()
    }
}

/// Category of a data-quality finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssueKind {
    /// Canonical identifier has the wrong shape.
    MalformedIdentifier,
    /// No identifier at all.
    MissingIdentifier,
    /// No name.
    MissingName,
}

/// A data-quality finding for one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    /// Store.
    pub document_type: DocumentType,
    /// Category.
    pub kind: QualityIssueKind,
    /// Affected records.
    pub count: usize,
    /// Up to [`MAX_EXAMPLES`] affected fields-row ids.
    pub field_ids: Vec<i64>,
    /// Human-readable description.
    pub description: String,
}

/// Example ids kept per quality issue.
pub const MAX_EXAMPLES: usize = 20;

/// Scan result for one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreScan {
    /// Store.
    pub document_type: DocumentType,
    /// Store file.
    pub store: PathBuf,
    /// False when the store or its tables do not exist.
    pub scanned: bool,
    /// Records examined.
    pub total_records: usize,
    /// Duplicate groups, largest first.
    pub groups: Vec<DuplicateGroup>,
    /// Quality findings.
    pub quality_issues: Vec<QualityIssue>,
}

/// Headline numbers for a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Groups per store.
    pub duplicate_groups: BTreeMap<DocumentType, usize>,
    /// Records in groups per store.
    pub duplicate_records: BTreeMap<DocumentType, usize>,
    /// Quality findings across stores.
    pub quality_issues: usize,
    /// Overall severity.
    pub severity: Severity,
}

/// A full scan of both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// When the scan ran.
    pub scan_timestamp: DateTime<Utc>,
    /// Per-store results.
    pub stores: Vec<StoreScan>,
    /// Headline numbers.
    pub summary: ScanSummary,
}

impl ScanReport {
    fn stamp(&self) -> String {
        self.scan_timestamp.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Writes `duplicate_scan_report_<timestamp>.json` into `dir`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_json(&self, dir: &Path) -> LedgerResult<PathBuf> {
        let path = dir.join(format!("duplicate_scan_report_{}.json", self.stamp()));
        write_file(dir, &path, &serde_json::to_vec_pretty(self)?)?;
        tracing::info!(path = %path.display(), "scan report written");
        Ok(path)
    }

    /// Writes `duplicate_summary_<timestamp>.csv` into `dir`, one row per group.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_csv(&self, dir: &Path) -> LedgerResult<PathBuf> {
        let path = dir.join(format!("duplicate_summary_{}.csv", self.stamp()));
        write_file(dir, &path, self.to_csv().as_bytes())?;
        tracing::info!(path = %path.display(), "scan summary written");
        Ok(path)
    }

    /// CSV rendering of the duplicate groups.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::from("Type,Identifier,Duplicate_Count,Same_Name,Same_DOB,Avg_Confidence,Date_Range\n");
        for group in self.stores.iter().flat_map(|s| &s.groups) {
            let a = &group.analysis;
            let range = format!("{} to {}", a.earliest.format("%Y-%m-%d"), a.latest.format("%Y-%m-%d"));
            let _ = writeln!(
                out,
                "{},{},{},{},{},{:.3},{}",
                csv_field(group.document_type.label()),
                csv_field(&group.canonical_identifier),
                group.size(),
                a.same_name,
                a.same_dob,
                a.avg_confidence,
                csv_field(&range),
            );
        }
        out
    }

    /// Total groups across stores.
    #[must_use]
    pub fn total_groups(&self) -> usize {
        self.summary.duplicate_groups.values().sum()
    }
}

fn write_file(dir: &Path, path: &Path, bytes: &[u8]) -> LedgerResult<()> {
    fs::create_dir_all(dir).map_err(|e| LedgerError::io(format!("creating {}", dir.display()), e))?;
    fs::write(path, bytes).map_err(|e| LedgerError::io(format!("writing {}", path.display()), e))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Survivor order: highest confidence, then most recent, then highest row id.
fn rank(a: &DocumentRecord, b: &DocumentRecord) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.field_id.cmp(&a.field_id))
}

fn distinct<'a>(values: impl Iterator<Item = Option<&'a str>>, fold_case: bool) -> BTreeSet<String> {
    values
        .flatten()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| if fold_case { v.to_uppercase() } else { v.to_string() })
        .collect()
}

/// Describes how much the members of a group agree.
///
/// Missing values do not count as a distinct value.
#[must_use]
pub fn analyze(members: &[DocumentRecord]) -> GroupAnalysis {
    let names = distinct(members.iter().map(|m| m.fields.name.as_deref()), true);
    let dobs = distinct(members.iter().map(|m| m.fields.dob.as_deref()), false);
    let genders = distinct(members.iter().map(|m| m.fields.gender.as_deref()), true);

    #[allow(clippy::cast_precision_loss)]
    let avg_confidence = if members.is_empty() {
        0.0
    } else {
        members.iter().map(|m| m.confidence).sum::<f64>() / members.len() as f64
    };

    GroupAnalysis {
        same_name: names.len() <= 1,
        same_dob: dobs.len() <= 1,
        same_gender: genders.len() <= 1,
        unique_names: names.into_iter().collect(),
        avg_confidence,
        earliest: members.iter().map(|m| m.created_at).min().unwrap_or_default(),
        latest: members.iter().map(|m| m.created_at).max().unwrap_or_default(),
    }
}

/// Groups records by canonical identifier, keeping groups of two or more.
///
/// Records without an identifier are never grouped. Groups come back
/// largest first, then by identifier; members oldest first.
#[must_use]
pub fn group_records(document_type: DocumentType, records: &[DocumentRecord]) -> Vec<DuplicateGroup> {
    let mut by_identifier: BTreeMap<&str, Vec<DocumentRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.canonical_identifier.is_empty()) {
        by_identifier
            .entry(record.canonical_identifier.as_str())
            .or_default()
            .push(record.clone());
    }

    let mut groups: Vec<DuplicateGroup> = by_identifier
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(identifier, mut members)| {
            members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.field_id.cmp(&b.field_id)));
            DuplicateGroup {
                document_type,
                canonical_identifier: identifier.to_string(),
                analysis: analyze(&members),
                members,
            }
        })
        .collect();
    groups.sort_by(|a, b| b.size().cmp(&a.size()).then_with(|| a.canonical_identifier.cmp(&b.canonical_identifier)));
    groups
}

/// Decides how a group is resolved.
#[must_use]
pub fn classify(group: &DuplicateGroup) -> GroupResolution {
    let a = &group.analysis;
    let (kind, reason) = if a.same_name && a.same_dob {
        (ResolutionKind::TrivialDuplicate, "same name and date of birth".to_string())
    } else if a.same_name {
        (
            ResolutionKind::NameVariation,
            "same name, other fields differ; keeping the most confident record".to_string(),
        )
    } else {
        (
            ResolutionKind::ManualReview,
            format!("{} different names: {}", a.unique_names.len(), a.unique_names.join(" / ")),
        )
    };

    let mut resolution = GroupResolution {
        document_type: group.document_type,
        canonical_identifier: group.canonical_identifier.clone(),
        kind,
        keep: None,
        remove: Vec::new(),
        manual_review: Vec::new(),
        reason,
    };

    if kind == ResolutionKind::ManualReview {
        resolution.manual_review = group.members.clone();
    } else {
        let mut ranked = group.members.clone();
        ranked.sort_by(rank);
        let mut ranked = ranked.into_iter();
        resolution.keep = ranked.next();
        resolution.remove = ranked.collect();
    }
    resolution
}

/// Classifies every group.
#[must_use]
pub fn plan(groups: &[DuplicateGroup]) -> CleanupPlan {
    CleanupPlan {
        resolutions: groups.iter().map(classify).collect(),
    }
}

/// Malformed identifiers, missing identifiers and missing names.
#[must_use]
pub fn quality_issues(document_type: DocumentType, records: &[DocumentRecord]) -> Vec<QualityIssue> {
    let mut malformed = Vec::new();
    let mut missing_identifier = Vec::new();
    let mut missing_name = Vec::new();

    for record in records {
        if record.canonical_identifier.is_empty() {
            missing_identifier.push(record.field_id);
        } else if !document_type.is_well_formed(&record.canonical_identifier) {
            malformed.push(record.field_id);
        }
        if record.fields.name_trimmed().is_none() {
            missing_name.push(record.field_id);
        }
    }

    [
        (
            QualityIssueKind::MalformedIdentifier,
            malformed,
            format!("{} numbers with an invalid format", document_type.label()),
        ),
        (
            QualityIssueKind::MissingIdentifier,
            missing_identifier,
            format!("records without a {} number", document_type.label()),
        ),
        (QualityIssueKind::MissingName, missing_name, "records without a name".to_string()),
    ]
    .into_iter()
    .filter(|(_, ids, _)| !ids.is_empty())
    .map(|(kind, ids, description)| QualityIssue {
        document_type,
        kind,
        count: ids.len(),
        field_ids: ids.into_iter().take(MAX_EXAMPLES).collect(),
        description,
    })
    .collect()
}

/// Rates a scan by its largest per-store group count.
#[must_use]
pub fn severity(thresholds: SeverityThresholds, groups_per_store: impl IntoIterator<Item = usize>) -> Severity {
    let worst = groups_per_store.into_iter().max().unwrap_or(0);
    if worst > thresholds.high_above {
        Severity::High
    } else if worst > thresholds.medium_above {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Read-only scanner over the document stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateScanner {
    thresholds: SeverityThresholds,
}

impl DuplicateScanner {
    /// Scanner rating severity with `thresholds`.
    #[must_use]
    pub const fn new(thresholds: SeverityThresholds) -> Self {
        Self { thresholds }
    }

    /// Every record in `store`, or `None` if the store or its tables are missing.
    fn load(store: &SqliteStore) -> LedgerResult<Option<Vec<DocumentRecord>>> {
        let dt = store.document_type();
        let Some(conn) = store.connect_read_only()? else {
            return Ok(None);
        };
        if !documents::has_tables(&conn, dt)? {
            return Ok(None);
        }
        documents::load_all(&conn, dt).map(Some)
    }

    /// Duplicate groups in one store.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn scan(&self, store: &SqliteStore) -> LedgerResult<Vec<DuplicateGroup>> {
        Ok(Self::load(store)?
            .map(|records| group_records(store.document_type(), &records))
            .unwrap_or_default())
    }

    /// Groups and quality findings for one store.
    ///
    /// # Errors
    /// Propagates store failures.
    #[instrument(skip_all, fields(store = %store.path().display()))]
    pub fn scan_store(&self, store: &SqliteStore) -> LedgerResult<StoreScan> {
        let dt = store.document_type();
        let Some(records) = Self::load(store)? else {
            tracing::warn!("store or document tables missing, skipping");
            return Ok(StoreScan {
                document_type: dt,
                store: store.path().to_path_buf(),
                scanned: false,
                total_records: 0,
                groups: Vec::new(),
                quality_issues: Vec::new(),
            });
        };

        let groups = group_records(dt, &records);
        let issues = quality_issues(dt, &records);
        tracing::info!(records = records.len(), groups = groups.len(), issues = issues.len(), "store scanned");
        Ok(StoreScan {
            document_type: dt,
            store: store.path().to_path_buf(),
            scanned: true,
            total_records: records.len(),
            groups,
            quality_issues: issues,
        })
    }

    /// Scans both stores and summarizes.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn full_scan(&self, stores: &Stores) -> LedgerResult<ScanReport> {
        let scans = stores.iter().map(|s| self.scan_store(s)).collect::<LedgerResult<Vec<_>>>()?;

        let duplicate_groups: BTreeMap<_, _> = scans.iter().map(|s| (s.document_type, s.groups.len())).collect();
        let duplicate_records = scans
            .iter()
            .map(|s| (s.document_type, s.groups.iter().map(DuplicateGroup::size).sum()))
            .collect();
        let summary = ScanSummary {
            severity: severity(self.thresholds, duplicate_groups.values().copied()),
            duplicate_groups,
            duplicate_records,
            quality_issues: scans.iter().map(|s| s.quality_issues.len()).sum(),
        };

        Ok(ScanReport {
            scan_timestamp: Utc::now(),
            stores: scans,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ExtractedFields;
    use chrono::TimeZone;

    fn record(field_id: i64, identifier: &str, name: &str, dob: &str, confidence: f64, day: u32) -> DocumentRecord {
        DocumentRecord {
            field_id,
            document_id: field_id,
            document_type: DocumentType::Aadhaar,
            identifier: identifier.to_string(),
            canonical_identifier: DocumentType::Aadhaar.normalize(identifier),
            fields: ExtractedFields::new(name, identifier).with_dob(dob),
            confidence,
            user_id: None,
            source_path: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_identical_records_form_trivial_group() {
        let records = vec![
            record(1, "123456789012", "X", "01/01/2000", 1.0, 1),
            record(2, "123456789012", "X", "01/01/2000", 1.0, 2),
        ];
        let groups = group_records(DocumentType::Aadhaar, &records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].size(), 2);
        assert!(groups[0].analysis.same_name);
        assert!(groups[0].analysis.same_dob);

        let resolution = classify(&groups[0]);
        assert_eq!(resolution.kind, ResolutionKind::TrivialDuplicate);
        // Equal confidence: the most recent record survives.
        assert_eq!(resolution.keep.as_ref().unwrap().field_id, 2);
        assert_eq!(resolution.remove.len(), 1);
    }

    #[test]
    fn test_grouping_uses_canonical_form() {
        let records = vec![
            record(1, "1234 5678 9012", "Asha", "", 0.5, 1),
            record(2, "1234-5678-9012", "asha ", "", 0.9, 2),
            record(3, "999988887777", "Ravi", "", 0.9, 3),
            record(4, "", "Nobody", "", 0.9, 4),
            record(5, "", "Nobody", "", 0.9, 5),
        ];
        let groups = group_records(DocumentType::Aadhaar, &records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical_identifier, "123456789012");
        assert!(groups[0].analysis.same_name);
        assert_eq!(groups[0].analysis.unique_names, vec!["ASHA"]);
    }

    #[test]
    fn test_name_variation_keeps_most_confident() {
        let records = vec![
            record(1, "123456789012", "Asha", "01/01/1990", 0.95, 1),
            record(2, "123456789012", "ASHA", "01/01/1991", 0.60, 2),
            record(3, "123456789012", "Asha", "01/01/1992", 0.70, 3),
        ];
        let group = &group_records(DocumentType::Aadhaar, &records)[0];
        let resolution = classify(group);
        assert_eq!(resolution.kind, ResolutionKind::NameVariation);
        assert_eq!(resolution.keep.as_ref().unwrap().field_id, 1);
        assert_eq!(resolution.remove.len(), 2);
        assert_eq!(1 + resolution.remove.len(), group.size());
    }

    #[test]
    fn test_different_names_need_review() {
        let records = vec![
            record(1, "123456789012", "Asha", "01/01/1990", 0.9, 1),
            record(2, "123456789012", "Ravi", "01/01/1990", 0.9, 2),
        ];
        let plan = plan(&group_records(DocumentType::Aadhaar, &records));
        assert_eq!(plan.records_to_remove(), 0);
        assert_eq!(plan.records_to_keep(), 0);
        let manual: Vec<_> = plan.manual().collect();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].manual_review.len(), 2);
        assert!(manual[0].keep.is_none());
    }

    #[test]
    fn test_analysis_statistics() {
        let members = vec![
            record(1, "123456789012", "Asha", "", 0.5, 3),
            record(2, "123456789012", "Asha", "", 1.0, 1),
        ];
        let analysis = analyze(&members);
        assert!((analysis.avg_confidence - 0.75).abs() < 1e-9);
        assert_eq!(analysis.earliest, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(analysis.latest, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        assert!(analysis.same_gender);
    }

    #[test]
    fn test_quality_issues() {
        let records = vec![
            record(1, "12345", "Asha", "", 0.5, 1),
            record(2, "", "Ravi", "", 0.5, 1),
            record(3, "123456789012", " ", "", 0.5, 1),
        ];
        let issues = quality_issues(DocumentType::Aadhaar, &records);
        let kinds: Vec<_> = issues.iter().map(|i| (i.kind, i.count)).collect();
        assert_eq!(
            kinds,
            vec![
                (QualityIssueKind::MalformedIdentifier, 1),
                (QualityIssueKind::MissingIdentifier, 1),
                (QualityIssueKind::MissingName, 1),
            ]
        );
    }

    #[test]
    fn test_severity_thresholds() {
        let t = SeverityThresholds::default();
        assert_eq!(severity(t, [0, 5]), Severity::Low);
        assert_eq!(severity(t, [6, 0]), Severity::Medium);
        assert_eq!(severity(t, [3, 11]), Severity::High);
        assert_eq!(severity(t, []), Severity::Low);
    }

    #[test]
    fn test_csv_quotes_fields() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
