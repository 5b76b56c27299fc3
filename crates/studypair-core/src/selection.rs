use serde_json::{Map, Value};

use crate::table::Table;

/// Identifiers recorded in the audit trail, one per failed inclusion rule.
pub mod reasons {
    pub const EXTRACTION_ERROR: &str = "extraction_error";
    pub const CT_NOT_CHEST: &str = "ct_not_chest";
    pub const CT_CONTRAST_PRESENT: &str = "ct_contrast_present";
    pub const NO_LUNG_NODULES: &str = "no_lung_nodules";
    pub const PET_REASON_NOT_INDETERMINATE: &str = "pet_reason_not_indeterminate_nodule";
    pub const PET_DX_NOT_ALLOWED: &str = "pet_primary_dx_not_allowed";
    pub const PET_LYMPH_HYPERMETABOLIC: &str = "pet_lymph_hypermetabolic";
    pub const PET_OTHER_HYPERMETABOLIC: &str = "pet_other_hypermetabolic";
}

const ALLOWED_REASON: &str = "Indeterminate Pulmonary Nodule";
const ALLOWED_DIAGNOSES: [&str; 2] = ["Primary Lung Cancer", "No Cancer"];

/// The cells of one extracted row that classification reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowFields<'a> {
    pub extraction_error: &'a str,
    pub ct_json: &'a str,
    pub pet_json: &'a str,
}

/// Inclusion verdict for one candidate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub selected: bool,
    pub reasons: Vec<&'static str>,
}

/// Classify one extracted row. Pure and total: no I/O, no failure mode —
/// malformed or missing fields fail the relevant rule instead of erroring.
///
/// A row with a recorded extraction error is excluded with that single
/// reason. Otherwise every rule runs and every failure is recorded, so the
/// audit trail lists all violations rather than the first one.
pub fn evaluate_row(fields: &RowFields) -> Verdict {
    if !fields.extraction_error.trim().is_empty() {
        return Verdict {
            selected: false,
            reasons: vec![reasons::EXTRACTION_ERROR],
        };
    }

    let mut failed = Vec::new();
    let ct = parse_json_cell(fields.ct_json);
    let pet = parse_json_cell(fields.pet_json);

    if !contains_chest(ct.get("CT_Regions")) {
        failed.push(reasons::CT_NOT_CHEST);
    }
    let contrast = scalar_text(ct.get("CT_Contrast_Agent"));
    if !contrast.trim().eq_ignore_ascii_case("none") {
        failed.push(reasons::CT_CONTRAST_PRESENT);
    }
    if is_blank(ct.get("Lung_Nodules")) {
        failed.push(reasons::NO_LUNG_NODULES);
    }

    let clinical_reason = pet
        .get("Clinical_Reason")
        .and_then(Value::as_str)
        .unwrap_or("");
    if clinical_reason != ALLOWED_REASON {
        failed.push(reasons::PET_REASON_NOT_INDETERMINATE);
    }
    let primary_dx = pet
        .get("Primary_Diagnosis")
        .and_then(Value::as_str)
        .unwrap_or("");
    if !ALLOWED_DIAGNOSES.contains(&primary_dx) {
        failed.push(reasons::PET_DX_NOT_ALLOWED);
    }
    if !list_empty(pet.get("Lymph_Nodes_Hypermetabolic_Regions")) {
        failed.push(reasons::PET_LYMPH_HYPERMETABOLIC);
    }
    if !list_empty(pet.get("Other_Hypermetabolic_Regions")) {
        failed.push(reasons::PET_OTHER_HYPERMETABOLIC);
    }

    Verdict {
        selected: failed.is_empty(),
        reasons: failed,
    }
}

/// Split an extracted table into (selected rows, audit log).
///
/// The selected table keeps the original columns; the audit table carries one
/// row per input row with identifiers, the boolean verdict, and the failed
/// rules joined with `;`.
pub fn apply_selection(table: &Table) -> Result<(Table, Table), crate::table::TableError> {
    let mut selected_indices = Vec::new();
    let mut audit = Table::new(vec![
        "pt_study_uid".into(),
        "ct_study_uid".into(),
        "patient_id".into(),
        "selected".into(),
        "reasons".into(),
    ]);

    for idx in 0..table.len() {
        let fields = RowFields {
            extraction_error: table.cell(idx, "extraction_error").unwrap_or(""),
            ct_json: table.cell(idx, "ct_json").unwrap_or(""),
            pet_json: table.cell(idx, "pet_json").unwrap_or(""),
        };
        let verdict = evaluate_row(&fields);
        audit.push_row(vec![
            table.cell(idx, "pt_study_uid").unwrap_or("").to_string(),
            table.cell(idx, "ct_study_uid").unwrap_or("").to_string(),
            table.cell(idx, "patient_id").unwrap_or("").to_string(),
            verdict.selected.to_string(),
            verdict.reasons.join(";"),
        ])?;
        if verdict.selected {
            selected_indices.push(idx);
        }
    }

    Ok((table.subset(&selected_indices), audit))
}

/// Lenient JSON-cell parse: an empty or unparsable cell, or one that parses
/// to a non-object, yields an empty mapping so its fields read as absent.
fn parse_json_cell(cell: &str) -> Map<String, Value> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn scalar_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn contains_chest(regions: Option<&Value>) -> bool {
    let Some(Value::Array(entries)) = regions else {
        return false;
    };
    entries
        .iter()
        .filter_map(Value::as_str)
        .any(|r| r.to_lowercase().contains("chest"))
}

/// Truthiness-style emptiness for the lung-nodule field: absent, null, empty
/// collection/string, zero, and false all count as "no nodules".
fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Bool(b)) => !b,
    }
}

/// Emptiness for hypermetabolic-findings fields. A cell may hold a native
/// list or a serialized one; absent, null, blank, and empty-list forms are
/// empty. A non-list value that fails to parse as JSON is treated as a
/// finding (non-empty), so malformed output fails the rule rather than
/// silently passing it.
fn list_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return true;
            }
            matches!(
                serde_json::from_str::<Value>(trimmed),
                Ok(Value::Array(items)) if items.is_empty()
            )
        }
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn row<'a>(ct: &'a str, pet: &'a str) -> RowFields<'a> {
        RowFields {
            extraction_error: "",
            ct_json: ct,
            pet_json: pet,
        }
    }

    fn passing_ct() -> String {
        json!({
            "CT_Regions": ["Chest", "Abdomen"],
            "CT_Contrast_Agent": "None",
            "Lung_Nodules": [{"size_mm": "8"}]
        })
        .to_string()
    }

    fn passing_pet() -> String {
        json!({
            "Clinical_Reason": "Indeterminate Pulmonary Nodule",
            "Primary_Diagnosis": "No Cancer",
            "Lymph_Nodes_Hypermetabolic_Regions": [],
            "Other_Hypermetabolic_Regions": []
        })
        .to_string()
    }

    #[test]
    fn fully_conforming_row_is_selected() {
        let ct = passing_ct();
        let pet = passing_pet();
        let verdict = evaluate_row(&row(&ct, &pet));
        assert!(verdict.selected);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn extraction_error_short_circuits_all_other_rules() {
        let fields = RowFields {
            extraction_error: "OpenAI API error (500)",
            ct_json: "",
            pet_json: "",
        };
        let verdict = evaluate_row(&fields);
        assert!(!verdict.selected);
        assert_eq!(verdict.reasons, [reasons::EXTRACTION_ERROR]);
    }

    #[test]
    fn contrast_agent_other_than_none_is_the_only_failure() {
        let ct = json!({
            "CT_Regions": ["Chest"],
            "CT_Contrast_Agent": "Iodine",
            "Lung_Nodules": [{"size_mm": "8"}]
        })
        .to_string();
        let pet = passing_pet();
        let verdict = evaluate_row(&row(&ct, &pet));
        assert!(!verdict.selected);
        assert_eq!(verdict.reasons, [reasons::CT_CONTRAST_PRESENT]);
    }

    #[test]
    fn multiple_failures_are_all_recorded() {
        let ct = json!({
            "CT_Regions": ["Chest"],
            "CT_Contrast_Agent": "none ",
            "Lung_Nodules": []
        })
        .to_string();
        let pet = json!({
            "Clinical_Reason": "Indeterminate Pulmonary Nodule",
            "Primary_Diagnosis": "No Cancer",
            "Lymph_Nodes_Hypermetabolic_Regions": [{"size_mm": "5"}],
            "Other_Hypermetabolic_Regions": []
        })
        .to_string();
        let verdict = evaluate_row(&row(&ct, &pet));
        assert_eq!(
            verdict.reasons,
            [reasons::NO_LUNG_NODULES, reasons::PET_LYMPH_HYPERMETABOLIC]
        );
    }

    #[test]
    fn chest_match_is_case_insensitive_substring() {
        let ct = json!({
            "CT_Regions": ["chest/lung"],
            "CT_Contrast_Agent": "NONE",
            "Lung_Nodules": [{"size_mm": "4"}]
        })
        .to_string();
        let pet = passing_pet();
        assert!(evaluate_row(&row(&ct, &pet)).selected);

        let ct = json!({
            "CT_Regions": ["Abdomen"],
            "CT_Contrast_Agent": "None",
            "Lung_Nodules": [{"size_mm": "4"}]
        })
        .to_string();
        let verdict = evaluate_row(&row(&ct, &pet));
        assert_eq!(verdict.reasons, [reasons::CT_NOT_CHEST]);
    }

    #[test]
    fn disallowed_diagnosis_and_reason_fail_their_rules() {
        let ct = passing_ct();
        let pet = json!({
            "Clinical_Reason": "Cancer Patient Monitoring",
            "Primary_Diagnosis": "Lymphoma",
            "Lymph_Nodes_Hypermetabolic_Regions": [],
            "Other_Hypermetabolic_Regions": []
        })
        .to_string();
        let verdict = evaluate_row(&row(&ct, &pet));
        assert_eq!(
            verdict.reasons,
            [
                reasons::PET_REASON_NOT_INDETERMINATE,
                reasons::PET_DX_NOT_ALLOWED
            ]
        );
    }

    #[test]
    fn findings_cells_accept_serialized_and_blank_empty_forms() {
        let ct = passing_ct();
        let pet = json!({
            "Clinical_Reason": "Indeterminate Pulmonary Nodule",
            "Primary_Diagnosis": "Primary Lung Cancer",
            "Lymph_Nodes_Hypermetabolic_Regions": "[]",
            "Other_Hypermetabolic_Regions": "  "
        })
        .to_string();
        assert!(evaluate_row(&row(&ct, &pet)).selected);
    }

    #[test]
    fn malformed_findings_cell_counts_as_present() {
        let ct = passing_ct();
        let pet = json!({
            "Clinical_Reason": "Indeterminate Pulmonary Nodule",
            "Primary_Diagnosis": "No Cancer",
            "Lymph_Nodes_Hypermetabolic_Regions": "{broken json",
            "Other_Hypermetabolic_Regions": []
        })
        .to_string();
        let verdict = evaluate_row(&row(&ct, &pet));
        assert_eq!(verdict.reasons, [reasons::PET_LYMPH_HYPERMETABOLIC]);
    }

    #[test]
    fn malformed_json_cells_fail_rules_without_erroring() {
        let verdict = evaluate_row(&row("not json", "also not json"));
        assert!(!verdict.selected);
        assert_eq!(
            verdict.reasons,
            [
                reasons::CT_NOT_CHEST,
                reasons::CT_CONTRAST_PRESENT,
                reasons::NO_LUNG_NODULES,
                reasons::PET_REASON_NOT_INDETERMINATE,
                reasons::PET_DX_NOT_ALLOWED
            ]
        );
    }

    #[test]
    fn evaluation_is_idempotent() {
        let ct = passing_ct();
        let pet = json!({
            "Clinical_Reason": "Staging of New Primary Cancer",
            "Primary_Diagnosis": "No Cancer"
        })
        .to_string();
        let fields = row(&ct, &pet);
        assert_eq!(evaluate_row(&fields), evaluate_row(&fields));
    }

    #[test]
    fn apply_selection_splits_rows_and_builds_audit() {
        let ct_pass = passing_ct();
        let pet_pass = passing_pet();
        let ct_fail = json!({
            "CT_Regions": ["Chest"],
            "CT_Contrast_Agent": "Iodine",
            "Lung_Nodules": [{"size_mm": "8"}]
        })
        .to_string();

        let table = Table::from_rows(
            vec![
                "patient_id".into(),
                "pt_study_uid".into(),
                "ct_study_uid".into(),
                "ct_json".into(),
                "pet_json".into(),
                "extraction_error".into(),
            ],
            vec![
                vec![
                    "p1".into(),
                    "pt1".into(),
                    "ct1".into(),
                    ct_pass.clone(),
                    pet_pass.clone(),
                    "".into(),
                ],
                vec![
                    "p2".into(),
                    "pt2".into(),
                    "ct2".into(),
                    ct_fail,
                    pet_pass.clone(),
                    "".into(),
                ],
                vec![
                    "p3".into(),
                    "pt3".into(),
                    "ct3".into(),
                    ct_pass,
                    pet_pass,
                    "timeout".into(),
                ],
            ],
        )
        .unwrap();

        let (selected, audit) = apply_selection(&table).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected.cell(0, "patient_id"), Some("p1"));
        assert_eq!(selected.columns(), table.columns());

        assert_eq!(audit.len(), 3);
        assert_eq!(audit.cell(0, "selected"), Some("true"));
        assert_eq!(audit.cell(0, "reasons"), Some(""));
        assert_eq!(audit.cell(1, "selected"), Some("false"));
        assert_eq!(audit.cell(1, "reasons"), Some("ct_contrast_present"));
        assert_eq!(audit.cell(2, "reasons"), Some("extraction_error"));
        assert_eq!(audit.cell(2, "pt_study_uid"), Some("pt3"));
    }

    proptest! {
        /// Selection is total and deterministic over arbitrary cell contents.
        #[test]
        fn evaluate_row_never_panics_and_is_deterministic(
            error in ".{0,12}",
            ct in ".{0,64}",
            pet in ".{0,64}",
        ) {
            let fields = RowFields {
                extraction_error: &error,
                ct_json: &ct,
                pet_json: &pet,
            };
            let first = evaluate_row(&fields);
            let second = evaluate_row(&fields);
            prop_assert_eq!(&first, &second);
            if !error.trim().is_empty() {
                prop_assert_eq!(first.reasons, vec![reasons::EXTRACTION_ERROR]);
            }
        }
    }
}
