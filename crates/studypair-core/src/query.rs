use anyhow::{bail, Result};

use crate::config::Config;

/// Join a term list into a single case-folded alternation group suitable for
/// `REGEXP_CONTAINS` against upper-cased report text. Empty input renders an
/// empty string.
pub fn regex_union(terms: &[String]) -> String {
    let escaped: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| regex::escape(&t.to_uppercase()))
        .collect();
    if escaped.is_empty() {
        return String::new();
    }
    format!("({})", escaped.join("|"))
}

/// Render the warehouse SQL that pairs each PET/CT study with the closest
/// preceding CT-only study of the same patient within `selection.max_days`,
/// keeping only chest, non-contrast, non-screening CT studies and PET reports
/// matching the configured term list.
pub fn build_candidate_pairs_query(cfg: &Config, sample_limit: Option<usize>) -> Result<String> {
    let selection = &cfg.selection;

    let pet_regex = regex_union(&selection.pet_report_terms);
    let chest_regex = regex_union(&selection.ct_chest_terms);
    let noncontrast_regex = regex_union(&selection.ct_noncontrast_terms);
    let with_contrast_regex = regex_union(&selection.ct_with_contrast_terms);
    let exclude_regex = regex_union(&selection.ct_exclude_terms);
    let max_days = selection.max_days;

    let (Some(project), Some(dataset), Some(table)) = (
        cfg.bigquery.project.as_deref(),
        cfg.bigquery.dataset.as_deref(),
        cfg.bigquery.table.as_deref(),
    ) else {
        bail!("bigquery.project, bigquery.dataset and bigquery.table are required");
    };

    let source = format!("`{project}.{dataset}.{table}`");
    let limit_clause = sample_limit
        .map(|limit| format!("LIMIT {limit}"))
        .unwrap_or_default();

    Ok(format!(
        r#"
WITH study_mods AS (
  SELECT
    study_uid,
    patient_id,
    study_date,
    ARRAY_AGG(DISTINCT s.modality) AS modalities
  FROM {source}, UNNEST(series) AS s
  GROUP BY study_uid, patient_id, study_date
),
petct AS (
  SELECT study_uid, patient_id, study_date
  FROM study_mods
  WHERE 'PT' IN UNNEST(modalities)
    AND 'CT' IN UNNEST(modalities)
),
petct_dates AS (
  SELECT
    t.study_uid,
    t.patient_id,
    COALESCE(MAX(CASE WHEN s.modality='PT' THEN s.acquisition_date END), t.study_date) AS pet_date,
    t.deid_english_report AS pt_report
  FROM {source} t
  JOIN petct p ON p.study_uid = t.study_uid
  JOIN UNNEST(t.series) AS s
  GROUP BY t.study_uid, t.patient_id, t.study_date, t.deid_english_report
),
ct_only AS (
  SELECT
    t.study_uid,
    t.patient_id,
    t.study_date,
    t.deid_english_report AS ct_report,
    s.acquisition_date AS ct_acq_date,
    s.series_description,
    s.body_part_examined
  FROM {source} t
  JOIN study_mods m ON m.study_uid = t.study_uid
  JOIN UNNEST(t.series) AS s
  WHERE ARRAY_LENGTH(m.modalities) = 1
    AND m.modalities[OFFSET(0)] = 'CT'
    AND s.modality = 'CT'
),
ct_only_agg AS (
  SELECT
    study_uid,
    patient_id,
    COALESCE(MAX(ct_acq_date), MAX(study_date)) AS ct_date,
    ANY_VALUE(ct_report) AS ct_report,
    LOGICAL_OR(REGEXP_CONTAINS(UPPER(body_part_examined), r'{chest_regex}')) AS body_part_chest,
    LOGICAL_OR(REGEXP_CONTAINS(UPPER(ct_report), r'{chest_regex}')) AS report_chest,
    LOGICAL_OR(REGEXP_CONTAINS(UPPER(ct_report), r'{exclude_regex}')) AS report_screen,
    LOGICAL_OR(REGEXP_CONTAINS(UPPER(ct_report), r'{with_contrast_regex}')) AS report_with_contrast,
    LOGICAL_OR(REGEXP_CONTAINS(UPPER(ct_report), r'{noncontrast_regex}')) AS report_without_contrast
  FROM ct_only
  GROUP BY study_uid, patient_id
),
ct_candidate_studies AS (
  SELECT *
  FROM ct_only_agg
  WHERE (body_part_chest OR report_chest)
    AND NOT report_screen
    AND NOT report_with_contrast
    AND report_without_contrast
),
paired AS (
  SELECT
    p.study_uid AS pt_study_uid,
    p.patient_id,
    p.pet_date,
    p.pt_report,
    c.study_uid AS ct_study_uid,
    c.ct_date,
    c.ct_report,
    DATE_DIFF(p.pet_date, c.ct_date, DAY) AS days_between
  FROM petct_dates p
  JOIN ct_candidate_studies c
    ON p.patient_id = c.patient_id
   AND c.ct_date < p.pet_date
   AND c.ct_date >= DATE_SUB(p.pet_date, INTERVAL {max_days} DAY)
  QUALIFY ROW_NUMBER() OVER (PARTITION BY p.study_uid ORDER BY days_between) = 1
)
SELECT * FROM paired
WHERE REGEXP_CONTAINS(UPPER(pt_report), r'{pet_regex}')
{limit_clause}
"#
    ))
}
