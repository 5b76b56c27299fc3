use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::llm::{extract_with_retry, LlmClient};
use crate::table::Table;

/// Expected extraction keys in flattening priority order. Keys observed at
/// runtime that are not listed here are appended after these, sorted.
const EXPECTED_CT_KEYS: [&str; 3] = ["CT_Regions", "CT_Contrast_Agent", "Lung_Nodules"];
const EXPECTED_PET_KEYS: [&str; 9] = [
    "Lung_Hypermetabolic_Regions",
    "Lymph_Nodes_Hypermetabolic_Regions",
    "Other_Hypermetabolic_Regions",
    "PET_Tracer",
    "PET_Scan_Region",
    "PET_Blood_Glucose_Level",
    "PET_Waiting_Time",
    "Clinical_Reason",
    "Primary_Diagnosis",
];

/// Prompt texts for the two per-pair extraction calls.
#[derive(Debug, Clone)]
pub struct ExtractionPrompts {
    pub ct: String,
    pub pet: String,
}

/// Run LLM extraction over every candidate pair in `table`.
///
/// Pairs are dispatched across a bounded worker pool (`llm.concurrency`
/// permits); within one pair the CT call runs before the PET call. A pair
/// whose retries are exhausted is recorded in the `extraction_error` column
/// with empty JSON objects and never aborts the batch. Completion order is
/// arbitrary, so results are re-sorted by original row index before being
/// attached; output row order always equals input row order.
///
/// Raw extraction objects are also written one file per study under
/// `output_dir/ct` and `output_dir/pet`, overwriting earlier files. These are
/// inspection artifacts, not resume checkpoints: every invocation re-calls
/// the LLM for every row it is given.
pub async fn run_extraction(
    table: &Table,
    client: Arc<dyn LlmClient>,
    prompts: &ExtractionPrompts,
    options: &LlmConfig,
    output_dir: &Path,
    max_rows: Option<usize>,
) -> Result<Table> {
    let ct_out_dir = output_dir.join("ct");
    let pet_out_dir = output_dir.join("pet");
    fs::create_dir_all(&ct_out_dir)
        .with_context(|| format!("failed to create {}", ct_out_dir.display()))?;
    fs::create_dir_all(&pet_out_dir)
        .with_context(|| format!("failed to create {}", pet_out_dir.display()))?;

    let mut table = table.clone();
    if let Some(max_rows) = max_rows {
        table.truncate(max_rows);
    }

    let prompts = Arc::new(prompts.clone());
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let retries = options.retries;
    info!(
        rows = table.len(),
        concurrency = options.concurrency.max(1),
        "dispatching extraction pairs"
    );

    let mut workers: JoinSet<(usize, Result<(Value, Value)>)> = JoinSet::new();
    for idx in 0..table.len() {
        let ct_report = table.cell(idx, "ct_report").unwrap_or("").to_string();
        let pt_report = table.cell(idx, "pt_report").unwrap_or("").to_string();
        let client = Arc::clone(&client);
        let prompts = Arc::clone(&prompts);
        let semaphore = Arc::clone(&semaphore);
        workers.spawn(async move {
            let result = async {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("extraction worker pool closed")?;
                let ct = extract_with_retry(client.as_ref(), &prompts.ct, &ct_report, retries)
                    .await
                    .context("CT extraction failed")?;
                let pet = extract_with_retry(client.as_ref(), &prompts.pet, &pt_report, retries)
                    .await
                    .context("PET extraction failed")?;
                Ok((ct, pet))
            }
            .await;
            (idx, result)
        });
    }

    let mut results: Vec<(usize, Map<String, Value>, Map<String, Value>, String)> =
        Vec::with_capacity(table.len());
    while let Some(joined) = workers.join_next().await {
        let (idx, result) = joined.context("extraction worker panicked")?;
        match result {
            Ok((ct, pet)) => {
                debug!(row = idx, "pair extracted");
                results.push((
                    idx,
                    ct.as_object().cloned().unwrap_or_default(),
                    pet.as_object().cloned().unwrap_or_default(),
                    String::new(),
                ));
            }
            Err(err) => {
                warn!(row = idx, error = %err, "pair extraction failed terminally");
                results.push((idx, Map::new(), Map::new(), format!("{err:#}")));
            }
        }
    }
    results.sort_by_key(|(idx, ..)| *idx);

    let ct_jsons: Vec<Map<String, Value>> = results.iter().map(|r| r.1.clone()).collect();
    let pet_jsons: Vec<Map<String, Value>> = results.iter().map(|r| r.2.clone()).collect();
    let errors: Vec<String> = results.iter().map(|r| r.3.clone()).collect();

    let ct_serialized = serialize_objects(&ct_jsons)?;
    let pet_serialized = serialize_objects(&pet_jsons)?;

    let mut out = table;
    out.push_column("ct_json", ct_serialized.clone())?;
    out.push_column("pet_json", pet_serialized.clone())?;
    out.push_column("extraction_error", errors)?;

    for key in ordered_keys(&ct_jsons, &EXPECTED_CT_KEYS) {
        let values = ct_jsons
            .iter()
            .map(|m| normalize_json_value(m.get(&key)))
            .collect();
        out.push_column(&format!("ct_{key}"), values)?;
    }
    for key in ordered_keys(&pet_jsons, &EXPECTED_PET_KEYS) {
        let values = pet_jsons
            .iter()
            .map(|m| normalize_json_value(m.get(&key)))
            .collect();
        out.push_column(&format!("pet_{key}"), values)?;
    }

    for idx in 0..out.len() {
        let ct_uid = non_empty_or(out.cell(idx, "ct_study_uid"), "unknown");
        let pt_uid = non_empty_or(out.cell(idx, "pt_study_uid"), "unknown");
        let ct_path = ct_out_dir.join(format!("{ct_uid}.json"));
        let pet_path = pet_out_dir.join(format!("{pt_uid}.json"));
        fs::write(&ct_path, &ct_serialized[idx])
            .with_context(|| format!("failed to write {}", ct_path.display()))?;
        fs::write(&pet_path, &pet_serialized[idx])
            .with_context(|| format!("failed to write {}", pet_path.display()))?;
    }

    Ok(out)
}

fn serialize_objects(objects: &[Map<String, Value>]) -> Result<Vec<String>> {
    objects
        .iter()
        .map(|m| serde_json::to_string(m).context("failed to serialize extraction object"))
        .collect()
}

fn non_empty_or<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => fallback,
    }
}

/// Merge the key sets observed across all rows into one ordered column list:
/// expected keys first (priority order, only if observed anywhere), then any
/// extra discovered keys in sorted order.
fn ordered_keys(values: &[Map<String, Value>], expected: &[&str]) -> Vec<String> {
    let discovered: BTreeSet<&str> = values
        .iter()
        .flat_map(|m| m.keys().map(String::as_str))
        .collect();
    let mut keys: Vec<String> = expected
        .iter()
        .filter(|k| discovered.contains(**k))
        .map(|k| k.to_string())
        .collect();
    keys.extend(
        discovered
            .iter()
            .filter(|k| !expected.contains(*k))
            .map(|k| k.to_string()),
    );
    keys
}

/// Flatten one extracted field into a CSV cell: nested structures as compact
/// JSON, nulls and missing values as the empty string.
fn normalize_json_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
