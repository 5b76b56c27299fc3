pub mod config;
pub mod extraction;
pub mod llm;
pub mod query;
pub mod selection;
pub mod summary;
pub mod table;
pub mod warehouse;

pub use config::{create_run_dir, load_config, Config};
pub use extraction::{run_extraction, ExtractionPrompts};
pub use llm::{extract_with_retry, LlmClient, OpenAiClient};
pub use query::{build_candidate_pairs_query, regex_union};
pub use selection::{apply_selection, evaluate_row, RowFields, Verdict};
pub use summary::{render_summary, summarize_audit, OutputFormat, SelectionSummary};
pub use table::{Table, TableError};
pub use warehouse::{BigQueryClient, Warehouse};
