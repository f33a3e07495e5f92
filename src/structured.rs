//! Structured query engine: deterministic, re-checkable computation over
//! tabular documents.
//!
//! Four-phase protocol:
//!
//! - **Generate** — prompt an LLM (temperature 0, fixed seed) for pandas
//!   code over the pre-bound dataframe, with hard rules against the known
//!   spreadsheet-analysis failure modes: double counting a total column,
//!   summing across unrelated metric columns, substring filter bleed, and
//!   re-aggregating subtotal rows.
//! - **Gate** — deny-list scan of the generated code; any match aborts
//!   before dispatch.
//! - **Execute** — ship approved code to the external execution service
//!   holding the dataframe; this engine never runs code itself.
//! - **Interpret / fall back** — a strictly separate prompt formats the
//!   already-computed result and must never re-derive the number. Any
//!   failure along the way drops to a manual-analysis prompt over the
//!   schema and row sample, flagged low-confidence in metadata only.
//!
//! State machine: `Generating → (unsafe) → Fallback`;
//! `Generating → Executing → (error) → Fallback`;
//! `Executing → Interpreting → Done`; `Fallback → Done`.
//! Every terminal state yields a non-empty answer.

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::CodegenConfig;
use crate::models::{ColumnStats, DataFrameSchema};
use crate::openai::{ChatCompleter, ChatTurn};
use crate::tabular::{CodeExecutor, ExecOutcome};

/// Maximum list items surfaced in a formatted answer before truncation.
const MAX_LIST_ITEMS: usize = 10;
/// Maximum sample rows embedded in a prompt.
const MAX_SAMPLE_ROWS: usize = 8;
/// Maximum sample values shown per column.
const MAX_SAMPLE_VALUES: usize = 5;

/// Tokens associated with process, filesystem, or dynamic-evaluation access.
/// A cheap pre-filter only: the execution service is the actual isolation
/// boundary and must enforce its own sandbox.
const DENY_TOKENS: &[&str] = &[
    "import os",
    "from os",
    "import sys",
    "from sys",
    "import subprocess",
    "from subprocess",
    "import shutil",
    "from shutil",
    "import socket",
    "from socket",
    "import requests",
    "from requests",
    "import urllib",
    "from urllib",
    "import pathlib",
    "from pathlib",
    "import pickle",
    "from pickle",
    "importlib",
    "subprocess.",
    "os.system",
    "os.popen",
    "os.environ",
    "os.remove",
    "open(",
    "exec(",
    "eval(",
    "compile(",
    "__import__",
    "globals(",
    "locals(",
    "input(",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generating,
    Executing,
    Interpreting,
    Fallback,
    Done,
}

/// Transition out of the generation phase, driven by the safety gate.
pub fn after_generation(safe: bool) -> Phase {
    if safe {
        Phase::Executing
    } else {
        Phase::Fallback
    }
}

/// Transition out of the execution phase.
pub fn after_execution(outcome: &ExecOutcome) -> Phase {
    match outcome {
        ExecOutcome::Success(_) => Phase::Interpreting,
        ExecOutcome::Failure(_) => Phase::Fallback,
    }
}

/// Scan generated code against the deny-list. Returns the offending token
/// on a match.
pub fn safety_check(code: &str) -> Result<(), String> {
    let lowered = code.to_lowercase();
    for token in DENY_TOKENS {
        if lowered.contains(token) {
            return Err((*token).to_string());
        }
    }
    Ok(())
}

/// Column names that plausibly carry the metric a "total"-style question
/// asks about.
pub fn total_column_candidates(columns: &[ColumnStats]) -> Vec<String> {
    const METRIC_HINTS: &[&str] = &["total", "sales", "amount", "price", "sum", "revenue"];
    columns
        .iter()
        .filter(|c| {
            let name = c.name.to_lowercase();
            METRIC_HINTS.iter().any(|hint| name.contains(hint))
        })
        .map(|c| c.name.clone())
        .collect()
}

/// True for columns that slice a metric by period (months, quarters, weeks).
/// Summing these together with an existing total column double-counts.
pub fn is_period_column(name: &str) -> bool {
    const PERIODS: &[&str] = &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
        "q1", "q2", "q3", "q4", "month", "week", "quarter",
    ];
    let name = name.to_lowercase();
    PERIODS.iter().any(|p| {
        name == *p
            || name.starts_with(&format!("{} ", p))
            || name.starts_with(&format!("{}_", p))
            || name.ends_with(&format!(" {}", p))
    })
}

/// Strip a single leading/trailing markdown code fence, if the model added
/// one despite instructions.
pub fn strip_code_fences(code: &str) -> String {
    let trimmed = code.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag line.
    let rest = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

/// Truncate every array in the result to [`MAX_LIST_ITEMS`] entries,
/// appending an "...and N more" marker. Applied engine-side so the
/// interpretation prompt cannot silently drop data.
pub fn truncate_long_lists(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                truncate_long_lists(item);
            }
            if items.len() > MAX_LIST_ITEMS {
                let dropped = items.len() - MAX_LIST_ITEMS;
                items.truncate(MAX_LIST_ITEMS);
                items.push(serde_json::Value::String(format!("...and {} more", dropped)));
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                truncate_long_lists(v);
            }
        }
        _ => {}
    }
}

fn schema_summary(schema: &DataFrameSchema) -> String {
    let mut out = String::new();
    out.push_str(&format!("Rows: {}\nColumns:\n", schema.row_count));
    for col in &schema.columns {
        let samples: Vec<String> = col
            .sample_values
            .iter()
            .take(MAX_SAMPLE_VALUES)
            .map(|v| v.to_string())
            .collect();
        out.push_str(&format!(
            "- {} (dtype={}, nulls={}, unique={}, samples=[{}])\n",
            col.name,
            col.dtype,
            col.null_count,
            col.unique_count,
            samples.join(", ")
        ));
    }
    out.push_str("Sample rows:\n");
    for row in schema.sample_rows.iter().take(MAX_SAMPLE_ROWS) {
        out.push_str(&format!("{}\n", row));
    }
    out
}

/// Phase-A prompt: pandas code over the pre-bound `df`, result in `result`.
pub fn build_code_prompt(schema: &DataFrameSchema, question: &str) -> Vec<ChatTurn> {
    let candidates = total_column_candidates(&schema.columns);
    let candidate_note = if candidates.is_empty() {
        String::new()
    } else {
        format!(
            "Metric column candidates for total-style questions: [{}].\n",
            candidates.join(", ")
        )
    };

    let system = format!(
        "You write pandas code to answer one question about a dataframe.\n\
         \n\
         The dataframe is already loaded in a variable named `df`. Never read \
         files, never reload data, never mutate `df`.\n\
         Store the final answer in a variable named `result`. It must be \
         JSON-serializable: a number, a string, a dict, or a list of those.\n\
         Output only Python code, no markdown fences, no commentary.\n\
         \n\
         RULES:\n\
         1. If the question implies a total, pick EXACTLY ONE column from the \
         metric candidates. Never sum multiple candidate columns together.\n\
         2. EITHER sum the period columns (monthly, quarterly) OR read an \
         existing Total column. NEVER combine both in one computation.\n\
         3. Text filters are case-insensitive EXACT matches: use \
         df[col].astype(str).str.strip().str.lower() == value. Never use \
         str.contains, so rows like 'Outside X' or 'X Region Total' cannot \
         bleed in.\n\
         4. When aggregating manually, first exclude rows that are themselves \
         subtotal or grand-total rows (label contains Total/Subtotal/Grand, \
         case-insensitive).\n\
         5. Coerce numeric text by stripping '$' and ',' before arithmetic.\n\
         \n\
         {}",
        candidate_note
    );

    let user = format!(
        "Dataframe schema:\n{}\nQuestion: {}",
        schema_summary(schema),
        question
    );

    vec![ChatTurn::system(system), ChatTurn::user(user)]
}

/// Phase-D prompt on the success path: format the already-computed result.
/// Must never alter or re-derive the number.
pub fn build_interpret_prompt(question: &str, result: &serde_json::Value) -> Vec<ChatTurn> {
    let system = "You format a precomputed analysis result for an end user.\n\
        The computation is already done and correct. Never recalculate, \
        never second-guess, never introduce numbers that are not in the \
        result.\n\
        Formatting: bold the key metric; format large numbers with thousands \
        separators and a currency symbol where the question implies money; \
        use a markdown table when the result has multiple columns; keep \
        truncation markers like '...and N more' as-is.\n\
        Respond with the formatted answer only."
        .to_string();

    let user = format!(
        "Question: {}\n\nComputed result (JSON):\n{}",
        question,
        serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
    );

    vec![ChatTurn::system(system), ChatTurn::user(user)]
}

/// Phase-D prompt on the failure path: manual analysis from schema and row
/// sample only. Lower confidence, flagged in metadata, never in user text.
pub fn build_fallback_prompt(schema: &DataFrameSchema, question: &str) -> Vec<ChatTurn> {
    let system = "You answer a question about tabular data using only the \
        schema and sample rows provided. Code execution was not available.\n\
        Be precise about what the sample shows and plain about what it \
        cannot show. If the sample is insufficient to answer, say what is \
        missing instead of guessing. Apply exact-match reasoning to \
        categories and never double-count a total column against its period \
        columns."
        .to_string();

    let user = format!(
        "Dataframe schema:\n{}\nQuestion: {}",
        schema_summary(schema),
        question
    );

    vec![ChatTurn::system(system), ChatTurn::user(user)]
}

/// Result of the structured path, with the internal flags the response
/// metadata carries.
#[derive(Debug, Clone)]
pub struct StructuredOutcome {
    pub answer: String,
    pub fallback: bool,
    pub low_confidence: bool,
    pub context_chars: usize,
}

/// Run the four-phase protocol end to end for one question.
pub async fn answer(
    chat: &dyn ChatCompleter,
    executor: &dyn CodeExecutor,
    codegen: &CodegenConfig,
    schema: &DataFrameSchema,
    question: &str,
) -> Result<StructuredOutcome> {
    let context_chars = schema_summary(schema).chars().count();

    // Phase A: generate at temperature 0 with a fixed seed. Reproducibility
    // is best-effort, not guaranteed by the provider.
    let prompt = build_code_prompt(schema, question);
    let generated = match chat
        .complete(&prompt, codegen.temperature, Some(codegen.seed))
        .await
    {
        Ok(code) => strip_code_fences(&code),
        Err(err) => {
            warn!(error = %err, "code generation unavailable, using manual analysis");
            return fallback_answer(chat, codegen, schema, question, context_chars).await;
        }
    };

    // Phase B: static safety gate.
    let phase = match safety_check(&generated) {
        Ok(()) => after_generation(true),
        Err(token) => {
            warn!(token = %token, code = %generated, "generated code rejected by safety gate");
            after_generation(false)
        }
    };

    if phase == Phase::Fallback {
        return fallback_answer(chat, codegen, schema, question, context_chars).await;
    }

    // Phase C: remote execution against the pre-loaded dataframe.
    let outcome = match executor.execute(&schema.document_id, &generated).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, document_id = %schema.document_id, "execution service unreachable");
            return fallback_answer(chat, codegen, schema, question, context_chars).await;
        }
    };

    let mut result = match outcome {
        ExecOutcome::Success(result) => result,
        ExecOutcome::Failure(error) => {
            warn!(error = %error, document_id = %schema.document_id, "remote execution failed");
            return fallback_answer(chat, codegen, schema, question, context_chars).await;
        }
    };

    // Phase D, success path: format only — the number is already computed.
    debug!(document_id = %schema.document_id, "interpreting computed result");
    truncate_long_lists(&mut result);
    let interpret = build_interpret_prompt(question, &result);
    let answer = match chat
        .complete(&interpret, codegen.temperature, Some(codegen.seed))
        .await
    {
        Ok(text) if !text.trim().is_empty() => text,
        _ => format!(
            "The computed result is: {}",
            serde_json::to_string(&result).unwrap_or_else(|_| result.to_string())
        ),
    };

    Ok(StructuredOutcome {
        answer,
        fallback: false,
        low_confidence: false,
        context_chars,
    })
}

async fn fallback_answer(
    chat: &dyn ChatCompleter,
    codegen: &CodegenConfig,
    schema: &DataFrameSchema,
    question: &str,
    context_chars: usize,
) -> Result<StructuredOutcome> {
    let prompt = build_fallback_prompt(schema, question);
    let text = chat
        .complete(&prompt, codegen.temperature, Some(codegen.seed))
        .await?;
    let answer = if text.trim().is_empty() {
        "I could not analyze this file's data right now. Please try again.".to_string()
    } else {
        text
    };

    Ok(StructuredOutcome {
        answer,
        fallback: true,
        low_confidence: true,
        context_chars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn col(name: &str, dtype: &str) -> ColumnStats {
        ColumnStats {
            name: name.to_string(),
            dtype: dtype.to_string(),
            null_count: 0,
            unique_count: 10,
            sample_values: vec![],
        }
    }

    fn monthly_schema() -> DataFrameSchema {
        let mut columns = vec![col("Region", "object")];
        for month in [
            "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
        ] {
            columns.push(col(month, "float64"));
        }
        columns.push(col("Total", "float64"));
        DataFrameSchema {
            document_id: "doc1".to_string(),
            row_count: 20,
            columns,
            sample_rows: vec![serde_json::json!({"Region": "Atlanta", "Jan": 10.0, "Total": 120.0})],
        }
    }

    #[test]
    fn deny_list_catches_process_fs_and_eval() {
        assert!(safety_check("import os\nos.system('rm -rf /')").is_err());
        assert!(safety_check("from subprocess import run").is_err());
        assert!(safety_check("data = open('/etc/passwd').read()").is_err());
        assert!(safety_check("eval(user_input)").is_err());
        assert!(safety_check("__import__('socket')").is_err());
    }

    #[test]
    fn deny_list_passes_clean_pandas() {
        let code = "subset = df[df['Region'].astype(str).str.strip().str.lower() == 'atlanta']\n\
                    result = float(subset['Total'].iloc[0])";
        assert!(safety_check(code).is_ok());
    }

    #[test]
    fn candidates_include_total_not_months() {
        let schema = monthly_schema();
        let candidates = total_column_candidates(&schema.columns);
        assert_eq!(candidates, vec!["Total".to_string()]);
        for month in ["Jan", "Dec", "Q1", "month_3"] {
            assert!(is_period_column(month), "{} should be a period column", month);
        }
        assert!(!is_period_column("Total"));
        assert!(!is_period_column("Region"));
    }

    #[test]
    fn code_prompt_carries_either_or_and_exact_match_rules() {
        let schema = monthly_schema();
        let turns = build_code_prompt(&schema, "What is the total sales?");
        let system = &turns[0].content;
        assert!(system.contains("NEVER combine both"));
        assert!(system.contains("EXACT matches"));
        assert!(system.contains("Never use str.contains"));
        assert!(system.contains("subtotal or grand-total rows"));
        assert!(system.contains("Metric column candidates"));
        assert!(turns[1].content.contains("What is the total sales?"));
        assert!(turns[1].content.contains("Rows: 20"));
    }

    #[test]
    fn interpret_prompt_forbids_rederivation() {
        let turns = build_interpret_prompt("total?", &serde_json::json!(1918500.0));
        assert!(turns[0].content.contains("Never recalculate"));
        assert!(turns[1].content.contains("1918500"));
    }

    #[test]
    fn state_transitions() {
        assert_eq!(after_generation(true), Phase::Executing);
        assert_eq!(after_generation(false), Phase::Fallback);
        assert_eq!(
            after_execution(&ExecOutcome::Success(serde_json::json!(1))),
            Phase::Interpreting
        );
        assert_eq!(
            after_execution(&ExecOutcome::Failure("KeyError".into())),
            Phase::Fallback
        );
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_code_fences("result = 1"), "result = 1");
        assert_eq!(
            strip_code_fences("```python\nresult = 1\n```"),
            "result = 1"
        );
        assert_eq!(strip_code_fences("```\nresult = 2\n```"), "result = 2");
    }

    #[test]
    fn long_lists_truncated_with_marker() {
        let mut value = serde_json::json!({
            "regions": (0..25).map(|i| format!("r{}", i)).collect::<Vec<_>>(),
            "total": 5,
        });
        truncate_long_lists(&mut value);
        let regions = value["regions"].as_array().unwrap();
        assert_eq!(regions.len(), 11);
        assert_eq!(regions[10], serde_json::json!("...and 15 more"));
        assert_eq!(value["total"], serde_json::json!(5));
    }

    // ============ Phase-flow tests with stubbed seams ============

    struct StubChat {
        replies: Mutex<Vec<String>>,
    }

    impl StubChat {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl ChatCompleter for StubChat {
        async fn complete(
            &self,
            _turns: &[ChatTurn],
            _temperature: f32,
            _seed: Option<i64>,
        ) -> anyhow::Result<String> {
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "stub exhausted".to_string()))
        }
    }

    struct StubExecutor {
        outcome: ExecOutcome,
    }

    #[async_trait]
    impl CodeExecutor for StubExecutor {
        async fn execute(&self, _document_id: &str, _code: &str) -> anyhow::Result<ExecOutcome> {
            Ok(self.outcome.clone())
        }
    }

    #[tokio::test]
    async fn success_path_interprets_without_fallback() {
        let chat = StubChat::new(vec![
            "result = float(df['Total'].iloc[0])",
            "**Total sales: $1,918,500**",
        ]);
        let executor = StubExecutor {
            outcome: ExecOutcome::Success(serde_json::json!(1918500.0)),
        };
        let outcome = answer(
            &chat,
            &executor,
            &CodegenConfig::default(),
            &monthly_schema(),
            "total sales?",
        )
        .await
        .unwrap();

        assert_eq!(outcome.answer, "**Total sales: $1,918,500**");
        assert!(!outcome.fallback);
        assert!(!outcome.low_confidence);
    }

    #[tokio::test]
    async fn unsafe_code_never_reaches_executor() {
        struct PanicExecutor;
        #[async_trait]
        impl CodeExecutor for PanicExecutor {
            async fn execute(&self, _d: &str, _c: &str) -> anyhow::Result<ExecOutcome> {
                panic!("unsafe code was dispatched");
            }
        }

        let chat = StubChat::new(vec![
            "import os\nresult = os.listdir('/')",
            "From the sample, roughly...",
        ]);
        let outcome = answer(
            &chat,
            &PanicExecutor,
            &CodegenConfig::default(),
            &monthly_schema(),
            "total?",
        )
        .await
        .unwrap();

        assert!(outcome.fallback);
        assert!(outcome.low_confidence);
        assert!(!outcome.answer.is_empty());
    }

    #[tokio::test]
    async fn execution_failure_yields_non_empty_fallback_answer() {
        let chat = StubChat::new(vec![
            "result = df['Missing'].sum()",
            "Based on the schema and sample rows, the Total column holds the figure.",
        ]);
        let executor = StubExecutor {
            outcome: ExecOutcome::Failure("KeyError: 'Missing'".into()),
        };
        let outcome = answer(
            &chat,
            &executor,
            &CodegenConfig::default(),
            &monthly_schema(),
            "total?",
        )
        .await
        .unwrap();

        assert!(outcome.fallback);
        assert!(!outcome.answer.trim().is_empty());
    }

    #[tokio::test]
    async fn empty_interpretation_falls_back_to_rendered_result() {
        let chat = StubChat::new(vec!["result = 7", ""]);
        let executor = StubExecutor {
            outcome: ExecOutcome::Success(serde_json::json!(7)),
        };
        let outcome = answer(
            &chat,
            &executor,
            &CodegenConfig::default(),
            &monthly_schema(),
            "how many?",
        )
        .await
        .unwrap();

        assert!(outcome.answer.contains('7'));
        assert!(!outcome.fallback);
    }
}
