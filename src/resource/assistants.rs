//! Assistants family: assistants, threads, messages, runs, vector stores

use apikit::{Error, Result, Scope};
use converge::{AttrMode, Attributes, Comparator, DeleteRule, Registry, Schema};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, LazyLock};

use super::{Platform, Removal, Rest, required};

static FUNCTION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("valid function name regex"));

const ASSISTANT: Schema = Schema::new(&[
    ("model", AttrMode::Updatable),
    ("name", AttrMode::Updatable),
    ("description", AttrMode::Updatable),
    ("instructions", AttrMode::Updatable),
    ("tools", AttrMode::Updatable),
    ("tool_resources", AttrMode::Updatable),
    ("metadata", AttrMode::Updatable),
    ("temperature", AttrMode::Updatable),
    ("top_p", AttrMode::Updatable),
    ("response_format", AttrMode::Updatable),
])
.with_drift(&[
    ("model", Comparator::ModelAlias),
    ("tools", Comparator::Subset),
    ("tool_resources", Comparator::Subset),
    ("response_format", Comparator::Subset),
]);

const THREAD: Schema = Schema::new(&[
    ("messages", AttrMode::ForcesReplacement),
    ("tool_resources", AttrMode::Updatable),
    ("metadata", AttrMode::Updatable),
])
.with_drift(&[
    ("messages", Comparator::WriteOnly),
    ("tool_resources", Comparator::Subset),
]);

const MESSAGE: Schema = Schema::new(&[
    ("thread_id", AttrMode::ForcesReplacement),
    ("role", AttrMode::ForcesReplacement),
    ("content", AttrMode::ForcesReplacement),
    ("attachments", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::Updatable),
])
.with_drift(&[
    ("content", Comparator::WriteOnly),
    ("attachments", Comparator::WriteOnly),
]);

const RUN: Schema = Schema::new(&[
    ("thread_id", AttrMode::ForcesReplacement),
    ("assistant_id", AttrMode::ForcesReplacement),
    ("model", AttrMode::ForcesReplacement),
    ("instructions", AttrMode::ForcesReplacement),
    ("additional_instructions", AttrMode::ForcesReplacement),
    ("additional_messages", AttrMode::ForcesReplacement),
    ("tools", AttrMode::ForcesReplacement),
    ("temperature", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::Updatable),
])
.with_drift(&[
    ("model", Comparator::ModelAlias),
    ("tools", Comparator::Subset),
    ("additional_instructions", Comparator::WriteOnly),
    ("additional_messages", Comparator::WriteOnly),
]);

const VECTOR_STORE: Schema = Schema::new(&[
    ("name", AttrMode::Updatable),
    ("file_ids", AttrMode::ForcesReplacement),
    ("expires_after", AttrMode::Updatable),
    ("chunking_strategy", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::Updatable),
])
.with_drift(&[
    ("file_ids", Comparator::WriteOnly),
    ("chunking_strategy", Comparator::WriteOnly),
    ("expires_after", Comparator::Subset),
]);

const VECTOR_STORE_FILE: Schema = Schema::new(&[
    ("vector_store_id", AttrMode::ForcesReplacement),
    ("file_id", AttrMode::ForcesReplacement),
    ("attributes", AttrMode::Updatable),
    ("chunking_strategy", AttrMode::ForcesReplacement),
])
.with_drift(&[("chunking_strategy", Comparator::WriteOnly)]);

/// Run statuses after which nothing changes
const RUN_TERMINAL: &[&str] = &["completed", "failed", "cancelled", "expired", "incomplete"];

/// Statuses at which a new run stops being polled
const RUN_SETTLED: &[&str] = &[
    "completed",
    "failed",
    "cancelled",
    "expired",
    "incomplete",
    "requires_action",
];

pub fn register(registry: &mut Registry, platform: &Arc<Platform>) {
    registry
        .register(
            Rest::new(platform, "assistant", Scope::Project, "/assistants", ASSISTANT)
                .check(check_assistant),
        )
        .register(
            Rest::new(platform, "thread", Scope::Project, "/threads", THREAD).check(check_thread),
        )
        .register(
            Rest::new(platform, "message", Scope::Project, "/threads/{parent}/messages", MESSAGE)
                .parent("thread_id")
                .check(check_message),
        )
        .register(
            Rest::new(platform, "run", Scope::Project, "/threads/{parent}/runs", RUN)
                .parent("thread_id")
                .settle("status", RUN_SETTLED)
                .removal(
                    Removal::Post("/cancel"),
                    DeleteRule::LocalOnlyWhenTerminal {
                        field: "status",
                        terminal: RUN_TERMINAL,
                    },
                )
                .check(check_run),
        )
        .register(Rest::new(
            platform,
            "vector_store",
            Scope::Project,
            "/vector_stores",
            VECTOR_STORE,
        ))
        .register(
            Rest::new(
                platform,
                "vector_store_file",
                Scope::Project,
                "/vector_stores/{parent}/files",
                VECTOR_STORE_FILE,
            )
            .parent("vector_store_id")
            .settle("status", &["completed", "failed", "cancelled"])
            .check(check_vector_store_file),
        );
}

// ============================================================================
// Tools
// ============================================================================

/// A tool attached to an assistant or run
#[derive(Debug, Clone, PartialEq)]
pub enum Tool {
    CodeInterpreter,
    FileSearch(Option<FileSearch>),
    Function(FunctionDef),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSearch {
    pub max_num_results: Option<u32>,
    pub ranking_options: Option<RankingOptions>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RankingOptions {
    pub ranker: Option<String>,
    pub score_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionDef {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
    pub strict: Option<bool>,
}

impl Tool {
    /// Keys legal next to `type` for each variant
    fn payload_key(kind: &str) -> Result<Option<&'static str>> {
        match kind {
            "code_interpreter" => Ok(None),
            "file_search" => Ok(Some("file_search")),
            "function" => Ok(Some("function")),
            other => Err(Error::validation(format!(
                "unknown tool type '{other}' (expected code_interpreter, file_search or function)"
            ))),
        }
    }

    /// Parse one tool block, rejecting keys of other variants
    pub fn parse(value: &Value) -> Result<Self> {
        let block = value
            .as_object()
            .ok_or_else(|| Error::validation("each tool must be a table"))?;
        let kind = required(block, "type")?;
        let payload_key = Self::payload_key(kind)?;

        if let Some(stray) = block
            .keys()
            .find(|k| k.as_str() != "type" && Some(k.as_str()) != payload_key)
        {
            return Err(Error::validation(format!(
                "'{stray}' is not valid for a {kind} tool"
            )));
        }

        let payload = payload_key.and_then(|key| block.get(key)).cloned();

        match (kind, payload) {
            ("code_interpreter", _) => Ok(Self::CodeInterpreter),
            ("file_search", None) => Ok(Self::FileSearch(None)),
            ("file_search", Some(payload)) => {
                let options: FileSearch = decode(kind, payload)?;
                options.check()?;
                Ok(Self::FileSearch(Some(options)))
            }
            (_, None) => Err(Error::validation("a function tool needs a 'function' table")),
            (_, Some(payload)) => {
                let function: FunctionDef = decode(kind, payload)?;
                if !FUNCTION_NAME.is_match(&function.name) {
                    return Err(Error::validation(format!(
                        "function name '{}' must be 1-64 letters, digits, '_' or '-'",
                        function.name
                    )));
                }
                if function.parameters.as_ref().is_some_and(|p| !p.is_object()) {
                    return Err(Error::validation(format!(
                        "parameters of function '{}' must be a JSON schema object",
                        function.name
                    )));
                }
                Ok(Self::Function(function))
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CodeInterpreter => "code_interpreter",
            Self::FileSearch(_) => "file_search",
            Self::Function(_) => "function",
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::validation(format!("invalid {kind} tool: {e}")))
}

impl FileSearch {
    fn check(&self) -> Result<()> {
        if let Some(max) = self.max_num_results
            && !(1..=50).contains(&max)
        {
            return Err(Error::validation(format!(
                "file_search.max_num_results must be between 1 and 50, got {max}"
            )));
        }
        if let Some(threshold) = self.ranking_options.as_ref().and_then(|r| r.score_threshold)
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(Error::validation(format!(
                "file_search.ranking_options.score_threshold must be between 0 and 1, got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Parse the `tools` list, labelling errors with the position
pub fn parse_tools(declared: &Attributes) -> Result<Vec<Tool>> {
    let Some(tools) = declared.get("tools") else {
        return Ok(Vec::new());
    };
    let tools = tools
        .as_array()
        .ok_or_else(|| Error::validation("tools must be a list"))?;
    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| {
            Tool::parse(tool).map_err(|e| Error::validation(format!("tools[{i}]: {}", message(&e))))
        })
        .collect()
}

fn message(err: &Error) -> String {
    match err {
        Error::Validation { message } => message.clone(),
        other => other.to_string(),
    }
}

/// `tool_resources` may only configure declared tools
fn check_tool_resources(declared: &Attributes, tools: &[Tool]) -> Result<()> {
    let Some(resources) = declared.get("tool_resources") else {
        return Ok(());
    };
    let resources = resources
        .as_object()
        .ok_or_else(|| Error::validation("tool_resources must be a table"))?;
    for (name, value) in resources {
        let allowed: &[&str] = match name.as_str() {
            "code_interpreter" => &["file_ids"],
            "file_search" => &["vector_store_ids", "vector_stores"],
            other => {
                return Err(Error::validation(format!(
                    "tool_resources.{other} is not a tool with resources"
                )));
            }
        };
        if !tools.iter().any(|t| t.type_name() == name) {
            return Err(Error::validation(format!(
                "tool_resources.{name} is set but no {name} tool is declared"
            )));
        }
        if let Some(stray) = value
            .as_object()
            .and_then(|v| v.keys().find(|k| !allowed.contains(&k.as_str())))
        {
            return Err(Error::validation(format!(
                "'{stray}' is not valid in tool_resources.{name}"
            )));
        }
    }
    Ok(())
}

fn check_assistant(declared: &Attributes) -> Result<()> {
    required(declared, "model")?;
    let tools = parse_tools(declared)?;
    check_tool_resources(declared, &tools)
}

fn check_thread(declared: &Attributes) -> Result<()> {
    if let Some(messages) = declared.get("messages") {
        let messages = messages
            .as_array()
            .ok_or_else(|| Error::validation("messages must be a list"))?;
        for message in messages {
            let message = message
                .as_object()
                .ok_or_else(|| Error::validation("each message must be a table"))?;
            check_message_body(message)?;
        }
    }
    // Any tool may be used by a run on this thread
    let tools = [Tool::CodeInterpreter, Tool::FileSearch(None)];
    check_tool_resources(declared, &tools)
}

fn check_message_body(declared: &Attributes) -> Result<()> {
    let role = required(declared, "role")?;
    if !matches!(role, "user" | "assistant") {
        return Err(Error::validation(format!(
            "message role must be user or assistant, got '{role}'"
        )));
    }
    match declared.get("content") {
        Some(Value::String(text)) if !text.is_empty() => Ok(()),
        Some(Value::Array(blocks)) if !blocks.is_empty() => Ok(()),
        _ => Err(Error::validation(
            "message content must be a non-empty string or list of content blocks",
        )),
    }
}

fn check_message(declared: &Attributes) -> Result<()> {
    check_message_body(declared)
}

fn check_run(declared: &Attributes) -> Result<()> {
    required(declared, "assistant_id")?;
    parse_tools(declared).map(|_| ())
}

fn check_vector_store_file(declared: &Attributes) -> Result<()> {
    required(declared, "file_id").map(|_| ())
}
