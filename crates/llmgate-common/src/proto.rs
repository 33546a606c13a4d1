use serde::{Deserialize, Serialize};

/// Wire format of an inbound or upstream call. `Op` is independent of
/// direction: the same `Op` names the caller-facing and the upstream
/// shape of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerFormat {
    OpenAI,
    Claude,
    Gemini,
}

impl CallerFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            CallerFormat::OpenAI => "openai",
            CallerFormat::Claude => "claude",
            CallerFormat::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    ModelList,
    ModelGet,
    GenerateContent,
    StreamGenerateContent,
}
