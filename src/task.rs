//! Task prefixes and reserved special tokens
//!
//! The question-generation models are multi-task: callers select the task by
//! prefixing the raw input text with one of the fixed prefixes below. The two
//! reserved tokens mark sentence boundaries (`<sep>`) and highlighted answer
//! spans (`<hl>`) and are always injected into the tokenizer vocabulary.

/// Sentence separator token.
pub const SEP_TOKEN: &str = "<sep>";

/// Highlight marker token, wraps the answer span inside a passage.
pub const HL_TOKEN: &str = "<hl>";

/// The two reserved tokens, in injection order.
pub const ADDITIONAL_SPECIAL_TOKENS: [&str; 2] = [SEP_TOKEN, HL_TOKEN];

/// Task selector mapped to its input prefix literal.
///
/// Defining the literals here does not enforce their use: callers prepend
/// them to raw text before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPrefix {
    /// Extract candidate answer spans from a passage.
    AnswerExtraction,
    /// Generate questions end-to-end from a passage.
    EndToEndQuestionGeneration,
    /// Answer a question given a passage.
    QuestionAnswering,
    /// Generate a question for a highlighted answer span.
    QuestionGeneration,
}

impl TaskPrefix {
    /// The literal prefix string for this task.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnswerExtraction => "extract answers:",
            Self::EndToEndQuestionGeneration => "generate questions:",
            Self::QuestionAnswering => "question",
            Self::QuestionGeneration => "generate question",
        }
    }

    /// Prefix a raw input text for this task.
    pub fn apply(&self, text: &str) -> String {
        format!("{} {}", self.as_str(), text)
    }
}

impl std::fmt::Display for TaskPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
