use std::error::Error;
use std::fmt;

pub const BATCH_PREAMBLE: &str =
    "Below is an instruction that describes a task, paired with an input that provides further context. Generate the code that appropriately completes the request";

pub const CHAT_PREFIX: &str =
    "Below is an instruction that describes a task, paired with an API references that provides further about the API. Write code that appropriately completes the request.\n\n### Instruction:\n ";

pub const INSTRUCTION_HEADER: &str = "### Instruction:";
pub const INPUT_HEADER: &str = "### Input:";
pub const RESPONSE_MARKER: &str = "### Response:";
pub const CODE_HEADER: &str = "### Code:";

#[derive(Debug, PartialEq, Eq)]
pub enum PromptError {
    EmptyInstruction,
    SectionNotFound(&'static str),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::EmptyInstruction => write!(f, "Instruction is empty"),
            PromptError::SectionNotFound(header) =>
                write!(f, "Prompt section '{}' not found", header),
        }
    }
}

impl Error for PromptError {}

/// One-shot prompt with instruction, retrieved document and an open response section.
pub fn build_batch_prompt(instruction: &str, document: &str) -> Result<String, PromptError> {
    if instruction.trim().is_empty() {
        return Err(PromptError::EmptyInstruction);
    }
    Ok(
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            BATCH_PREAMBLE,
            INSTRUCTION_HEADER,
            instruction,
            INPUT_HEADER,
            document,
            RESPONSE_MARKER
        )
    )
}

/// User-turn text for the interactive template; the assistant turn opens with `### Code:`.
pub fn build_chat_instruction(user_input: &str, document: &str) -> Result<String, PromptError> {
    if user_input.is_empty() {
        return Err(PromptError::EmptyInstruction);
    }
    Ok(format!("{}{}\n\n{}\n{}\n\n{}", CHAT_PREFIX, user_input, INPUT_HEADER, document, CODE_HEADER))
}

/// Recovers the `### Input:` section of a batch prompt built for `instruction`.
/// The instruction may itself contain section headers, so it is skipped whole.
pub fn parse_batch_input<'a>(prompt: &'a str, instruction: &str) -> Result<&'a str, PromptError> {
    let head = format!("{}\n{}\n{}\n{}\n", BATCH_PREAMBLE, INSTRUCTION_HEADER, instruction, INPUT_HEADER);
    let end_header = format!("\n{}", RESPONSE_MARKER);
    let rest = prompt.strip_prefix(head.as_str()).ok_or(PromptError::SectionNotFound(INPUT_HEADER))?;
    let len = rest.rfind(&end_header).ok_or(PromptError::SectionNotFound(RESPONSE_MARKER))?;
    Ok(&rest[..len])
}
