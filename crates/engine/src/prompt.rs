//! Prompt formatting: chat templates, escape processing and the on-disk
//! prompt transcript.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use hearth_core::{Error, Result};

/// Fallback system message for conversation mode with an empty prompt.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Supported chat formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|im_start|>system\n{content}<|im_end|>\n<|im_start|>user\n{content}<|im_end|>\n<|im_start|>assistant\n`
    ChatMl,
    /// `[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{content} [/INST]`
    Llama2,
    /// `<|start_header_id|>system<|end_header_id|>\n\n{content}<|eot_id|>`
    Llama3,
    /// `<|system|>\n{content}</s>\n<|user|>\n{content}</s>\n<|assistant|>\n`
    Zephyr,
}

impl ChatTemplate {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "chatml" | "qwen" | "hermes" => Some(ChatTemplate::ChatMl),
            "llama2" | "llama-2" | "mistral" => Some(ChatTemplate::Llama2),
            "llama3" | "llama-3" => Some(ChatTemplate::Llama3),
            "zephyr" | "tinyllama" => Some(ChatTemplate::Zephyr),
            _ => None,
        }
    }

    /// Text of the token that ends an assistant turn.
    pub fn end_marker(&self) -> &'static str {
        match self {
            ChatTemplate::ChatMl => "<|im_end|>",
            ChatTemplate::Llama3 => "<|eot_id|>",
            ChatTemplate::Llama2 | ChatTemplate::Zephyr => "</s>",
        }
    }

    /// Render a whole conversation.
    pub fn format(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        match self {
            ChatTemplate::ChatMl => format_chatml(messages, add_generation_prompt),
            ChatTemplate::Llama2 => format_llama2(messages),
            ChatTemplate::Llama3 => format_llama3(messages, add_generation_prompt),
            ChatTemplate::Zephyr => format_zephyr(messages, add_generation_prompt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

fn format_chatml(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(msg.role.as_str());
        prompt.push('\n');
        prompt.push_str(&msg.content);
        prompt.push_str("<|im_end|>\n");
    }
    if add_generation_prompt {
        prompt.push_str("<|im_start|>assistant\n");
    }
    prompt
}

fn format_llama2(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    let mut system_prompt = String::new();
    for msg in messages {
        match msg.role {
            Role::System => system_prompt = msg.content.clone(),
            Role::User => {
                prompt.push_str("[INST] ");
                if !system_prompt.is_empty() {
                    prompt.push_str("<<SYS>>\n");
                    prompt.push_str(&system_prompt);
                    prompt.push_str("\n<</SYS>>\n\n");
                    system_prompt.clear();
                }
                prompt.push_str(&msg.content);
                prompt.push_str(" [/INST]");
            }
            Role::Assistant => {
                prompt.push(' ');
                prompt.push_str(&msg.content);
                prompt.push_str(" </s>");
            }
        }
    }
    prompt
}

fn format_llama3(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str("<|start_header_id|>");
        prompt.push_str(msg.role.as_str());
        prompt.push_str("<|end_header_id|>\n\n");
        prompt.push_str(msg.content.trim());
        prompt.push_str("<|eot_id|>");
    }
    if add_generation_prompt {
        prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    }
    prompt
}

fn format_zephyr(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str("<|");
        prompt.push_str(msg.role.as_str());
        prompt.push_str("|>\n");
        prompt.push_str(&msg.content);
        prompt.push_str("</s>\n");
    }
    if add_generation_prompt {
        prompt.push_str("<|assistant|>\n");
    }
    prompt
}

/// A conversation rendered one message at a time.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    template: ChatTemplate,
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new(template: ChatTemplate) -> Self {
        Self {
            template,
            messages: Vec::new(),
        }
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Append a message and return only the text it adds to the rendering.
    pub fn add(&mut self, role: Role, content: impl Into<String>, add_generation_prompt: bool) -> String {
        let past = if self.messages.is_empty() {
            String::new()
        } else {
            self.template.format(&self.messages, false)
        };
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
        let full = self.template.format(&self.messages, add_generation_prompt);

        let mut delta = String::new();
        // the model never generates the newline after its end marker
        if add_generation_prompt && past.ends_with('\n') {
            delta.push('\n');
        }
        delta.push_str(full.get(past.len()..).unwrap_or(&full));
        delta
    }
}

/// Expand `\n`, `\t`, `\r`, `\\`, `\"`, `\'` and `\xHH` escapes.
///
/// Unknown escapes are kept verbatim.
pub fn process_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('x') => {
                let hex: String = chars.clone().take(2).collect();
                match (hex.len() == 2).then(|| u8::from_str_radix(&hex, 16).ok()).flatten() {
                    Some(byte) => {
                        out.push(char::from(byte));
                        chars.next();
                        chars.next();
                    }
                    None => out.push_str("\\x"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Plain-text record of a conversation, replayed into later sessions.
#[derive(Debug, Clone)]
pub struct PromptTranscript {
    path: PathBuf,
}

impl PromptTranscript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything recorded so far; empty if the file does not exist yet.
    pub fn replay(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Append `text`, creating the file on first use.
    pub fn append(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}
