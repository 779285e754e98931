use crate::models::chat::{ Conversation, ConversationError, Role, SeparatorStyle };
use log::info;
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

const DEFAULT_TEMPLATE: &str = include_str!("../../assets/conv_vicuna_v1_2.json");

#[derive(Debug)]
pub enum TemplateError {
    IoError(std::io::Error),
    JsonError(serde_json::Error),
    UnknownRole(String),
    Conversation(ConversationError),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::IoError(e) => write!(f, "Template file IO error: {}", e),
            TemplateError::JsonError(e) => write!(f, "Template JSON parsing error: {}", e),
            TemplateError::UnknownRole(role) =>
                write!(f, "Seed message uses role '{}' which is not one of the template roles", role),
            TemplateError::Conversation(e) => write!(f, "Invalid template conversation: {}", e),
        }
    }
}

impl Error for TemplateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TemplateError::IoError(e) => Some(e),
            TemplateError::JsonError(e) => Some(e),
            TemplateError::Conversation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TemplateError {
    fn from(err: std::io::Error) -> Self {
        TemplateError::IoError(err)
    }
}

impl From<serde_json::Error> for TemplateError {
    fn from(err: serde_json::Error) -> Self {
        TemplateError::JsonError(err)
    }
}

impl From<ConversationError> for TemplateError {
    fn from(err: ConversationError) -> Self {
        TemplateError::Conversation(err)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ConversationTemplate {
    pub name: String,
    pub system: String,
    pub roles: (String, String),
    #[serde(default)]
    pub messages: Vec<(String, String)>,
    #[serde(default)]
    pub sep_style: SeparatorStyle,
    pub sep: String,
    #[serde(default)]
    pub sep2: Option<String>,
}

impl ConversationTemplate {
    /// Fresh conversation seeded with the template's example exchange.
    pub fn start(&self) -> Result<Conversation, TemplateError> {
        let mut conversation = Conversation::new(
            self.system.clone(),
            self.roles.clone(),
            self.sep_style,
            self.sep.clone(),
            self.sep2.clone()
        )?;
        for (label, text) in &self.messages {
            let role = if *label == self.roles.0 {
                Role::User
            } else if *label == self.roles.1 {
                Role::Assistant
            } else {
                return Err(TemplateError::UnknownRole(label.clone()));
            };
            conversation.append(role, Some(text.clone()))?;
        }
        Ok(conversation)
    }
}

pub fn load_template_from_str(json: &str) -> Result<ConversationTemplate, TemplateError> {
    let template: ConversationTemplate = serde_json::from_str(json)?;
    // surface role/separator mistakes at load time rather than on the first turn
    template.start()?;
    Ok(template)
}

pub fn default_template() -> Result<ConversationTemplate, TemplateError> {
    load_template_from_str(DEFAULT_TEMPLATE)
}

pub fn load_template(path: Option<&Path>) -> Result<ConversationTemplate, TemplateError> {
    match path {
        Some(path) => {
            info!("Loading conversation template from: {}", path.display());
            let json = fs::read_to_string(path)?;
            load_template_from_str(&json)
        }
        None => default_template(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_seeds_one_exchange() {
        let template = default_template().unwrap();
        assert_eq!(template.name, "vicuna_v1.2");
        let conv = template.start().unwrap();
        assert_eq!(conv.turns.len(), 2);
        assert_eq!(conv.stop_sequence(), "###");
        let rendered = conv.render();
        assert!(rendered.starts_with("A chat between a curious human"));
        assert!(rendered.contains("###Human: What are the key differences"));
        assert!(rendered.ends_with("economic and social instability.\n###"));
    }

    #[test]
    fn unknown_seed_role_is_rejected() {
        let json = r#"{
            "name": "t", "system": "s", "roles": ["USER", "BOT"],
            "messages": [["Someone", "hi"]], "sep": "\n"
        }"#;
        assert!(matches!(load_template_from_str(json), Err(TemplateError::UnknownRole(r)) if r == "Someone"));
    }

    #[test]
    fn two_style_template_loads() {
        let json = r#"{
            "name": "v1.1", "system": "s", "roles": ["USER", "ASSISTANT"],
            "sep_style": "two", "sep": " ", "sep2": "</s>"
        }"#;
        let template = load_template_from_str(json).unwrap();
        assert_eq!(template.start().unwrap().stop_sequence(), "</s>");
    }

    #[test]
    fn template_file_is_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br####"{"name": "disk", "system": "s", "roles": ["A", "B"], "sep": "###"}"####
        ).unwrap();
        let template = load_template(Some(file.path())).unwrap();
        assert_eq!(template.name, "disk");
        assert_eq!(template.start().unwrap().stop_sequence(), "###");
    }
}
