use serde::{ Deserialize, Serialize };
use std::error::Error;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparatorStyle {
    /// Every turn ends with `sep`.
    #[default]
    Single,
    /// Turns alternate between `sep` and `sep2`.
    Two,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    /// `None` while an assistant reply is still being generated.
    pub text: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConversationError {
    NoTurns,
    LastTurnClosed(Role),
    OutOfOrder { expected: Role, got: Role },
    MissingSecondSeparator,
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationError::NoTurns => write!(f, "Conversation has no open turn to close"),
            ConversationError::LastTurnClosed(role) =>
                write!(f, "Last turn ({:?}) already has text, refusing to overwrite it", role),
            ConversationError::OutOfOrder { expected, got } =>
                write!(f, "Turns must alternate: expected {:?}, got {:?}", expected, got),
            ConversationError::MissingSecondSeparator =>
                write!(f, "Separator style 'two' requires a second separator"),
        }
    }
}

impl Error for ConversationError {}

/// Ordered chat transcript that serializes into the prompt the model was tuned on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub system: String,
    pub roles: (String, String),
    pub turns: Vec<ConversationTurn>,
    pub sep_style: SeparatorStyle,
    pub sep: String,
    pub sep2: Option<String>,
}

impl Conversation {
    pub fn new(
        system: impl Into<String>,
        roles: (String, String),
        sep_style: SeparatorStyle,
        sep: impl Into<String>,
        sep2: Option<String>
    ) -> Result<Self, ConversationError> {
        if sep_style == SeparatorStyle::Two && sep2.is_none() {
            return Err(ConversationError::MissingSecondSeparator);
        }
        Ok(Self {
            system: system.into(),
            roles,
            turns: Vec::new(),
            sep_style,
            sep: sep.into(),
            sep2,
        })
    }

    pub fn role_label(&self, role: Role) -> &str {
        match role {
            Role::User => &self.roles.0,
            Role::Assistant => &self.roles.1,
        }
    }

    fn expected_role(&self) -> Role {
        match self.turns.last() {
            Some(ConversationTurn { role: Role::User, .. }) => Role::Assistant,
            _ => Role::User,
        }
    }

    pub fn append(&mut self, role: Role, text: Option<String>) -> Result<(), ConversationError> {
        let expected = self.expected_role();
        if role != expected {
            return Err(ConversationError::OutOfOrder { expected, got: role });
        }
        self.turns.push(ConversationTurn { role, text });
        Ok(())
    }

    /// Fills the trailing placeholder turn with the stripped model output.
    pub fn close_last_turn(&mut self, text: &str) -> Result<(), ConversationError> {
        let last = self.turns.last_mut().ok_or(ConversationError::NoTurns)?;
        if last.text.is_some() {
            return Err(ConversationError::LastTurnClosed(last.role));
        }
        last.text = Some(text.trim().to_string());
        Ok(())
    }

    fn separator_for(&self, index: usize) -> &str {
        match (self.sep_style, &self.sep2) {
            (SeparatorStyle::Two, Some(sep2)) if index % 2 == 1 => sep2,
            _ => &self.sep,
        }
    }

    pub fn render(&self) -> String {
        let mut prompt = format!("{}{}", self.system, self.sep);
        for (index, turn) in self.turns.iter().enumerate() {
            let label = self.role_label(turn.role);
            match &turn.text {
                Some(text) => {
                    prompt.push_str(&format!("{}: {}{}", label, text, self.separator_for(index)));
                }
                None => {
                    prompt.push_str(&format!("{}:", label));
                }
            }
        }
        prompt
    }

    /// String whose emission ends an assistant reply.
    pub fn stop_sequence(&self) -> &str {
        match (self.sep_style, &self.sep2) {
            (SeparatorStyle::Two, Some(sep2)) => sep2,
            _ => &self.sep,
        }
    }
}

/// Characters of decoded output occupied by the echoed prompt.
pub fn echo_skip_len(prompt: &str) -> usize {
    prompt.replace("</s>", " ").chars().count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single() -> Conversation {
        Conversation::new(
            "System.",
            ("Human".to_string(), "Assistant".to_string()),
            SeparatorStyle::Single,
            "###",
            None
        ).unwrap()
    }

    #[test]
    fn render_leaves_open_turn_without_separator() {
        let mut conv = single();
        conv.append(Role::User, Some("hi".into())).unwrap();
        conv.append(Role::Assistant, None).unwrap();
        assert_eq!(conv.render(), "System.###Human: hi###Assistant:");
    }

    #[test]
    fn render_is_pure() {
        let mut conv = single();
        conv.append(Role::User, Some("hi".into())).unwrap();
        conv.append(Role::Assistant, None).unwrap();
        assert_eq!(conv.render(), conv.render());
    }

    #[test]
    fn two_style_alternates_separators() {
        let mut conv = Conversation::new(
            "S",
            ("USER".to_string(), "ASSISTANT".to_string()),
            SeparatorStyle::Two,
            " ",
            Some("</s>".to_string())
        ).unwrap();
        conv.append(Role::User, Some("a".into())).unwrap();
        conv.append(Role::Assistant, Some("b".into())).unwrap();
        conv.append(Role::User, Some("c".into())).unwrap();
        conv.append(Role::Assistant, None).unwrap();
        assert_eq!(conv.render(), "S USER: a ASSISTANT: b</s>USER: c ASSISTANT:");
        assert_eq!(conv.stop_sequence(), "</s>");
    }

    #[test]
    fn two_style_requires_sep2() {
        let err = Conversation::new(
            "S",
            ("A".to_string(), "B".to_string()),
            SeparatorStyle::Two,
            " ",
            None
        ).unwrap_err();
        assert_eq!(err, ConversationError::MissingSecondSeparator);
    }

    #[test]
    fn close_last_turn_strips_output() {
        let mut conv = single();
        conv.append(Role::User, Some("hi".into())).unwrap();
        conv.append(Role::Assistant, None).unwrap();
        conv.close_last_turn("  fn main() {}\n ").unwrap();
        assert_eq!(conv.turns[1].text.as_deref(), Some("fn main() {}"));
        assert!(conv.render().ends_with("Assistant: fn main() {}###"));
    }

    #[test]
    fn close_last_turn_without_open_turn_fails() {
        let mut conv = single();
        assert_eq!(conv.close_last_turn("x"), Err(ConversationError::NoTurns));

        conv.append(Role::User, Some("hi".into())).unwrap();
        assert_eq!(conv.close_last_turn("x"), Err(ConversationError::LastTurnClosed(Role::User)));
        assert_eq!(conv.turns[0].text.as_deref(), Some("hi"));

        conv.append(Role::Assistant, None).unwrap();
        conv.close_last_turn("done").unwrap();
        assert_eq!(
            conv.close_last_turn("again"),
            Err(ConversationError::LastTurnClosed(Role::Assistant))
        );
        assert_eq!(conv.turns[1].text.as_deref(), Some("done"));
    }

    #[test]
    fn turns_must_alternate_starting_with_user() {
        let mut conv = single();
        assert_eq!(
            conv.append(Role::Assistant, None),
            Err(ConversationError::OutOfOrder { expected: Role::User, got: Role::Assistant })
        );
        conv.append(Role::User, Some("a".into())).unwrap();
        assert!(conv.append(Role::User, Some("b".into())).is_err());
    }

    #[test]
    fn echo_skip_counts_chars_and_replaces_eos() {
        assert_eq!(echo_skip_len("ab</s>c"), 5);
        assert_eq!(echo_skip_len("é"), 2);
    }
}
