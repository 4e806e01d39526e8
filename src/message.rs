//! Message elements and chains.
//!
//! Recovered from `ajenga/message/message.py`: a message is a chain of typed
//! elements (`Plain`, `At`, `Image`, `Quote`, ...). `MessageTypeNode` (see
//! [`crate::graph`]) fans out over the distinct [`MessageKind`]s present in a
//! chain, and [`MessageChain::as_plain`] is the basis for text-matching
//! combinators (`equals`, `startswith`, `endswith`).

use std::fmt;

/// The discriminant of a [`MessageElement`], used as the branch key of a
/// `MessageTypeNode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Meta,
    Plain,
    At,
    AtAll,
    Face,
    Image,
    Quote,
    Voice,
    File,
    App,
    Json,
    Xml,
    Forward,
    Unknown,
}

/// One element of a message chain.
///
/// Only the fields routing/matching logic needs are modeled; payload details
/// an adapter would otherwise fill in (binary blobs, URLs) are intentionally
/// left to the `Unknown`/opaque-friendly shape expected of this crate's
/// collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageElement {
    Plain { text: String },
    At { qq: i64 },
    AtAll,
    Face { id: i32 },
    Image { id: String },
    Quote { message_id: i64 },
    Voice { id: String },
    File { id: String },
    App { content: String },
    Json { content: String },
    Xml { content: String },
    Forward,
    Unknown,
}

impl MessageElement {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageElement::Plain { .. } => MessageKind::Plain,
            MessageElement::At { .. } => MessageKind::At,
            MessageElement::AtAll => MessageKind::AtAll,
            MessageElement::Face { .. } => MessageKind::Face,
            MessageElement::Image { .. } => MessageKind::Image,
            MessageElement::Quote { .. } => MessageKind::Quote,
            MessageElement::Voice { .. } => MessageKind::Voice,
            MessageElement::File { .. } => MessageKind::File,
            MessageElement::App { .. } => MessageKind::App,
            MessageElement::Json { .. } => MessageKind::Json,
            MessageElement::Xml { .. } => MessageKind::Xml,
            MessageElement::Forward => MessageKind::Forward,
            MessageElement::Unknown => MessageKind::Unknown,
        }
    }

    pub fn as_plain(&self) -> &str {
        match self {
            MessageElement::Plain { text } => text,
            _ => "",
        }
    }
}

/// An ordered sequence of [`MessageElement`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageChain(pub Vec<MessageElement>);

impl MessageChain {
    pub fn new() -> Self {
        MessageChain(Vec::new())
    }

    pub fn plain(text: impl Into<String>) -> Self {
        MessageChain(vec![MessageElement::Plain { text: text.into() }])
    }

    /// Concatenated text of every `Plain` element, left-stripped (matches the
    /// original's `''.join(...).lstrip()`).
    pub fn as_plain(&self) -> String {
        let joined: String = self.0.iter().map(MessageElement::as_plain).collect();
        joined.trim_start().to_string()
    }

    /// The set of distinct element kinds present, in first-seen order. Used
    /// by `MessageTypeNode` to fan out to every successor whose kind appears
    /// anywhere in the chain.
    pub fn kinds(&self) -> Vec<MessageKind> {
        let mut seen = Vec::new();
        for el in &self.0 {
            let k = el.kind();
            if !seen.contains(&k) {
                seen.push(k);
            }
        }
        seen
    }

    /// The first element of the given kind carrying a `Quote`, if any.
    pub fn first_quote(&self) -> Option<i64> {
        self.0.iter().find_map(|el| match el {
            MessageElement::Quote { message_id } => Some(*message_id),
            _ => None,
        })
    }

    pub fn push(&mut self, element: MessageElement) {
        self.0.push(element);
    }
}

impl fmt::Display for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_plain())
    }
}

impl From<&str> for MessageChain {
    fn from(s: &str) -> Self {
        MessageChain::plain(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_plain_joins_and_lstrips() {
        let mut chain = MessageChain::new();
        chain.push(MessageElement::At { qq: 10 });
        chain.push(MessageElement::Plain {
            text: "  hello".into(),
        });
        chain.push(MessageElement::Plain {
            text: " world".into(),
        });
        assert_eq!(chain.as_plain(), "hello world");
    }

    #[test]
    fn kinds_dedupes_preserving_order() {
        let chain = MessageChain(vec![
            MessageElement::Plain { text: "a".into() },
            MessageElement::At { qq: 1 },
            MessageElement::Plain { text: "b".into() },
        ]);
        assert_eq!(chain.kinds(), vec![MessageKind::Plain, MessageKind::At]);
    }
}
