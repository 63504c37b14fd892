use nom::bytes::complete::take_till1;
use nom::character::complete::char;
use nom::combinator::{rest, verify};
use nom::sequence::separated_pair;
use nom::IResult;
use std::fmt;
use std::str::FromStr;

/// Which kind of `left:right` argument failed to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecKind {
    Receiver,
    TagRemoval,
}

impl SpecKind {
    fn halves(self) -> (&'static str, &'static str) {
        match self {
            SpecKind::Receiver => ("receiver class", "action"),
            SpecKind::TagRemoval => ("tag name", "identity value"),
        }
    }
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecKind::Receiver => write!(f, "receiver"),
            SpecKind::TagRemoval => write!(f, "tag removal"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} argument '{input}': {reason}")]
pub struct SpecParseError {
    pub kind: SpecKind,
    pub input: String,
    pub reason: String,
}

/// `left:right`, split on the first colon. Everything after it, colons included, is `right`.
fn colon_pair(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_till1(|c: char| c == ':'),
        char(':'),
        verify(rest, |s: &str| !s.is_empty()),
    )(input)
}

pub(crate) fn split_spec(kind: SpecKind, input: &str) -> Result<(String, String), SpecParseError> {
    match colon_pair(input) {
        Ok((_, (left, right))) => Ok((left.to_string(), right.to_string())),
        Err(_) => {
            let (left, right) = kind.halves();
            let reason = if !input.contains(':') {
                format!("expected '<{left}>:<{right}>', no ':' separator found")
            } else if input.starts_with(':') {
                format!("{left} is empty")
            } else {
                format!("{right} is empty")
            };
            Err(SpecParseError {
                kind,
                input: input.to_string(),
                reason,
            })
        }
    }
}

/// Receiver class names mapped to the actions requested for them, in first-seen order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverActions {
    entries: Vec<(String, Vec<String>)>,
}

impl ReceiverActions {
    pub fn new() -> Self {
        ReceiverActions::default()
    }

    /// Parse `class:action` strings. Repeated classes collapse into one entry whose
    /// action lists are concatenated; duplicate actions are kept here.
    pub fn parse<I, S>(specs: I) -> Result<Self, SpecParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut receivers = ReceiverActions::new();
        for spec in specs {
            let (class, action) = split_spec(SpecKind::Receiver, spec.as_ref())?;
            receivers.push(class, action);
        }
        Ok(receivers)
    }

    pub fn push(&mut self, class: impl Into<String>, action: impl Into<String>) {
        let class = class.into();
        let action = action.into();
        match self.entries.iter_mut().find(|(name, _)| *name == class) {
            Some((_, actions)) => actions.push(action),
            None => self.entries.push((class, vec![action])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn actions(&self, class: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == class)
            .map(|(_, actions)| actions.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(class, actions)| (class.as_str(), actions.as_slice()))
    }
}

/// An `<application>` child to remove, keyed by tag and `android:name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagSpec {
    pub tag: String,
    pub name: String,
}

impl TagSpec {
    pub fn new(tag: impl Into<String>, name: impl Into<String>) -> Self {
        TagSpec {
            tag: tag.into(),
            name: name.into(),
        }
    }
}

impl FromStr for TagSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, name) = split_spec(SpecKind::TagRemoval, s)?;
        Ok(TagSpec { tag, name })
    }
}

impl fmt::Display for TagSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.name)
    }
}
