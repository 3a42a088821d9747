use std::fmt::{self, Write};
use std::ops;
use std::str::FromStr;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

#[inline]
fn is_sys<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic `{0}`")]
    InvalidPath(String),
    #[error("invalid segment `{0}`")]
    InvalidSegment(String),
    #[error("wildcards are not allowed in a publish topic `{0}`")]
    NotConcrete(String),
}

/// One level of a topic path. `+` and `#` parse to dedicated variants so
/// wildcard markers can never alias literal segments of the same text.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
pub enum Segment {
    Plain(ByteString),
    /// `$`-prefixed system segment, only valid in the first position.
    Sys(ByteString),
    Empty,
    /// Single-level wildcard `+`
    SingleLevel,
    /// Multi-level wildcard `#`
    MultiLevel,
}

impl Segment {
    #[inline]
    pub fn plain<T: AsRef<str>>(s: T) -> Result<Segment, TopicError> {
        if s.as_ref().contains(['+', '#']) || is_sys(&s) {
            return Err(TopicError::InvalidSegment(s.as_ref().into()));
        }
        Ok(Segment::Plain(ByteString::from(s.as_ref())))
    }

    #[inline]
    pub fn is_sys(&self) -> bool {
        matches!(self, Segment::Sys(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::SingleLevel | Segment::MultiLevel)
    }

    ///Literal text of this segment; wildcards have none, `Empty` is "".
    #[inline]
    pub fn text(&self) -> Option<&str> {
        match self {
            Segment::Plain(s) | Segment::Sys(s) => Some(s),
            Segment::Empty => Some(""),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn bound_value(&self) -> ByteString {
        match self {
            Segment::Plain(s) | Segment::Sys(s) => s.clone(),
            _ => ByteString::new(),
        }
    }
}

impl FromStr for Segment {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Segment::SingleLevel),
            "#" => Ok(Segment::MultiLevel),
            "" => Ok(Segment::Empty),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidSegment(s.into()))
                } else if is_sys(s) {
                    Ok(Segment::Sys(ByteString::from(s)))
                } else {
                    Ok(Segment::Plain(ByteString::from(s)))
                }
            }
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Plain(s) | Segment::Sys(s) => f.write_str(s),
            Segment::Empty => Ok(()),
            Segment::SingleLevel => f.write_char('+'),
            Segment::MultiLevel => f.write_char('#'),
        }
    }
}

/// What a wildcard captured when a filter matched a concrete topic.
#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize)]
pub enum Binding {
    /// `+` at segment position `0` bound the given value.
    Level(usize, ByteString),
    /// Trailing `#` swallowed the given suffix (possibly empty).
    Suffix(Vec<ByteString>),
}

impl Binding {
    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Binding::Level(pos, v) => serde_json::json!([pos, v]),
            Binding::Suffix(tail) => serde_json::json!(["#", tail]),
        }
    }
}

/// An ordered sequence of segments: a concrete topic when it holds no
/// wildcards, a filter otherwise.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
pub struct TopicPath(Vec<Segment>);

impl TopicPath {
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.iter().enumerate().all(|(pos, seg)| match seg {
                Segment::MultiLevel => pos == self.0.len() - 1,
                Segment::Sys(_) => pos == 0,
                _ => true,
            })
    }

    #[inline]
    pub fn is_filter(&self) -> bool {
        self.0.iter().any(Segment::is_wildcard)
    }

    #[inline]
    pub fn is_concrete(&self) -> bool {
        !self.is_filter()
    }

    ///Builds a concrete topic from literal segment values.
    pub fn from_segments<I, T>(iter: I) -> Result<TopicPath, TopicError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let path = iter
            .into_iter()
            .map(|s| Segment::from_str(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(TopicPath)?;
        if !path.is_valid() {
            return Err(TopicError::InvalidPath(path.to_string()));
        }
        if path.is_filter() {
            return Err(TopicError::NotConcrete(path.to_string()));
        }
        Ok(path)
    }

    ///True when this filter matches the concrete `topic`.
    #[inline]
    pub fn matches(&self, topic: &TopicPath) -> bool {
        self.captures(topic).is_some()
    }

    /// Matches this filter against a concrete topic, recording what each
    /// wildcard bound to. Wildcards in the first position never match a
    /// `$`-prefixed system segment.
    pub fn captures(&self, topic: &TopicPath) -> Option<Vec<Binding>> {
        let mut out = Vec::new();
        let path = topic.segments();
        for (pos, seg) in self.0.iter().enumerate() {
            match seg {
                Segment::MultiLevel => {
                    if pos == 0 && path.first().map(Segment::is_sys).unwrap_or(false) {
                        return None;
                    }
                    out.push(Binding::Suffix(path[pos..].iter().map(Segment::bound_value).collect()));
                    return Some(out);
                }
                Segment::SingleLevel => {
                    let t = path.get(pos)?;
                    if pos == 0 && t.is_sys() {
                        return None;
                    }
                    out.push(Binding::Level(pos, t.bound_value()));
                }
                other => {
                    if path.get(pos)? != other {
                        return None;
                    }
                }
            }
        }
        if self.0.len() == path.len() {
            Some(out)
        } else {
            None
        }
    }
}

impl FromStr for TopicPath {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        let path = s
            .split('/')
            .map(Segment::from_str)
            .collect::<Result<Vec<_>, TopicError>>()
            .map(TopicPath)?;
        if path.is_valid() {
            Ok(path)
        } else {
            Err(TopicError::InvalidPath(s.into()))
        }
    }
}

impl From<Vec<Segment>> for TopicPath {
    #[inline]
    fn from(v: Vec<Segment>) -> Self {
        TopicPath(v)
    }
}

impl ops::Deref for TopicPath {
    type Target = Vec<Segment>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            seg.fmt(f)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! path {
    ($s:expr) => {
        $s.parse::<$crate::topic::TopicPath>()
    };
}
