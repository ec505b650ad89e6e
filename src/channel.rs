//! Channel naming and pattern matching
//!
//! Channels are `/`-rooted slash-separated segments: `/chat/room1/messages`.
//! Each segment must match `[A-Za-z0-9-_!~()$@]+`.
//!
//! Patterns use wildcard segments:
//! - `*` matches exactly one segment: `/chat/*` matches `/chat/room1`
//! - `**` matches the rest of the name: `/chat/**` matches `/chat/room1/messages`
//!
//! Matching is defined as the anchored regex translation of the pattern,
//! with `**` becoming `.*` and `*` becoming `[^/]*`.

use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Valid characters for a channel segment
fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '!' | '~' | '(' | ')' | '$' | '@')
}

/// Validate a single non-wildcard segment
fn is_valid_name_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_segment_char)
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel name cannot be empty")]
    Empty,

    #[error("channel name must start with '/': '{0}'")]
    MissingLeadingSlash(String),

    #[error("channel name cannot end with '/': '{0}'")]
    TrailingSlash(String),

    #[error("empty segment in channel name")]
    EmptySegment,

    #[error("invalid segment '{0}': must match [A-Za-z0-9-_!~()$@]+, '*' or '**'")]
    InvalidSegment(String),
}

/// A validated channel name or subscription pattern.
///
/// Construction validates against the Bayeux channel grammar; anything that
/// is neither a valid name nor a valid pattern fails with [`ChannelError`].
/// Patterns carry their compiled matcher so repeated routing is cheap.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    matcher: Option<Regex>,
}

impl Channel {
    /// Parse and validate a channel name or pattern
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        if raw.is_empty() {
            return Err(ChannelError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(ChannelError::MissingLeadingSlash(raw.to_string()));
        }
        if raw.ends_with('/') {
            return Err(ChannelError::TrailingSlash(raw.to_string()));
        }

        let segments: Vec<&str> = raw[1..].split('/').collect();
        let mut has_wildcard = false;

        for segment in &segments {
            if segment.is_empty() {
                return Err(ChannelError::EmptySegment);
            }
            if *segment == "*" || *segment == "**" {
                has_wildcard = true;
            } else if !is_valid_name_segment(segment) {
                return Err(ChannelError::InvalidSegment(segment.to_string()));
            }
        }

        let matcher = if has_wildcard {
            Some(compile_pattern(&segments).map_err(|_| ChannelError::InvalidSegment(raw.to_string()))?)
        } else {
            None
        };

        Ok(Self {
            name: raw.to_string(),
            matcher,
        })
    }

    /// The full channel string
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The non-empty `/`-separated parts of the name
    pub fn segments(&self) -> Vec<&str> {
        self.name[1..].split('/').collect()
    }

    /// Whether this is a reserved `/meta/` channel
    pub fn is_meta(&self) -> bool {
        self.name.starts_with("/meta/")
    }

    /// Whether this is a `/service/` channel
    pub fn is_service(&self) -> bool {
        self.name.starts_with("/service/")
    }

    /// Whether this channel contains a wildcard segment
    pub fn is_pattern(&self) -> bool {
        self.matcher.is_some()
    }

    /// Whether this pattern ends with the multi-segment wildcard `/**`
    pub fn is_wildcard(&self) -> bool {
        self.name.ends_with("/**")
    }

    /// Check whether this channel matches another.
    ///
    /// A pattern matches through its regex translation; a concrete name
    /// matches only itself.
    pub fn matches(&self, channel: &Channel) -> bool {
        match &self.matcher {
            Some(re) => re.is_match(channel.name()),
            None => self.name == channel.name,
        }
    }
}

/// Translate pattern segments to the anchored matching regex:
/// `**` -> `.*`, `*` -> `[^/]*`, literals escaped.
fn compile_pattern(segments: &[&str]) -> Result<Regex, regex::Error> {
    let body = segments
        .iter()
        .map(|segment| match *segment {
            "**" => ".*".to_string(),
            "*" => "[^/]*".to_string(),
            literal => regex::escape(literal),
        })
        .collect::<Vec<_>>()
        .join("/");
    Regex::new(&format!("^/{}$", body))
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Channel {}

impl std::hash::Hash for Channel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Whether `raw` is a valid concrete channel name (no wildcards)
pub fn is_valid_channel_name(raw: &str) -> bool {
    Channel::parse(raw).map(|c| !c.is_pattern()).unwrap_or(false)
}

/// Whether `raw` is a valid subscription pattern (at least one wildcard)
pub fn is_valid_channel_pattern(raw: &str) -> bool {
    Channel::parse(raw).map(|c| c.is_pattern()).unwrap_or(false)
}

/// Match a concrete channel name against a pattern or name.
///
/// Invalid inputs return `false` rather than erroring, so this is safe to
/// call on raw wire strings.
pub fn channel_matches(channel: &str, pattern: &str) -> bool {
    match (Channel::parse(channel), Channel::parse(pattern)) {
        (Ok(c), Ok(p)) if !c.is_pattern() => p.matches(&c),
        _ => false,
    }
}

/// Normalize a channel-ish string: prepend `/` if missing, strip a trailing
/// `/` unless the result is the root.
pub fn normalize(raw: &str) -> String {
    let mut s = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };
    while s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    s
}

/// The first-segment namespace of a channel, e.g. `/chat` for `/chat/room1`
pub fn namespace(channel: &str) -> Option<String> {
    let normalized = normalize(channel);
    let first = normalized[1..].split('/').next()?;
    if first.is_empty() {
        None
    } else {
        Some(format!("/{}", first))
    }
}

/// Whether `channel` lives inside `ns` (or equals it)
pub fn is_in_namespace(channel: &str, ns: &str) -> bool {
    let channel = normalize(channel);
    let ns = normalize(ns);
    if ns == "/" {
        return true;
    }
    channel == ns || channel.starts_with(&format!("{}/", ns))
}

/// The path of `channel` relative to `ns`, without a leading slash.
///
/// Returns `None` when the channel is outside the namespace.
pub fn relative_to(channel: &str, ns: &str) -> Option<String> {
    let channel = normalize(channel);
    let ns = normalize(ns);
    if !is_in_namespace(&channel, &ns) {
        return None;
    }
    if channel == ns {
        return Some(String::new());
    }
    let prefix_len = if ns == "/" { 1 } else { ns.len() + 1 };
    Some(channel[prefix_len..].to_string())
}

/// The parent chain of a channel, nearest first: `/a/b/c` -> `["/a/b", "/a"]`
pub fn parents(channel: &str) -> Vec<String> {
    let normalized = normalize(channel);
    let mut out = Vec::new();
    let mut current = normalized.as_str();
    while let Some(idx) = current.rfind('/') {
        if idx == 0 {
            break;
        }
        current = &current[..idx];
        out.push(current.to_string());
    }
    out
}
