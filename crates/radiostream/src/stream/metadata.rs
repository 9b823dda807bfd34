//! Track metadata types and ICY parsing
//!
//! Pure data types and parsing functions for ICY (Icecast/Shoutcast) metadata
//! frames. A frame body is null-padded text of the form
//! `StreamTitle='Artist - Song';StreamUrl='...';`.

use std::fmt;
use std::time::Duration;

/// One record (song or segment) announced by the stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    /// `StreamTitle` value, trimmed
    pub info: Option<String>,
    pub artist: Option<String>,
    pub title: Option<String>,
    /// Frame text with the null padding removed
    pub raw: String,
    /// Every `key='value'` pair in frame order
    pub fields: Vec<(String, String)>,
    /// How long the record played. Set when it is replaced.
    pub duration: Duration,
    /// Time until this record replaces the current one
    pub delay: Duration,
}

impl TrackInfo {
    /// Build a track from a bare title string.
    ///
    /// Splits on first ` - ` separator: "Artist - Title" → artist="Artist", title="Title".
    /// If no separator found, the whole string becomes the title.
    pub fn from_icy_title(raw: &str) -> Self {
        let raw = raw.trim();
        let (artist, title) = split_artist_title(raw);
        Self {
            info: non_empty(raw),
            artist,
            title,
            raw: if raw.is_empty() {
                String::new()
            } else {
                format!("StreamTitle='{raw}';")
            },
            fields: vec![("StreamTitle".to_string(), raw.to_string())],
            ..Self::default()
        }
    }

    /// Decode a raw metadata frame body (with null padding).
    ///
    /// Returns `None` when the frame carries no `StreamTitle` text.
    pub fn from_icy_block(raw_block: &[u8]) -> Option<Self> {
        let end = raw_block.iter().rposition(|&b| b != 0).map(|p| p + 1)?;
        let text = String::from_utf8_lossy(&raw_block[..end]).into_owned();
        let fields = parse_icy_fields(&text);
        let info = field(&fields, "StreamTitle").and_then(non_empty)?;
        let (artist, title) = split_artist_title(&info);

        Some(Self {
            info: Some(info),
            artist,
            title,
            raw: text,
            fields,
            ..Self::default()
        })
    }

    /// Look up a metadata field by key (case-sensitive)
    pub fn field(&self, key: &str) -> Option<&str> {
        field(&self.fields, key)
    }

    /// Same record as `other`, ignoring timing
    pub fn same_record(&self, other: &TrackInfo) -> bool {
        self.info == other.info
    }
}

impl fmt::Display for TrackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.artist, &self.title) {
            (Some(a), Some(t)) => write!(f, "{a} - {t}"),
            (None, Some(t)) => f.write_str(t),
            _ => f.write_str(self.info.as_deref().unwrap_or("")),
        }
    }
}

/// Parse every `key='value'` pair from ICY metadata text.
///
/// A value ends at the next `';`, so apostrophes inside values survive
/// ("Guns N' Roses"). A trailing value missing its `;` is still accepted.
pub fn parse_icy_fields(text: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut rest = text;

    while let Some(eq) = rest.find("='") {
        let key = rest[..eq].trim_matches(|c: char| c == ';' || c.is_whitespace());
        let after = &rest[eq + 2..];
        let (value, next) = match after.find("';") {
            Some(end) => (&after[..end], &after[end + 2..]),
            None => (after.trim_end().trim_end_matches('\''), ""),
        };
        if !key.is_empty() {
            fields.push((key.to_string(), value.to_string()));
        }
        rest = next;
    }

    fields
}

/// Parse ICY metadata string to extract the StreamTitle value.
pub fn parse_icy_metadata(metadata: &str) -> Option<String> {
    let fields = parse_icy_fields(metadata);
    field(&fields, "StreamTitle").and_then(non_empty)
}

fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn split_artist_title(raw: &str) -> (Option<String>, Option<String>) {
    let raw = raw.trim();
    match raw.find(" - ") {
        Some(pos) => (non_empty(&raw[..pos]), non_empty(&raw[pos + 3..])),
        None => (None, non_empty(raw)),
    }
}
