//! Destination naming: derives `<show>/<episode file>` paths from episode
//! metadata and recovers metadata from such paths.
//!
//! Formatting and parsing share one template so that a name produced by
//! [`format_episode_name`] parses back to the same title and date. The
//! sanitizer is lossy on punctuation; that loss is accepted.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::episode::Episode;

/// Longest file or folder name written to the destination, in bytes.
pub const MAX_NAME_LEN: usize = 255;

const FALLBACK_DATE_FORMAT: &str = "%Y-%m-%d";
const FALLBACK_NAME: &str = "untitled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingTemplate {
    /// Show folder format; only `{show}` is meaningful here.
    pub show_format: String,
    /// Episode file stem with `{title}`, `{date}` and `{show}` placeholders.
    pub episode_format: String,
    /// strftime-style format used for `{date}`.
    pub date_format: String,
    pub sanitize_names: bool,
}

impl Default for NamingTemplate {
    fn default() -> Self {
        Self {
            show_format: "{show}".to_string(),
            episode_format: "{date} - {title}".to_string(),
            date_format: FALLBACK_DATE_FORMAT.to_string(),
            sanitize_names: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Title,
    Date,
    Show,
}

impl Placeholder {
    const ALL: [Placeholder; 3] = [Placeholder::Title, Placeholder::Date, Placeholder::Show];

    fn token(self) -> &'static str {
        match self {
            Placeholder::Title => "{title}",
            Placeholder::Date => "{date}",
            Placeholder::Show => "{show}",
        }
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Field(Placeholder),
}

/// Splits a template into literal runs and placeholders. Unknown `{...}`
/// sequences stay literal.
fn segments(format: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while let Some(offset) = format[i..].find('{') {
        let at = i + offset;
        let rest = &format[at..];
        match Placeholder::ALL.iter().find(|p| rest.starts_with(p.token())) {
            Some(&p) => {
                if literal_start < at {
                    out.push(Segment::Literal(&format[literal_start..at]));
                }
                out.push(Segment::Field(p));
                i = at + p.token().len();
                literal_start = i;
            }
            None => i = at + 1,
        }
    }
    if literal_start < format.len() {
        out.push(Segment::Literal(&format[literal_start..]));
    }
    out
}

/// Replaces characters that are unsafe on common removable-media
/// filesystems, trims, and bounds the length. Idempotent.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '/' | '\\' | ':' | '|' => out.push('-'),
            '&' => out.push_str("and"),
            '*' | '?' | '"' | '<' | '>' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    let mut out = trim_name(&out).to_string();
    truncate_at_char_boundary(&mut out, MAX_NAME_LEN);
    trim_name(&out).to_string()
}

fn trim_name(name: &str) -> &str {
    name.trim_start()
        .trim_end_matches(|c: char| c.is_whitespace() || c == '.')
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Formats a date, falling back to ISO dates when `format` is not a valid
/// strftime string.
fn format_date(date: &DateTime<Utc>, format: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", date.format(format)).is_err() {
        out.clear();
        let _ = write!(out, "{}", date.format(FALLBACK_DATE_FORMAT));
    }
    out
}

fn render(format: &str, episode: &Episode, date_format: &str) -> String {
    let mut out = String::new();
    for segment in segments(format) {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Field(Placeholder::Title) => out.push_str(&episode.title),
            Segment::Field(Placeholder::Show) => out.push_str(&episode.show),
            Segment::Field(Placeholder::Date) => {
                if let Some(published) = &episode.published_at {
                    out.push_str(&format_date(published, date_format));
                }
            }
        }
    }
    out
}

/// Name of the show folder for `episode`. Always sanitized, since a show
/// name containing `/` would otherwise create nested folders.
pub fn show_folder_name(template: &NamingTemplate, episode: &Episode) -> String {
    let name = sanitize_name(&render(&template.show_format, episode, &template.date_format));
    if name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        name
    }
}

/// File name for `episode`: the rendered template, sanitized when the
/// template asks for it, with the source extension appended.
pub fn format_episode_name(template: &NamingTemplate, episode: &Episode) -> String {
    let mut name = render(&template.episode_format, episode, &template.date_format);
    if template.sanitize_names {
        name = sanitize_name(&name);
    }
    if name.is_empty() {
        name = FALLBACK_NAME.to_string();
    }

    let ext = source_extension(&episode.file_path);
    if ext.is_empty() || name.ends_with(&ext) {
        return name;
    }

    truncate_at_char_boundary(&mut name, MAX_NAME_LEN.saturating_sub(ext.len()));
    if template.sanitize_names {
        name = trim_name(&name).to_string();
    }
    name.push_str(&ext);
    name
}

/// Extension of the source file including the dot, or empty.
fn source_extension(file_path: &str) -> String {
    Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Relative `<show>/<file>` path where `episode` is stored on a drive.
pub fn expected_path(template: &NamingTemplate, episode: &Episode) -> PathBuf {
    PathBuf::from(show_folder_name(template, episode)).join(format_episode_name(template, episode))
}

/// Translates a strftime format into a regex matching its output.
pub fn date_format_to_regex(format: &str) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
            continue;
        }

        let pad = match chars.peek() {
            Some(&('-' | '_' | '0')) => chars.next(),
            _ => None,
        };

        let Some(spec) = chars.next() else {
            out.push('%');
            break;
        };

        let numeric = |width: usize| -> String {
            match pad {
                Some('-') => format!(r"\d{{1,{}}}", width),
                Some('_') => format!(r" *\d{{1,{}}}", width),
                _ => format!(r"\d{{{}}}", width),
            }
        };

        let piece = match spec {
            'Y' | 'G' => numeric(4),
            'C' | 'y' | 'g' | 'm' | 'd' | 'H' | 'I' | 'M' | 'S' | 'U' | 'W' | 'V' => numeric(2),
            'j' => numeric(3),
            'e' | 'k' | 'l' => r" ?\d{1,2}".to_string(),
            'u' | 'w' => r"\d".to_string(),
            'B' | 'b' | 'h' | 'A' | 'a' | 'Z' => "[A-Za-z]+".to_string(),
            'p' => "[AP]M".to_string(),
            'P' => "[ap]m".to_string(),
            'F' => r"\d{4}-\d{2}-\d{2}".to_string(),
            'D' | 'x' => r"\d{2}/\d{2}/\d{2}".to_string(),
            'T' | 'X' => r"\d{2}:\d{2}:\d{2}".to_string(),
            'R' => r"\d{2}:\d{2}".to_string(),
            'z' => r"[+-]\d{4}".to_string(),
            's' => r"\d+".to_string(),
            '%' => "%".to_string(),
            _ => ".+?".to_string(),
        };
        out.push_str(&piece);
    }

    out
}

fn episode_pattern(template: &NamingTemplate) -> String {
    let date_regex = date_format_to_regex(&template.date_format);
    let mut pattern = String::from("^");
    let mut seen_title = false;
    let mut seen_date = false;

    for segment in segments(&template.episode_format) {
        match segment {
            Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
            Segment::Field(Placeholder::Title) if !seen_title => {
                seen_title = true;
                pattern.push_str("(?P<title>.+)");
            }
            Segment::Field(Placeholder::Date) if !seen_date => {
                seen_date = true;
                let _ = write!(pattern, "(?P<date>{})", date_regex);
            }
            Segment::Field(Placeholder::Date) => {
                let _ = write!(pattern, "(?:{})", date_regex);
            }
            Segment::Field(_) => pattern.push_str("(?:.+)"),
        }
    }
    pattern.push('$');
    pattern
}

fn parse_date(text: &str, format: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Recovers episode metadata from a drive path laid out by `template`.
///
/// The show comes from the parent folder. When the file name does not fit the
/// template the whole stem becomes the title; this degraded result is not an
/// error.
pub fn parse_episode_path(path: &Path, template: &NamingTemplate) -> Episode {
    let show = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut episode = Episode {
        show,
        file_path: path.to_string_lossy().into_owned(),
        ..Episode::default()
    };

    let captures = Regex::new(&episode_pattern(template))
        .ok()
        .and_then(|re| {
            re.captures(&stem).map(|caps| {
                (
                    caps.name("title").map(|m| m.as_str().to_string()),
                    caps.name("date").map(|m| m.as_str().to_string()),
                )
            })
        });

    match captures {
        Some((title, date)) => {
            episode.title = title.unwrap_or_else(|| stem.clone());
            episode.published_at = date.and_then(|d| parse_date(&d, &template.date_format));
        }
        None => episode.title = stem,
    }

    episode
}
