//! Codec for the flat index line format.
//!
//! A line is `PATH<TAB>TAGS`, where `TAGS` is a space separated run of
//! `key=value;` fragments. Values are not escaped and never contain `;`.

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::*;

/// Path used by lines that only carry dataset metadata.
pub const META_PATH: &str = ".";

pub const TAG_SEPARATOR: &str = "=";
pub const TAG_TERMINATOR: &str = ";";
pub const TAG_JOINER: &str = " ";

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"([^\s=;]+)=([^;]*);").unwrap();
}

/// Keys must be usable on both sides of the codec.
pub fn check_valid_key(key: &str) -> Result<&str> {
    if key.is_empty() {
        Err(Error::Parse {
            string: key.to_owned(),
            context: key.to_owned(),
            reason: "empty tag key",
        })?;
    }

    for c in key.chars() {
        match c {
            '=' | ';' => Err(Error::Parse {
                string: c.to_string(),
                context: key.to_owned(),
                reason: "tag keys cannot contain '=' or ';'",
            })?,
            c if c.is_whitespace() => Err(Error::Parse {
                string: c.to_string(),
                context: key.to_owned(),
                reason: "tag keys cannot contain whitespace",
            })?,
            _ => (),
        }
    }

    Ok(key)
}

/// Parse all well formed `key=value;` fragments in `text`.
///
/// Fragments that are missing the terminating `;` are dropped. A key that
/// occurs more than once keeps its first position and its last value.
pub fn parse_tags(text: &str) -> Vec<(String, String)> {
    let mut res: Vec<(String, String)> = Vec::new();

    for cap in TAG_RE.captures_iter(text) {
        let key = &cap[1];
        let value = &cap[2];

        match res.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_owned(),
            None => res.push((key.to_owned(), value.to_owned())),
        }
    }

    res
}

/// Split a line into its path and its tags.
///
/// Returns `None` for blank lines and for lines that have no tab separator.
pub fn parse_line(line: &str) -> Option<(&str, Vec<(String, String)>)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (path, tags) = line.split_once('\t')?;
    let path = path.trim();

    if path.is_empty() {
        return None;
    }

    Some((path, parse_tags(tags)))
}

pub fn format_tag(key: &str, value: &str, separator: &str, terminator: &str) -> String {
    format!("{key}{separator}{value}{terminator}")
}

/// Format tags in `keys` order (or iteration order when `keys` is `None`),
/// leaving out anything in `exclude`.
pub fn format_tags<K, V>(
    tags: impl IntoIterator<Item = (K, V)>,
    keys: Option<&[&str]>,
    exclude: &[&str],
    joiner: &str,
) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let tags = tags.into_iter().collect::<Vec<_>>();
    let ordered: Vec<(&str, &str)> = match keys {
        Some(keys) => keys
            .iter()
            .filter_map(|&key| {
                tags.iter()
                    .find(|(k, _)| k.as_ref() == key)
                    .map(|(k, v)| (k.as_ref(), v.as_ref()))
            })
            .collect(),
        None => tags.iter().map(|(k, v)| (k.as_ref(), v.as_ref())).collect(),
    };

    ordered
        .into_iter()
        .filter(|(k, _)| !exclude.contains(k))
        .map(|(k, v)| format_tag(k, v, TAG_SEPARATOR, TAG_TERMINATOR))
        .collect::<Vec<_>>()
        .join(joiner)
}
