use std::fmt;

use crate::errors::*;
use crate::parse_utils::*;

/// An insertion ordered bag of string tags.
///
/// Keys are assigned once with [`Metadata::set`]; overwriting goes through
/// [`Metadata::extend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    tags: Vec<(String, String)>,
}

impl Metadata {
    const NAME: &'static str = "Metadata";

    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs, rejecting repeated keys.
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self> {
        let mut res = Self::new();
        for (k, v) in pairs {
            res.set(k, v)?;
        }
        Ok(res)
    }

    /// Parse a tag string. If `allowed` is given, only those keys are kept.
    pub fn parse(text: &str, allowed: Option<&[&str]>) -> Self {
        let tags = parse_tags(text)
            .into_iter()
            .filter(|(k, _)| allowed.map(|a| a.contains(&k.as_str())).unwrap_or(true))
            .collect();
        Self { tags }
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.get_opt(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_owned()))
    }

    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        check_valid_key(&key)?;

        if self.contains(&key) {
            return Err(Error::DuplicateKey {
                container: Self::NAME,
                key,
            });
        }

        self.tags.push((key, value.into()));
        Ok(())
    }

    /// Add or overwrite every pair. Existing keys keep their position.
    pub fn extend<K: AsRef<str>, V: AsRef<str>>(&mut self, pairs: impl IntoIterator<Item = (K, V)>) {
        for (k, v) in pairs {
            let (k, v) = (k.as_ref(), v.as_ref());
            match self.tags.iter_mut().find(|(key, _)| key == k) {
                Some(entry) => entry.1 = v.to_owned(),
                None => self.tags.push((k.to_owned(), v.to_owned())),
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tags.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.tags.iter().position(|(k, _)| k == key)?;
        Some(self.tags.remove(pos).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Split into the tags named in `keys` and everything else.
    pub fn partition(&self, keys: &[&str]) -> (Metadata, Metadata) {
        let (selected, rest): (Vec<_>, Vec<_>) = self
            .tags
            .iter()
            .cloned()
            .partition(|(k, _)| keys.contains(&k.as_str()));
        (Metadata { tags: selected }, Metadata { tags: rest })
    }

    pub fn get_tags(&self, keys: Option<&[&str]>, exclude: &[&str], sep: &str) -> String {
        format_tags(self.iter(), keys, exclude, sep)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_tags(None, &[], TAG_JOINER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &[&str] = &["labExpId", "sex", "age"];

    #[test]
    fn parse_keeps_allowed_keys() {
        let m = Metadata::parse("labExpId=0001; sex=M; age=50; tissue=Blood;", Some(INFO));
        assert_eq!(m.len(), 3);
        assert_eq!(m.get("labExpId").unwrap(), "0001");
        assert_eq!(m.get("age").unwrap(), "50");
        assert!(matches!(m.get("tissue"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn tags_round_trip_in_order() {
        let s = "labExpId=0001; age=50; sex=M;";
        let m = Metadata::parse(s, None);
        assert_eq!(m.get_tags(None, &[], " "), s);
    }

    #[test]
    fn set_rejects_duplicates() {
        let mut m = Metadata::new();
        m.set("sex", "M").unwrap();
        let err = m.set("sex", "F").unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        assert_eq!(m.get("sex").unwrap(), "M");
    }

    #[test]
    fn extend_overwrites() {
        let mut m = Metadata::parse("labExpId=0001; age=50;", None);
        m.extend([("age", "51"), ("name", "test")]);
        assert_eq!(m.get("age").unwrap(), "51");
        assert_eq!(m.get("name").unwrap(), "test");
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["labExpId", "age", "name"]);
    }

    #[test]
    fn contains_and_remove() {
        let mut m = Metadata::parse("labExpId=0001; age=50; sex=M;", None);
        assert!(m.contains("age"));
        assert!(!m.contains("name"));
        assert_eq!(m.remove("age").as_deref(), Some("50"));
        assert!(!m.contains("age"));
    }

    #[test]
    fn partition_routes_file_fields() {
        let m = Metadata::parse("labExpId=0001; type=bam; size=100; md5=af54e41; view=Alignments;", None);
        let (file, shared) = m.partition(&["type", "size", "md5", "view"]);
        assert_eq!(file.len(), 4);
        assert_eq!(shared.keys().collect::<Vec<_>>(), vec!["labExpId"]);
    }
}
