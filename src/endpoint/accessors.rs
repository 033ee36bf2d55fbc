//! Lazy header and cookie accessors.
//!
//! Every transport carries headers and cookies in a different shape: a plain
//! map, a list of `"name=value"` entries with a single header-string
//! fallback, or a native structure that only supports single-key gets. The
//! [`LazyLookup`] type papers over all of them behind one signature:
//!
//! - `get(key)` answers a single case-insensitive key from the raw source
//!   without normalizing everything, falling back to the normalized map only
//!   when the direct attempt misses;
//! - `all()` builds the fully-normalized (lowercase-keyed) map once, caches
//!   it, and returns it for every later call.
//!
//! The [`LazyLookup::empty`] variant answers `None`/empty unconditionally so
//! transports without headers or cookies need no special-casing in the
//! pipeline.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

type GetOne = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;
type GetAll = Box<dyn Fn() -> HashMap<String, String> + Send + Sync>;

enum Source {
    Empty,
    Map(HashMap<String, String>),
    Entries {
        entries: Vec<String>,
        fallback: Option<String>,
    },
    Getter {
        get_one: GetOne,
        get_all: GetAll,
    },
}

/// Case-insensitive key/value reader over a transport-specific source.
///
/// Cloning is cheap and clones share the normalized-map cache.
#[derive(Clone)]
pub struct LazyLookup {
    source: Arc<Source>,
    normalized: Arc<OnceLock<HashMap<String, String>>>,
}

impl LazyLookup {
    fn from_source(source: Source) -> Self {
        LazyLookup {
            source: Arc::new(source),
            normalized: Arc::new(OnceLock::new()),
        }
    }

    /// A reader that answers `None` / empty map unconditionally.
    pub fn empty() -> Self {
        Self::from_source(Source::Empty)
    }

    /// Reader over a plain key/value map (keys in any casing).
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self::from_source(Source::Map(map))
    }

    /// Reader over `"name=value"` entries, with an optional
    /// `"a=b; c=d"`-style single-header fallback consulted when the entry
    /// list is empty.
    pub fn from_entries(entries: Vec<String>, fallback: Option<String>) -> Self {
        Self::from_source(Source::Entries { entries, fallback })
    }

    /// Reader over a native structure exposing a single-key getter plus a
    /// way to enumerate everything (used only when `all()` is requested).
    pub fn from_getter(
        get_one: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
        get_all: impl Fn() -> HashMap<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self::from_source(Source::Getter {
            get_one: Box::new(get_one),
            get_all: Box::new(get_all),
        })
    }

    /// Looks up a single key, case-insensitively.
    ///
    /// Attempts a direct lookup against the raw source first; only when that
    /// misses does it consult the lazily-built normalized map, so the common
    /// single-key case never pays for full normalization.
    pub fn get(&self, key: &str) -> Option<String> {
        let direct = match self.source.as_ref() {
            Source::Empty => return None,
            Source::Map(map) => map
                .get(key)
                .or_else(|| map.get(&key.to_ascii_lowercase()))
                .cloned(),
            Source::Entries { entries, fallback } => {
                let mut hit = entries.iter().find_map(|entry| entry_value(entry, key));
                if hit.is_none()
                    && entries.is_empty()
                    && let Some(fallback) = fallback
                {
                    hit = fallback.split(';').find_map(|entry| entry_value(entry, key));
                }
                hit
            }
            Source::Getter { get_one, .. } => get_one(key),
        };

        direct.or_else(|| self.all().get(&normalize_key(key)).cloned())
    }

    /// The fully-normalized map (lowercase keys), built on first use and
    /// cached for the lifetime of this reader and its clones.
    pub fn all(&self) -> &HashMap<String, String> {
        self.normalized.get_or_init(|| match self.source.as_ref() {
            Source::Empty => HashMap::new(),
            Source::Map(map) => map
                .iter()
                .map(|(key, value)| (normalize_key(key), value.clone()))
                .collect(),
            Source::Entries { entries, fallback } => {
                let raw: Vec<&str> = if entries.is_empty() {
                    fallback
                        .as_deref()
                        .map(|fallback| fallback.split(';').collect())
                        .unwrap_or_default()
                } else {
                    entries.iter().map(String::as_str).collect()
                };

                raw.iter()
                    .filter_map(|entry| {
                        let (name, value) = entry.split_once('=')?;
                        Some((normalize_key(name), value.trim().to_string()))
                    })
                    .collect()
            }
            Source::Getter { get_all, .. } => get_all()
                .iter()
                .map(|(key, value)| (normalize_key(key), value.clone()))
                .collect(),
        })
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

fn entry_value(entry: &str, key: &str) -> Option<String> {
    let (name, value) = entry.split_once('=')?;
    name.trim()
        .eq_ignore_ascii_case(key.trim())
        .then(|| value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map() -> HashMap<String, String> {
        HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("authorization".to_string(), "Bearer abc".to_string()),
        ])
    }

    #[test]
    fn map_reader_is_case_insensitive() {
        let lookup = LazyLookup::from_map(header_map());
        assert_eq!(lookup.get("content-type").as_deref(), Some("application/json"));
        assert_eq!(lookup.get("CONTENT-TYPE").as_deref(), Some("application/json"));
        assert_eq!(lookup.get("Authorization").as_deref(), Some("Bearer abc"));
        assert_eq!(lookup.get("x-missing"), None);
    }

    #[test]
    fn direct_and_full_map_lookups_agree_in_either_order() {
        // get() first, then all()
        let lookup = LazyLookup::from_map(header_map());
        let direct = lookup.get("Content-Type");
        assert_eq!(lookup.all().get("content-type"), direct.as_ref());

        // all() first, then get()
        let lookup = LazyLookup::from_map(header_map());
        let from_map = lookup.all().get("content-type").cloned();
        assert_eq!(lookup.get("Content-Type"), from_map);
    }

    #[test]
    fn entry_reader_parses_name_value_pairs() {
        let lookup = LazyLookup::from_entries(
            vec!["session=s1".to_string(), "Theme=dark".to_string()],
            None,
        );
        assert_eq!(lookup.get("session").as_deref(), Some("s1"));
        assert_eq!(lookup.get("theme").as_deref(), Some("dark"));
        assert_eq!(lookup.all().get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn entry_reader_falls_back_to_the_single_header_string() {
        let lookup =
            LazyLookup::from_entries(Vec::new(), Some("session=s1; theme=dark".to_string()));
        assert_eq!(lookup.get("SESSION").as_deref(), Some("s1"));
        assert_eq!(lookup.get("theme").as_deref(), Some("dark"));
        assert_eq!(lookup.all().len(), 2);
    }

    #[test]
    fn entries_take_precedence_over_the_fallback() {
        let lookup = LazyLookup::from_entries(
            vec!["session=fresh".to_string()],
            Some("session=stale".to_string()),
        );
        assert_eq!(lookup.get("session").as_deref(), Some("fresh"));
        assert_eq!(lookup.all().get("session").map(String::as_str), Some("fresh"));
    }

    #[test]
    fn getter_reader_consults_the_native_source_first() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let enumerations = Arc::new(AtomicUsize::new(0));
        let count = enumerations.clone();

        let lookup = LazyLookup::from_getter(
            |key| (key == "host").then(|| "example.org".to_string()),
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                HashMap::from([("Host".to_string(), "example.org".to_string())])
            },
        );

        assert_eq!(lookup.get("host").as_deref(), Some("example.org"));
        // A direct hit never enumerates the native source.
        assert_eq!(enumerations.load(Ordering::SeqCst), 0);

        assert_eq!(lookup.all().get("host").map(String::as_str), Some("example.org"));
        lookup.all();
        // The normalized map is built exactly once.
        assert_eq!(enumerations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_reader_answers_nothing_unconditionally() {
        let lookup = LazyLookup::empty();
        assert_eq!(lookup.get("anything"), None);
        assert!(lookup.all().is_empty());
    }
}
