//! Call metadata: the string key/value pairs that travel with a call.

/// Caller-seeded or server-generated trace identifier.
pub const TRACE_ID: &str = "trace_id";
/// `Bearer <token>` credential.
pub const AUTHORIZATION: &str = "authorization";
/// Raw bearer token, appended once the session is established.
pub const TOKEN: &str = "token";
/// Authenticated subject id, appended once the session is established.
pub const UID: &str = "uid";
/// Caller deadline in the `<digits><unit>` form.
pub const TIMEOUT: &str = "grpc-timeout";

/// Ordered, case-insensitive multimap of metadata entries.
///
/// Keys are stored lowercase. Lookups return the first value for a key, the
/// way RPC metadata is conventionally read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Existing entries for the same key are kept.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_ascii_lowercase(), value.into()));
    }

    /// Replaces every entry for `key` with a single `value`.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.remove(key);
        self.append(key, value);
    }

    /// Drops every entry for `key`.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Builder-style [`append`](Metadata::append).
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.append(key, value);
        self
    }

    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Self::new();
        for (k, v) in iter {
            md.append(k.as_ref(), v);
        }
        md
    }
}
