//! Named parameter storage.
//!
//! Parameters are kept in binding order using a small-vector so that the
//! common case of a handful of parameters never touches the heap.

use smallvec::SmallVec;

/// Maximum number of parameters stored inline (stack allocated).
const INLINE_PARAMS: usize = 4;

/// Named parameters bound while matching a route pattern.
///
/// Binding a name that is already present appends the new value to the
/// existing one, separated by a comma.
///
/// # Example
///
/// ```rust
/// use portico_router::Params;
///
/// let mut params = Params::new();
/// params.bind("id", "1");
/// params.bind("id", "2");
/// params.bind("action", "view");
///
/// assert_eq!(params.get("id"), Some("1,2"));
/// assert_eq!(params.get("action"), Some("view"));
/// assert_eq!(params.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params {
    inner: SmallVec<[(String, String); INLINE_PARAMS]>,
}

impl Params {
    /// Creates a new empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a value to a name, comma-joining onto any existing value.
    pub fn bind(&mut self, name: impl Into<String>, value: impl AsRef<str>) {
        let name = name.into();
        let value = value.as_ref();
        if let Some((_, existing)) = self.inner.iter_mut().find(|(n, _)| *n == name) {
            existing.push(',');
            existing.push_str(value);
        } else {
            self.inner.push((name, value.to_string()));
        }
    }

    /// Binds every parameter of `other` into this set, in order.
    pub fn merge(&mut self, other: &Params) {
        for (name, value) in other {
            self.bind(name, value);
        }
    }

    /// Returns the value for a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns an iterator over the parameters.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a str, &'a str);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a str, &'a str),
    >;

    fn into_iter(self) -> Self::IntoIter {
        fn as_pair((n, v): &(String, String)) -> (&str, &str) {
            (n.as_str(), v.as_str())
        }
        self.inner.iter().map(as_pair as fn(&'a (String, String)) -> (&'a str, &'a str))
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.bind(name, value);
        }
        params
    }
}
