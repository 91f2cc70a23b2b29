use std::collections::HashMap;

/// Lookup mechanism that uses inexact matching of input paths by finding the most specific
/// match and returning that instead.  See [`PathMatcher::lookup`] for more information.
#[derive(Debug, Clone)]
pub struct PathMatcher<V> {
    map: HashMap<Vec<String>, V>,
}

impl<V> FromIterator<(Vec<String>, V)> for PathMatcher<V> {
    fn from_iter<I: IntoIterator<Item = (Vec<String>, V)>>(iter: I) -> Self {
        Self {
            map: HashMap::from_iter(iter),
        }
    }
}

impl<V> PathMatcher<V> {
    pub fn new_empty() -> Self {
        Self {
            map: HashMap::default(),
        }
    }

    /// Finds the most specific matched result based on the provided input path.  Does not
    /// require an exact match of input path!  See [`MatchedResult`] for more information.
    pub fn lookup(&self, path: &[String]) -> Option<MatchedResult<V>> {
        for search_depth in (0..path.len() + 1).rev() {
            let search_path = &path[0..search_depth];
            if let Some(value) = self.map.get(search_path) {
                return Some(MatchedResult {
                    value,
                    matched_index: search_depth,
                });
            }
        }
        None
    }

    pub fn insert(&mut self, key: Vec<String>, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn get_or_default(&mut self, key: Vec<String>) -> &mut V
    where
        V: Default,
    {
        self.map.entry(key).or_default()
    }
}

pub fn key_from_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Looked up value but also the index at which the match occurred so that the caller can determine
/// how much of the input path was unmatched and considered "dangling".  For example, the input
/// path could be `["foo","bar"]` but the match was for `["foo"]`.  The `matched_index` would be 1
/// such that `&input[matched_index..]` would yield `["bar"]`.
pub struct MatchedResult<'a, V> {
    pub value: &'a V,
    pub matched_index: usize,
}
