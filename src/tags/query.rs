use std::collections::HashSet;

/// Optional OR / NOT clauses of a tag query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    /// A run must carry at least one of these tags
    pub any_of: Vec<String>,
    /// A run must carry none of these tags
    pub none_of: Vec<String>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn any_of<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.any_of.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn none_of<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.none_of.extend(tags.into_iter().map(Into::into));
        self
    }

    /// OR tags left after dropping empty entries
    pub(crate) fn effective_any_of(&self) -> Vec<&str> {
        self.any_of
            .iter()
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
            .collect()
    }

    pub(crate) fn effective_none_of(&self) -> Vec<&str> {
        self.none_of
            .iter()
            .map(String::as_str)
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

/// Combine per-tag run lists: intersect `required`, keep runs found in any
/// `any_of` list (skipped when `any_of` is `None`), then drop runs found in
/// any `none_of` list. Output follows the first required list's order.
pub fn combine_run_lists(
    required: &[Vec<String>],
    any_of: Option<&[Vec<String>]>,
    none_of: &[Vec<String>],
) -> Vec<String> {
    let Some((first, rest)) = required.split_first() else {
        return Vec::new();
    };

    let rest: Vec<HashSet<&str>> = rest
        .iter()
        .map(|list| list.iter().map(String::as_str).collect())
        .collect();
    let union_any: Option<HashSet<&str>> =
        any_of.map(|lists| lists.iter().flatten().map(String::as_str).collect());
    let union_none: HashSet<&str> = none_of.iter().flatten().map(String::as_str).collect();

    let mut seen = HashSet::new();
    first
        .iter()
        .filter(|run| seen.insert(run.as_str()))
        .filter(|run| rest.iter().all(|set| set.contains(run.as_str())))
        .filter(|run| {
            union_any
                .as_ref()
                .is_none_or(|set| set.contains(run.as_str()))
        })
        .filter(|run| !union_none.contains(run.as_str()))
        .cloned()
        .collect()
}
