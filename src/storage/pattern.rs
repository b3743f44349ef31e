use crate::core::{Result, RunStateError};
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const PATTERN_CACHE_SIZE: usize = 200;

lazy_static::lazy_static! {
    static ref GLOB_LRU_CACHE: Arc<Mutex<LruCache<String, Arc<Regex>>>> = Arc::new(Mutex::new(
        LruCache::new(NonZeroUsize::new(PATTERN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN))
    ));
}

/// Convert a Redis-style glob into an anchored regex
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                regex.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => {
                // copy the class through, translating `[!..]` to `[^..]`
                let mut j = i + 1;
                let mut class = String::from("[");
                if j < chars.len() && (chars[j] == '!' || chars[j] == '^') {
                    class.push('^');
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        j += 1;
                        class.push_str(&regex::escape(&chars[j].to_string()));
                    } else if chars[j] == '[' || chars[j] == '&' || chars[j] == '~' {
                        class.push('\\');
                        class.push(chars[j]);
                    } else {
                        class.push(chars[j]);
                    }
                    j += 1;
                }
                if j < chars.len() {
                    class.push(']');
                    regex.push_str(&class);
                    i = j;
                } else {
                    // unterminated class: match '[' literally
                    regex.push_str("\\[");
                }
            }
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    regex.push('$');
    regex
}

/// Fast path for patterns without wildcards or with a single trailing `*`
#[inline]
fn fast_path_glob(text: &str, pattern: &str) -> Option<bool> {
    let special = |c: char| matches!(c, '*' | '?' | '[' | '\\');

    if !pattern.contains(special) {
        return Some(text == pattern);
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains(special) {
            return Some(text.starts_with(prefix));
        }
    }

    None
}

fn get_or_compile_regex(pattern: &str) -> Result<Arc<Regex>> {
    {
        let mut cache = GLOB_LRU_CACHE.lock()?;
        if let Some(regex) = cache.get(pattern) {
            return Ok(Arc::clone(regex));
        }
    }

    let compiled = Regex::new(&glob_to_regex(pattern))
        .map_err(|e| RunStateError::Backend(format!("Invalid key pattern '{pattern}': {e}")))?;
    let compiled = Arc::new(compiled);

    {
        let mut cache = GLOB_LRU_CACHE.lock()?;
        cache.put(pattern.to_string(), Arc::clone(&compiled));
    }

    Ok(compiled)
}

/// Match a key against a glob pattern
#[inline]
pub fn glob_matches(text: &str, pattern: &str) -> Result<bool> {
    if let Some(result) = fast_path_glob(text, pattern) {
        return Ok(result);
    }

    let regex = get_or_compile_regex(pattern)?;
    Ok(regex.is_match(text))
}
