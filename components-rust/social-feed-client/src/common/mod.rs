pub(crate) mod snapshot {
    use serde::{de, Serialize};

    pub const SERIALIZATION_VERSION_V1: u8 = 1u8;

    pub(crate) fn serialize<T>(value: &T) -> Result<String, String>
    where
        T: ?Sized + Serialize,
    {
        let data = serde_json::to_string(value).map_err(|err| err.to_string())?;

        Ok(format!("v{SERIALIZATION_VERSION_V1}\n{data}"))
    }

    pub(crate) fn deserialize<T>(text: &str) -> Result<T, String>
    where
        T: de::DeserializeOwned,
    {
        let (header, data) = text
            .split_once('\n')
            .ok_or_else(|| "Missing serialization version".to_string())?;

        let version = header
            .strip_prefix('v')
            .and_then(|v| v.parse::<u8>().ok())
            .ok_or_else(|| format!("Invalid serialization version header: {header}"))?;

        match version {
            SERIALIZATION_VERSION_V1 => {
                let value: T = serde_json::from_str(data).map_err(|err| err.to_string())?;

                Ok(value)
            }
            _ => Err("Unsupported serialization version".to_string()),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::BTreeMap;

        #[test]
        fn versioned_roundtrip() {
            let mut value = BTreeMap::new();
            value.insert("a".to_string(), vec![1, 2, 3]);

            let text = serialize(&value).unwrap();
            assert!(text.starts_with("v1\n"));

            let back: BTreeMap<String, Vec<i32>> = deserialize(&text).unwrap();
            assert_eq!(back, value);
        }

        #[test]
        fn rejects_unknown_version_and_garbage() {
            assert!(deserialize::<Vec<i32>>("v9\n[1]").is_err());
            assert!(deserialize::<Vec<i32>>("[1]").is_err());
            assert!(deserialize::<Vec<i32>>("v1\n{not json").is_err());
        }
    }
}

pub(crate) mod query {
    /// Case-insensitive "contains" pattern for an `ilike` filter.
    /// LIKE metacharacters in the user's text are escaped.
    pub(crate) fn contains_pattern(text: &str) -> String {
        let mut pattern = String::with_capacity(text.len() + 2);
        pattern.push('%');
        for c in text.chars() {
            if matches!(c, '%' | '_' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('%');
        pattern
    }

    /// Translate a LIKE pattern (`%`, `_`, `\` escapes) into an anchored,
    /// case-insensitive regular expression source.
    pub(crate) fn like_to_regex(pattern: &str) -> String {
        let mut result = String::from("(?is)^");
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '%' => result.push_str(".*"),
                '_' => result.push('.'),
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        result.push_str(&regex::escape(&escaped.to_string()));
                    }
                }
                _ => result.push_str(&regex::escape(&c.to_string())),
            }
        }
        result.push('$');
        result
    }

    /// Normalized form of a search query, used as its dedup key.
    pub(crate) fn normalize(text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use regex::Regex;

        #[test]
        fn contains_pattern_escapes_metacharacters() {
            assert_eq!(contains_pattern("rust"), "%rust%");
            assert_eq!(contains_pattern("50%_off"), "%50\\%\\_off%");
        }

        #[test]
        fn like_pattern_matching() {
            let re = Regex::new(&like_to_regex(&contains_pattern("Rust"))).unwrap();
            assert!(re.is_match("I love rust!"));
            assert!(re.is_match("RUST"));
            assert!(!re.is_match("rush"));

            let literal = Regex::new(&like_to_regex(&contains_pattern("a_b"))).unwrap();
            assert!(literal.is_match("xa_by"));
            assert!(!literal.is_match("xacby"));

            let single = Regex::new(&like_to_regex("a_c")).unwrap();
            assert!(single.is_match("ABC"));
        }

        #[test]
        fn normalize_blank_queries() {
            assert_eq!(normalize("   "), None);
            assert_eq!(normalize("  hi "), Some("hi".to_string()));
        }
    }
}

pub(crate) mod sync {
    use std::sync::{Mutex, MutexGuard};

    /// Locks ignoring poisoning; state guarded here is always left consistent
    /// between statements.
    pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) mod blob {
    /// File extension of an uploaded file name; the whole name when there is no dot.
    pub(crate) fn extension(file_name: &str) -> String {
        file_name
            .rsplit('.')
            .next()
            .unwrap_or(file_name)
            .to_lowercase()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn extension_of_file_names() {
            assert_eq!(extension("cat.PNG"), "png");
            assert_eq!(extension("archive.tar.gz"), "gz");
            assert_eq!(extension("noext"), "noext");
        }
    }
}
