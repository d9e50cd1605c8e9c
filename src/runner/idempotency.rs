//! Idempotency key formula: canonicalize a set of dot-paths over
//! `{task, interpret}` into a single string, then SHA-256 it.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Resolves a dot-path like `task.prompt` against the canonical source
/// object `{task: {...}, interpret: {...}}`.
fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

pub fn canonical_string(
    key_fields: &[String],
    task_id: &str,
    task_type: &str,
    title: &str,
    prompt: &str,
    interpret_objective: Option<&str>,
) -> String {
    let source = serde_json::json!({
        "task": { "id": task_id, "type": task_type, "title": title, "prompt": prompt },
        "interpret": { "objective": interpret_objective },
    });

    let has_resolved_field = !key_fields.is_empty()
        && key_fields
            .iter()
            .any(|p| resolve_path(&source, p).map(|v| !v.is_null()).unwrap_or(false));

    if has_resolved_field {
        key_fields
            .iter()
            .map(|path| {
                let value = resolve_path(&source, path).cloned().unwrap_or(Value::Null);
                format!("{path}={value}")
            })
            .collect::<Vec<_>>()
            .join("|")
    } else {
        format!(
            "{}|{}|{}|{}|{}",
            task_id,
            task_type,
            title,
            prompt,
            interpret_objective.unwrap_or("")
        )
    }
}

pub fn hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn state_key(hash: &str) -> String {
    format!("idempotency:{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_when_no_key_fields_resolve() {
        let canonical = canonical_string(&[], "t1", "generic", "Title", "do the thing", None);
        assert_eq!(canonical, "t1|generic|Title|do the thing|");
    }

    #[test]
    fn uses_listed_fields_when_present() {
        let canonical = canonical_string(
            &["task.prompt".to_string()],
            "t1",
            "generic",
            "Title",
            "do the thing",
            None,
        );
        assert_eq!(canonical, "task.prompt=\"do the thing\"");
    }

    #[test]
    fn hash_is_deterministic() {
        let a = hash("abc");
        let b = hash("abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
