//! `${VARIABLE}` substitution

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Replace every `${NAME}`, `${NAME:=default}` and `${NAME:-default}` in `input`.
///
/// An unknown or empty variable resolves to its default, or to an empty
/// string when there is none.
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::resolve(format!("unterminated variable reference in {:?}", input)))?;
        out.push_str(&expand(&after[..end], vars));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn expand(expr: &str, vars: &BTreeMap<String, String>) -> String {
    let (name, default) = match expr.find(":=").or_else(|| expr.find(":-")) {
        Some(i) => (&expr[..i], Some(&expr[i + 2..])),
        None => (expr, None),
    };
    match vars.get(name.trim()) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => default.unwrap_or_default().to_string(),
    }
}

/// Substitute every string inside a JSON value, keys excluded
pub fn substitute_value(value: &mut Value, vars: &BTreeMap<String, String>) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = substitute(s, vars)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, vars)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("REPOSITORY_BUCKET".to_string(), "backups".to_string()),
            ("NAMESPACE".to_string(), "demo".to_string()),
            ("EMPTY".to_string(), String::new()),
        ])
    }

    #[test]
    fn plain_and_defaulted_references() {
        let vars = vars();
        assert_eq!(
            substitute("gs://${REPOSITORY_BUCKET}/${NAMESPACE}", &vars).unwrap(),
            "gs://backups/demo"
        );
        assert_eq!(substitute("--paths=${RESTORE_PATHS:=/data}", &vars).unwrap(), "--paths=/data");
        assert_eq!(substitute("${EMPTY:-fallback}", &vars).unwrap(), "fallback");
        assert_eq!(substitute("x${MISSING}y", &vars).unwrap(), "xy");
        assert_eq!(substitute("no refs, $HOME stays", &vars).unwrap(), "no refs, $HOME stays");
    }

    #[test]
    fn unterminated_reference_is_an_error() {
        let err = substitute("--bucket=${REPOSITORY_BUCKET", &vars()).unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }

    #[test]
    fn nested_strings_are_substituted() {
        let mut value = json!({
            "image": "restic:${VERSION:=0.9}",
            "args": ["--namespace=${NAMESPACE}", "restore"],
            "replicas": 1
        });
        substitute_value(&mut value, &vars()).unwrap();
        assert_eq!(value["image"], "restic:0.9");
        assert_eq!(value["args"][0], "--namespace=demo");
        assert_eq!(value["replicas"], 1);
    }
}
