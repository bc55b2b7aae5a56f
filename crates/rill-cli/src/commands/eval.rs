//! `rill eval`: evaluate a snippet in a fresh sandbox context.

use anyhow::Context;
use rill_core::codec::{encode, DataOnly};
use rill_sandbox::RuntimeOptions;

/// Returns the completion value as wire JSON
pub fn execute(code: &str, backend: Option<&str>) -> anyhow::Result<String> {
    let backend = match backend {
        Some(name) => super::parse_backend(name)?,
        None => Default::default(),
    };
    let runtime = rill_sandbox::provider(backend).create_runtime(&RuntimeOptions::default())?;
    let context = runtime.create_context()?;
    let result = context.eval(code);
    context.dispose();
    runtime.dispose();

    let value = result?;
    let encoded = encode(&value, &mut DataOnly).context("completion value cannot be printed")?;
    Ok(encoded.to_wire_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_prints_wire_json() {
        assert_eq!(execute("1 + 2", None).unwrap(), "3");
        assert_eq!(execute("({ a: [true, null] })", Some("direct")).unwrap(), r#"{"a":[true,null]}"#);
        let map = execute("new Map([['k', 1]])", Some("worker")).unwrap();
        assert!(map.contains("\"map\""));
    }

    #[test]
    fn test_eval_errors() {
        assert!(execute("throw new TypeError('x')", None).is_err());
        assert!(execute("() => 1", None).is_err());
        assert!(execute("1", Some("nope")).is_err());
    }
}
