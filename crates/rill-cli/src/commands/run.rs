//! `rill run`: load a bundle and print the replicated tree.

use anyhow::Context;
use rill_core::clock::system_clock;
use rill_core::codec::{decode, DataOnly};
use rill_core::{RuntimeValue, SerializedValue};
use rill_engine::{Engine, EngineConfig, EngineEvent, EventKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Flags for `rill run`
#[derive(Debug, Default)]
pub struct RunOptions {
    pub props: Option<String>,
    pub config: Option<PathBuf>,
    pub backend: Option<String>,
    pub timeout_ms: Option<u64>,
    pub wait_ms: u64,
    pub compact: bool,
}

/// Config file first, then command-line overrides
pub fn load_config(options: &RunOptions) -> anyhow::Result<EngineConfig> {
    let mut config = match &options.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(name) = &options.backend {
        config.backend = super::parse_backend(name)?;
    }
    if options.timeout_ms.is_some() {
        config.timeout_ms = options.timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

/// Initial props from `--props`; wire JSON, so tagged values are allowed
pub fn parse_props(props: Option<&str>) -> anyhow::Result<RuntimeValue> {
    let Some(text) = props else {
        return Ok(RuntimeValue::object(Vec::<(String, RuntimeValue)>::new()));
    };
    let json: serde_json::Value = serde_json::from_str(text).context("--props is not valid JSON")?;
    let value = SerializedValue::from_wire(&json).context("--props is not valid wire data")?;
    Ok(decode(&value, &DataOnly))
}

pub fn execute(bundle: &Path, options: &RunOptions) -> anyhow::Result<String> {
    let config = load_config(options)?;
    let props = parse_props(options.props.as_deref())?;
    let source =
        std::fs::read_to_string(bundle).with_context(|| format!("reading bundle {}", bundle.display()))?;

    let clock = system_clock();
    let engine = Engine::with_clock(config, clock.clone())?;
    engine.on(EventKind::Message, |event| {
        if let EngineEvent::Message { name, payload } = event {
            tracing::info!(event = %name, payload = ?payload, "guest message");
        }
    });

    engine
        .load_bundle(&source, props)
        .with_context(|| format!("loading bundle {}", bundle.display()))?;

    let end = clock.now_ms().saturating_add(options.wait_ms);
    loop {
        engine.tick()?;
        let now = clock.now_ms();
        match engine.next_timer_due() {
            Some(due) if now < end && due <= end => {
                thread::sleep(Duration::from_millis(due.saturating_sub(now).max(1)));
            }
            _ => break,
        }
    }

    let health = engine.health();
    tracing::debug!(errors = health.error_count, stats = ?engine.resource_stats(), "run finished");

    let tree = engine.tree();
    let output = if options.compact {
        serde_json::to_string(&tree)?
    } else {
        serde_json::to_string_pretty(&tree)?
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_sandbox::Backend;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const HELLO: &str = r#"
        __sendToHost([
          { op: "CREATE", id: 1, type: "Text", props: { text: "hello " + __initialProps.name } },
          { op: "APPEND", id: 1, parentId: 0, childId: 1 },
        ]);
    "#;

    #[test]
    fn test_config_file_with_overrides() {
        let file = write_temp("backend = \"direct\"\nthrottle_ms = 4\n");
        let options = RunOptions {
            config: Some(file.path().to_path_buf()),
            backend: Some("worker".into()),
            timeout_ms: Some(25),
            ..RunOptions::default()
        };
        let config = load_config(&options).unwrap();
        assert_eq!(config.backend, Backend::Worker);
        assert_eq!(config.throttle_ms, 4);
        assert_eq!(config.timeout_ms, Some(25));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let options = RunOptions {
            backend: Some("v8".into()),
            ..RunOptions::default()
        };
        assert!(load_config(&options).is_err());
    }

    #[test]
    fn test_props_accept_wire_json() {
        let props = parse_props(Some(r#"{"name": "rill", "when": {"__type": "date", "value": 5}}"#)).unwrap();
        assert_eq!(props.get("name").unwrap().as_str(), Some("rill"));
        assert!(matches!(props.get("when"), Some(RuntimeValue::Date(ms)) if ms == 5.0));
        assert!(parse_props(Some("{")).is_err());
        assert!(parse_props(None).unwrap().get("anything").is_none());
    }

    #[test]
    fn test_run_prints_tree() {
        let bundle = write_temp(HELLO);
        let options = RunOptions {
            props: Some(r#"{"name": "world"}"#.into()),
            compact: true,
            ..RunOptions::default()
        };
        let output = execute(bundle.path(), &options).unwrap();
        let tree: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(tree[0]["type"], "Text");
        assert_eq!(tree[0]["props"]["text"], "hello world");
    }

    #[test]
    fn test_wait_runs_timers() {
        let bundle = write_temp(
            r#"setTimeout(() => __sendToHost([
                 { op: "CREATE", id: 3, type: "Later", props: {} },
                 { op: "APPEND", id: 3, parentId: 0, childId: 3 },
               ]), 5);"#,
        );
        let options = RunOptions {
            wait_ms: 200,
            ..RunOptions::default()
        };
        let output = execute(bundle.path(), &options).unwrap();
        assert!(output.contains("Later"));
    }

    #[test]
    fn test_bundle_error_fails_the_run() {
        let bundle = write_temp("throw new Error('broken')");
        let err = execute(bundle.path(), &RunOptions::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
    }
}
