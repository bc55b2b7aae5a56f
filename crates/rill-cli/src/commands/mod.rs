//! CLI command implementations

pub mod eval;
pub mod run;

use anyhow::Context;
use rill_sandbox::Backend;

/// Parse a `--backend` value
pub fn parse_backend(name: &str) -> anyhow::Result<Backend> {
    name.parse::<Backend>()
        .with_context(|| format!("expected one of quickjs, worker, direct; got `{}`", name))
}
