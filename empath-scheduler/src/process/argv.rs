//! Command templates.
//!
//! A template is split on whitespace. Whole `$host` and `$channel` tokens
//! are replaced outright; `${host}`, `${channel}` and `${NAME}` are
//! expanded inside tokens, `NAME` coming from the configured worker
//! environment (unknown names expand to nothing). Leading `NAME=value`
//! tokens become environment entries of the worker. A relative program
//! name is looked up under `<mailbin>/ta/`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::error::ConfigError;

/// Variables always handed to workers when they are set
const PASSED_THROUGH: [&str; 2] = ["PATH", "ZCONFIG"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    /// The command as one line, for diagnostics
    pub fn snapshot(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn substitute(
    token: &str,
    channel: &str,
    host: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::UnterminatedVariable(token.to_string()))?;

        match &after[..end] {
            "host" => out.push_str(host),
            "channel" => out.push_str(channel),
            name => out.push_str(vars.get(name).map_or("", String::as_str)),
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Expand a command template for one destination
///
/// # Errors
///
/// If a `${` is never closed, or nothing runnable is left.
pub fn expand(
    template: &str,
    channel: &str,
    host: &str,
    vars: &BTreeMap<String, String>,
    mailbin: &Path,
) -> Result<CommandLine, ConfigError> {
    let mut argv: Vec<String> = Vec::new();
    let mut env = Vec::new();

    if let Ok(tz) = std::env::var("TZ") {
        env.push(("TZ".to_string(), tz));
    }
    for name in PASSED_THROUGH {
        if let Some(value) = vars
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
        {
            env.push((name.to_string(), value));
        }
    }

    for token in template.split_whitespace() {
        let value = match token {
            "$host" => host.to_string(),
            "$channel" => channel.to_string(),
            _ if token.contains('$') => substitute(token, channel, host, vars)?,
            _ => token.to_string(),
        };

        if argv.is_empty()
            && let Some((name, value)) = value.split_once('=')
        {
            env.push((name.to_string(), value.to_string()));
            continue;
        }

        argv.push(value);
    }

    let mut argv = argv.into_iter();
    let program = argv.next().ok_or(ConfigError::EmptyCommand)?;
    let program = if program.starts_with('/') {
        PathBuf::from(program)
    } else {
        mailbin.join("ta").join(program)
    };

    Ok(CommandLine {
        program,
        args: argv.collect(),
        env,
    })
}
