//! External stage invocation.
//!
//! Every external stage (transform, checks, remote fetch) is an argv template
//! with `{name}` placeholders. Templates are rendered per call and run as a
//! child process; nothing goes through a shell unless the template asks for
//! one.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::process::{Command, ExitStatus, Output, Stdio};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommandTemplate {
    pub argv: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTemplate {
    Argv(Vec<String>),
    Line(String),
}

impl<'de> Deserialize<'de> for CommandTemplate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawTemplate::deserialize(deserializer)? {
            RawTemplate::Argv(argv) => Ok(CommandTemplate { argv }),
            RawTemplate::Line(line) => {
                CommandTemplate::parse(&line).map_err(serde::de::Error::custom)
            }
        }
    }
}

impl CommandTemplate {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandTemplate {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Tokenize a single command string with shell word rules.
    pub fn parse(line: &str) -> Result<Self> {
        let argv = shell_words::split(line).with_context(|| format!("split command {line:?}"))?;
        Ok(CommandTemplate { argv })
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn mentions(&self, placeholder: &str) -> bool {
        let token = format!("{{{placeholder}}}");
        self.argv.iter().any(|arg| arg.contains(&token))
    }

    /// Substitute `{name}` tokens. An unknown placeholder is an error so a
    /// typo in configuration never reaches the child process.
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Result<Vec<String>> {
        if self.argv.is_empty() {
            return Err(anyhow!("command template is empty"));
        }
        self.argv.iter().map(|arg| render_arg(arg, vars)).collect()
    }
}

fn render_arg(arg: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let Some(end) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &tail[..end];
        // `${VAR}` belongs to a shell inside the template.
        let is_placeholder = !out.ends_with('$')
            && !name.is_empty()
            && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !is_placeholder {
            out.push('{');
            rest = tail;
            continue;
        }
        let value = vars
            .get(name)
            .ok_or_else(|| anyhow!("unknown placeholder {{{name}}} in {arg:?}"))?;
        out.push_str(value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Run with stdout/stderr appended to the given transcript files.
pub fn run_logged(argv: &[String], stdout: &File, stderr: &File) -> Result<ExitStatus> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command is empty"))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout.try_clone().context("clone stdout log")?))
        .stderr(Stdio::from(stderr.try_clone().context("clone stderr log")?));
    command
        .status()
        .with_context(|| format!("spawn {}", format_command_line(argv)))
}

/// Run and capture both streams.
pub fn run_captured(argv: &[String], cwd: Option<&Path>) -> Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command is empty"))?;
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command
        .output()
        .with_context(|| format!("spawn {}", format_command_line(argv)))
}

pub fn exit_status_string(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("{code}")
    } else {
        "terminated by signal".to_string()
    }
}

pub fn format_command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg.chars().all(|ch| {
        matches!(
            ch,
            'a'..='z'
                | 'A'..='Z'
                | '0'..='9'
                | '_'
                | '-'
                | '.'
                | '/'
                | ':'
                | '@'
                | '+'
                | '='
        )
    });
    if safe {
        return arg.to_string();
    }
    let escaped = arg.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}
