//! Buildfile decoder.
//!
//! Turns build-file text into decoded layers. Only FROM, COPY, RUN and CMD
//! are understood; `#` comments, blank lines and trailing-`\` continuations
//! are handled the way Dockerfiles do.

use std::path::Path;

use stratum_core::error::{Result, StratumError};
use stratum_core::{Layer, LayerKind};

/// Decoded build file.
#[derive(Debug, Clone, PartialEq)]
pub struct Buildfile {
    pub layers: Vec<Layer>,
}

impl Buildfile {
    /// Decode build-file text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut layers = Vec::new();

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let layer = parse_instruction(trimmed, line_num)?;
            if layers.is_empty() && layer.kind != LayerKind::From {
                return Err(StratumError::Parse {
                    line: line_num,
                    message: "first instruction must be FROM".to_string(),
                });
            }
            layers.push(layer);
        }

        if layers.is_empty() {
            return Err(StratumError::Parse {
                line: 0,
                message: "build file contains no instructions".to_string(),
            });
        }

        Ok(Buildfile { layers })
    }

    /// Decode a build file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::Config(format!(
                "Failed to read build file at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Base image reference named by the leading FROM.
    pub fn base(&self) -> &str {
        self.layers
            .first()
            .map(|l| l.value.as_str())
            .unwrap_or_default()
    }
}

/// Join lines ending with `\` into logical lines, keeping the line number
/// each one starts on.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        // Comment lines inside a continuation are dropped.
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        let line = if current.is_empty() { line } else { line.trim_start() };
        match line.trim_end().strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                logical_lines.push((start, std::mem::take(&mut current)));
            }
        }
    }

    // Handle trailing continuation without final line
    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line into a layer.
fn parse_instruction(line: &str, line_num: usize) -> Result<Layer> {
    let (keyword, rest) = split_first_word(line);
    let rest = rest.trim();

    let kind = match keyword.to_ascii_uppercase().as_str() {
        "FROM" => LayerKind::From,
        "COPY" => LayerKind::Copy,
        "RUN" => LayerKind::Run,
        "CMD" => LayerKind::Cmd,
        _ => {
            return Err(StratumError::Parse {
                line: line_num,
                message: format!("unknown instruction '{}'", keyword),
            });
        }
    };

    if rest.is_empty() {
        return Err(StratumError::Parse {
            line: line_num,
            message: format!("{} requires an argument", kind),
        });
    }

    let value = match kind {
        LayerKind::From => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() != 1 {
                return Err(StratumError::Parse {
                    line: line_num,
                    message: "FROM takes exactly one image reference".to_string(),
                });
            }
            parts[0].to_string()
        }
        LayerKind::Copy => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() != 2 {
                return Err(StratumError::Parse {
                    line: line_num,
                    message: format!(
                        "COPY requires exactly a source and a destination, got {} argument(s)",
                        parts.len()
                    ),
                });
            }
            parts.join(" ")
        }
        LayerKind::Run if rest.starts_with('[') => parse_json_array(rest, line_num)?.join(" "),
        _ => rest.to_string(),
    };

    Ok(Layer::new(kind, value))
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Parse an exec-form JSON array (`["a", "b"]`).
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| StratumError::Parse {
        line: line_num,
        message: format!("invalid JSON array: {}", e),
    })
}
