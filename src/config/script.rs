//! Timed command scripts
//!
//! `--command_script="30:wait=true;1m:iodepth=32;2m:stop"` dispatches each
//! command once elapsed wall time passes its timestamp. Times are integers
//! with an optional `s` (default) or `m` suffix.

use crate::Result;
use anyhow::{bail, Context};
use std::collections::VecDeque;
use std::str::FromStr;

/// One scheduled command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCommand {
    /// Elapsed seconds after which the command fires.
    pub at_s: u64,
    pub command: String,
}

/// Ordered queue of scheduled commands, drained by the supervision loop.
#[derive(Debug, Clone, Default)]
pub struct CommandScript(VecDeque<ScriptedCommand>);

impl CommandScript {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Pop the next command whose timestamp has passed, if any.
    pub fn pop_due(&mut self, elapsed_s: u64) -> Option<ScriptedCommand> {
        if self.0.front().is_some_and(|c| c.at_s < elapsed_s) {
            self.0.pop_front()
        } else {
            None
        }
    }
}

impl FromStr for CommandScript {
    type Err = anyhow::Error;

    fn from_str(script: &str) -> Result<Self> {
        let mut entries = VecDeque::new();
        if script.is_empty() {
            return Ok(Self(entries));
        }

        for part in script.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (time_str, command) = part
                .split_once(':')
                .with_context(|| format!("invalid command in command_script: {}", part))?;

            let at_s = parse_time_s(time_str.trim())
                .with_context(|| format!("invalid time: {}", time_str))?;

            entries.push_back(ScriptedCommand {
                at_s,
                command: command.trim().to_string(),
            });
        }

        Ok(Self(entries))
    }
}

fn parse_time_s(s: &str) -> Result<u64> {
    let (digits, multiplier) = match s.strip_suffix('m') {
        Some(rest) => (rest, 60),
        None => (s.strip_suffix('s').unwrap_or(s), 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("expected an integer with optional s/m suffix, got {:?}", s);
    }
    let value: u64 = digits.parse()?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_script() {
        let script: CommandScript = "".parse().unwrap();
        assert!(script.is_empty());
    }

    #[test]
    fn test_parse_suffixes() {
        let script: CommandScript = "5:wait=true;30s:iodepth=32;2m:stop".parse().unwrap();
        assert_eq!(script.len(), 3);

        let mut script = script;
        assert_eq!(script.pop_due(6).unwrap().at_s, 5);
        assert_eq!(script.pop_due(31).unwrap().command, "iodepth=32");
        assert!(script.pop_due(31).is_none());
        assert_eq!(script.pop_due(121).unwrap().at_s, 120);
        assert!(script.is_empty());
    }

    #[test]
    fn test_pop_due_requires_elapsed_past() {
        let mut script: CommandScript = "10:stop".parse().unwrap();
        assert!(script.pop_due(10).is_none());
        assert!(script.pop_due(11).is_some());
    }

    #[test]
    fn test_invalid_entries() {
        assert!("nonsense".parse::<CommandScript>().is_err());
        assert!("x:stop".parse::<CommandScript>().is_err());
        assert!("5h:stop".parse::<CommandScript>().is_err());
        assert!(":stop".parse::<CommandScript>().is_err());
    }
}
