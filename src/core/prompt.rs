/// Operator interaction
///
/// Prompts return typed answers; nothing downstream parses free text.

use clap::ValueEnum;
use colored::Colorize;
use std::io::{self, BufRead, Write};

use crate::core::error::{Result, StackError};

/// How an optional step is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Decision {
    Ask,
    Always,
    Never,
}

pub trait Prompter {
    /// Yes/no question; `default` is used for an empty answer
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool>;

    /// Destructive confirmation: only the exact `phrase` counts as yes
    fn confirm_phrase(&mut self, question: &str, phrase: &str) -> Result<bool>;

    /// Pick services among `offered`; an empty result means cancel
    fn select(&mut self, offered: &[String]) -> Result<Vec<String>>;
}

pub fn decide(
    decision: Decision,
    prompter: &mut dyn Prompter,
    question: &str,
    default: bool,
) -> Result<bool> {
    match decision {
        Decision::Always => Ok(true),
        Decision::Never => Ok(false),
        Decision::Ask => prompter.confirm(question, default),
    }
}

fn prompt_err(e: io::Error) -> StackError {
    StackError::Prompt(e.to_string())
}

/// Line-oriented prompts on any reader/writer pair (stdin/stdout in the CLI)
pub struct TerminalPrompter<R, W> {
    input: R,
    output: W,
}

impl TerminalPrompter<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalPrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// `None` on end of input
    fn read_line(&mut self) -> Result<Option<String>> {
        self.output.flush().map_err(prompt_err)?;
        let mut line = String::new();
        let read = self.input.read_line(&mut line).map_err(prompt_err)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> Prompter for TerminalPrompter<R, W> {
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            write!(self.output, "{} {}: ", question, hint).map_err(prompt_err)?;
            let Some(answer) = self.read_line()? else {
                return Ok(false);
            };
            match answer.to_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => writeln!(self.output, "Please answer y or n.").map_err(prompt_err)?,
            }
        }
    }

    fn confirm_phrase(&mut self, question: &str, phrase: &str) -> Result<bool> {
        writeln!(self.output, "{}", question.yellow()).map_err(prompt_err)?;
        write!(self.output, "Type '{}' to continue: ", phrase).map_err(prompt_err)?;
        Ok(self.read_line()?.as_deref() == Some(phrase))
    }

    fn select(&mut self, offered: &[String]) -> Result<Vec<String>> {
        if offered.is_empty() {
            return Ok(vec![]);
        }

        writeln!(self.output, "Available services:").map_err(prompt_err)?;
        for (i, name) in offered.iter().enumerate() {
            writeln!(self.output, "  {}) {}", i + 1, name).map_err(prompt_err)?;
        }

        'ask: loop {
            write!(
                self.output,
                "Select services (numbers or names, 'all', empty to cancel): "
            )
            .map_err(prompt_err)?;
            let Some(answer) = self.read_line()? else {
                return Ok(vec![]);
            };
            if answer.eq_ignore_ascii_case("all") {
                return Ok(offered.to_vec());
            }

            let mut picked: Vec<String> = Vec::new();
            for token in answer.split(|c: char| c == ',' || c.is_whitespace()).filter(|t| !t.is_empty()) {
                let chosen = match token.parse::<usize>() {
                    Ok(n) if n >= 1 && n <= offered.len() => Some(offered[n - 1].clone()),
                    Ok(_) => None,
                    Err(_) => offered.iter().find(|o| o.as_str() == token).cloned(),
                };
                match chosen {
                    Some(name) if !picked.contains(&name) => picked.push(name),
                    Some(_) => {}
                    None => {
                        writeln!(self.output, "'{}' is not one of the offered services.", token)
                            .map_err(prompt_err)?;
                        continue 'ask;
                    }
                }
            }
            return Ok(picked);
        }
    }
}

/// Prompter for runs without a terminal: optional steps take their default,
/// destructive confirmation is given only by `--yes`.
pub struct NonInteractive {
    pub assume_yes: bool,
}

impl Prompter for NonInteractive {
    fn confirm(&mut self, _question: &str, default: bool) -> Result<bool> {
        Ok(self.assume_yes || default)
    }

    fn confirm_phrase(&mut self, _question: &str, _phrase: &str) -> Result<bool> {
        Ok(self.assume_yes)
    }

    fn select(&mut self, _offered: &[String]) -> Result<Vec<String>> {
        Err(StackError::Prompt(
            "no services given and no terminal to ask; pass service names".to_string(),
        ))
    }
}
