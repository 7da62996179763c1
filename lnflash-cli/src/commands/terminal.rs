//! Interactive terminal and YMODEM receive.

use anyhow::{Context, Result};
use console::style;
use lnflash::{YmodemReceiver, clean_monitor_text};
use std::io::{self, BufRead, Write};
use std::path::Path;

use super::{open_port, with_session};
use crate::config::Config;
use crate::{Cli, was_interrupted};

/// What to do with one line typed at the terminal prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Skip,
    Exit,
    Command(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Skip,
        "exit" | "quit" => Input::Exit,
        cmd => Input::Command(cmd),
    }
}

/// Terminal command implementation.
pub(crate) fn cmd_terminal(cli: &Cli, config: &Config) -> Result<()> {
    with_session(cli, config, |session| {
        if !cli.quiet {
            eprintln!(
                "{} Terminal ready, type RAM code commands ({} to leave)",
                style("⌨").cyan(),
                style("exit").bold()
            );
        }

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut line = String::new();
        loop {
            eprint!("{} ", style(">").green().bold());
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 || was_interrupted() {
                break;
            }

            match classify(&line) {
                Input::Skip => {},
                Input::Exit => break,
                Input::Command(cmd) => {
                    let output = session
                        .execute(cmd)
                        .with_context(|| format!("Command '{cmd}' failed"))?;
                    write!(stdout, "{}", clean_monitor_text(&output))?;
                    stdout.flush()?;
                },
            }
        }
        Ok(())
    })
}

/// Receive command implementation.
pub(crate) fn cmd_receive(cli: &Cli, config: &Config, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }

    let mut port = open_port(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Waiting for a YMODEM sender...", style("⏳").yellow());
    }

    let received = YmodemReceiver::new(&mut port)
        .receive(dir)
        .context("YMODEM receive failed")?;

    if !cli.quiet {
        eprintln!(
            "{} Received {} ({} bytes)",
            style("✓").green(),
            received.info.name,
            received.bytes
        );
    }
    println!("{}", received.path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_blank_lines() {
        assert_eq!(classify(""), Input::Skip);
        assert_eq!(classify("  \r\n"), Input::Skip);
    }

    #[test]
    fn test_classify_exit_words() {
        assert_eq!(classify("exit\n"), Input::Exit);
        assert_eq!(classify(" quit "), Input::Exit);
    }

    #[test]
    fn test_classify_command_is_trimmed() {
        assert_eq!(classify("flash_info\r\n"), Input::Command("flash_info"));
        assert_eq!(
            classify("gpio_write A10 1\n"),
            Input::Command("gpio_write A10 1")
        );
    }
}
