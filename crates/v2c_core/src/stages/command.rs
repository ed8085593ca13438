//! Running external tools with line-by-line progress callbacks.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::thread;

use crate::task::{StageContext, StageError};

use super::StageResult;

/// Run `cmd`, feeding every stdout line to `on_line`.
///
/// `on_line` is where progress gets reported, so an error from it (usually
/// the abort signal) kills the tool and is returned as is. Stderr is
/// collected on a helper thread and lands in the task log's tail buffer. A
/// non-zero exit becomes `StageError::CommandFailed` carrying the last
/// stderr line.
pub(crate) fn run_streaming(
    ctx: &StageContext<'_>,
    tool: &str,
    cmd: &mut Command,
    mut on_line: impl FnMut(&str) -> StageResult<()>,
) -> StageResult<()> {
    ctx.logger.command(&describe(cmd));

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StageError::io(format!("launching {}", tool), e))?;

    let stderr_reader = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            BufReader::new(stderr)
                .lines()
                .map_while(Result::ok)
                .collect::<Vec<String>>()
        })
    });

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    terminate(&mut child, tool);
                    return Err(StageError::io(format!("reading {} output", tool), e));
                }
            };
            ctx.logger.output_line(&line, false);
            if let Err(e) = on_line(&line) {
                terminate(&mut child, tool);
                return Err(e);
            }
        }
    }

    let status = child
        .wait()
        .map_err(|e| StageError::io(format!("waiting for {}", tool), e))?;

    let stderr_lines = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    for line in &stderr_lines {
        ctx.logger.output_line(line, true);
    }

    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        ctx.logger.show_tail(tool);
        let message = stderr_lines
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_default();
        return Err(StageError::command_failed(tool, exit_code, message));
    }

    Ok(())
}

/// Run `cmd` to completion and return its stdout.
pub(crate) fn run_captured(tool: &str, cmd: &mut Command) -> StageResult<Vec<u8>> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| StageError::io(format!("launching {}", tool), e))?;

    if !output.status.success() {
        return Err(StageError::command_failed(
            tool,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(output.stdout)
}

fn terminate(child: &mut Child, tool: &str) {
    if let Err(e) = child.kill() {
        tracing::warn!(tool, error = %e, "Failed to kill child process");
    }
    let _ = child.wait();
}

/// Shell-like rendering of a command for the task log.
fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| {
        let arg = a.to_string_lossy();
        if arg.contains(' ') {
            format!("'{}'", arg)
        } else {
            arg.into_owned()
        }
    }));
    parts.join(" ")
}
