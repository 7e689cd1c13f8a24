//! Argument classification and flag-file expansion.
//!
//! A worker-compatible command line has two parts: *startup arguments*,
//! which configure the tool itself and therefore identify a reusable worker
//! process, and *flag-file references* (`@file`, `-flagfile=file`,
//! `--flagfile=file`), which carry the per-request work. The classifier
//! splits the two apart; expansion turns the flag-file references into the
//! argument list that goes into the work request.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ExecError;

/// Token appended to the startup arguments to switch the tool into its
/// request/response loop.
pub const PERSISTENT_WORKER_FLAG: &str = "--persistent_worker";

/// Pattern for `@flagfile.txt`, `-flagfile=flagfile.txt` and
/// `--flagfile=flagfile.txt`.
///
/// The `@@` escape is deliberately not handled here but in
/// [`expand_argument`], so this predicate stays purely syntactic.
fn flag_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\A(?:@|--?flagfile=).+\z").expect("flag file pattern"))
}

/// Whether `arg` references a flag file on the command line.
#[must_use]
pub fn is_flag_file_arg(arg: &str) -> bool {
    flag_file_pattern().is_match(arg)
}

/// A spawn's argv split into worker startup arguments and flag-file
/// references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedArgs {
    /// Arguments the worker process is started with. Always ends with
    /// [`PERSISTENT_WORKER_FLAG`] followed by any configured extras.
    pub startup_args: Vec<String>,

    /// The flag-file references, in command-line order.
    pub flag_files: Vec<String>,
}

/// Splits `argv` into startup arguments and flag-file references.
///
/// The startup partition gets [`PERSISTENT_WORKER_FLAG`] appended, then any
/// extra flags configured for `mnemonic`, in configured order.
///
/// # Errors
///
/// Returns [`ExecError::NoFlagFile`] when no argument references a flag
/// file; without one there is no way to hand the worker its per-request
/// work.
pub fn classify_arguments(
    argv: &[String],
    mnemonic: &str,
    extra_flags: &HashMap<String, Vec<String>>,
) -> Result<ClassifiedArgs, ExecError> {
    let mut startup_args = Vec::with_capacity(argv.len() + 1);
    let mut flag_files = Vec::new();

    for arg in argv {
        if is_flag_file_arg(arg) {
            flag_files.push(arg.clone());
        } else {
            startup_args.push(arg.clone());
        }
    }

    if flag_files.is_empty() {
        return Err(ExecError::NoFlagFile {
            mnemonic: mnemonic.to_string(),
        });
    }

    startup_args.push(PERSISTENT_WORKER_FLAG.to_string());
    if let Some(extras) = extra_flags.get(mnemonic) {
        startup_args.extend(extras.iter().cloned());
    }

    Ok(ClassifiedArgs {
        startup_args,
        flag_files,
    })
}

/// Recursively expands `arg` into `arguments`.
///
/// An argument starting with a single `@` names a UTF-8 text file relative
/// to `exec_root`; each non-empty line of that file is expanded in turn. An
/// argument starting with `@@` is an escaped literal and passes through
/// unchanged, as does everything else, including `--flagfile=` forms, which
/// the consuming tool expands itself.
///
/// # Errors
///
/// Returns [`ExecError::FlagFileRead`] when a referenced file cannot be
/// read and [`ExecError::CyclicFlagFile`] when a file references itself,
/// directly or through another flag file.
pub fn expand_argument(
    exec_root: &Path,
    arg: &str,
    arguments: &mut Vec<String>,
) -> Result<(), ExecError> {
    let mut in_flight = HashSet::new();
    expand_into(exec_root, arg, arguments, &mut in_flight)
}

fn expand_into(
    exec_root: &Path,
    arg: &str,
    arguments: &mut Vec<String>,
    in_flight: &mut HashSet<PathBuf>,
) -> Result<(), ExecError> {
    if let Some(rest) = arg.strip_prefix('@') {
        if !rest.starts_with('@') {
            let path = exec_root.join(rest);
            if !in_flight.insert(path.clone()) {
                return Err(ExecError::CyclicFlagFile { path });
            }

            let text = fs::read_to_string(&path).map_err(|source| ExecError::FlagFileRead {
                path: path.clone(),
                source,
            })?;
            for line in text.lines() {
                if !line.is_empty() {
                    expand_into(exec_root, line, arguments, in_flight)?;
                }
            }

            in_flight.remove(&path);
            return Ok(());
        }
    }

    arguments.push(arg.to_string());
    Ok(())
}
