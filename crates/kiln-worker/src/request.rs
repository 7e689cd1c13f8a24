//! Work-request assembly.

use std::path::Path;

use kiln_worker_proto::{Input, WorkRequest};

use crate::error::ExecError;
use crate::flagfile::expand_argument;
use crate::spawn::{ActionInput, ExecutionPolicy};

/// Builds the wire request for one action.
///
/// The arguments are the flag files from the classifier, fully expanded
/// against `exec_root`. Every expanded input contributes one record with
/// its exec path and the lowercase hex digest from the policy's metadata
/// oracle; inputs without a digest contribute an empty string rather than
/// dropping the record, so the worker sees a stable input list.
///
/// # Errors
///
/// Returns an error when a flag file cannot be expanded or input metadata
/// cannot be read.
pub fn build_work_request(
    exec_root: &Path,
    flag_files: &[String],
    inputs: &[ActionInput],
    policy: &dyn ExecutionPolicy,
) -> Result<WorkRequest, ExecError> {
    let mut arguments = Vec::new();
    for flag_file in flag_files {
        expand_argument(exec_root, flag_file, &mut arguments)?;
    }

    let mut request_inputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let digest = policy
            .input_digest(input)?
            .map(hex::encode)
            .unwrap_or_default();
        request_inputs.push(Input {
            path: input.exec_path_string(),
            digest,
        });
    }

    Ok(WorkRequest {
        arguments,
        inputs: request_inputs,
        request_id: 0,
    })
}
