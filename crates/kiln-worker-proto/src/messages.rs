//! Message types mirroring `proto/worker_protocol.proto`.

use prost::Message;

/// One unit of work for a persistent worker.
#[derive(Clone, PartialEq, Message)]
pub struct WorkRequest {
    /// Fully expanded command-line arguments for this piece of work.
    #[prost(string, repeated, tag = "1")]
    pub arguments: Vec<String>,

    /// Inputs visible to this piece of work, with content digests.
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<Input>,

    /// Reserved for multiplexed workers; kiln always emits 0.
    #[prost(int32, tag = "3")]
    pub request_id: i32,
}

/// One input file of a work request.
#[derive(Clone, PartialEq, Message)]
pub struct Input {
    /// Path relative to the execution root.
    #[prost(string, tag = "1")]
    pub path: String,

    /// Lowercase hex digest of the file contents; empty when unknown.
    #[prost(string, tag = "2")]
    pub digest: String,
}

/// The worker's answer to a single [`WorkRequest`].
#[derive(Clone, PartialEq, Message)]
pub struct WorkResponse {
    /// Exit code of the piece of work; zero means success.
    #[prost(int32, tag = "1")]
    pub exit_code: i32,

    /// Tool output, appended verbatim to the action's stderr.
    #[prost(bytes = "vec", tag = "2")]
    pub output: Vec<u8>,

    /// Reserved for multiplexed workers; ignored by kiln.
    #[prost(int32, tag = "3")]
    pub request_id: i32,
}
