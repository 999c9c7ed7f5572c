//! Wire-format records for the scheduler.
//!
//! The message and field layout mirrors the Remote Execution API v2
//! (`build.bazel.remote.execution.v2`), the `google.rpc` /
//! `google.longrunning` envelopes it rides on, and the scheduler-internal
//! queue records. The prost annotations are maintained by hand instead of
//! being generated from .proto files, so the tags below *are* the wire
//! contract. Treat any tag change as a protocol break.

use std::collections::BTreeMap;

/// A content digest: lowercase hex hash plus the blob size in bytes.
/// Two blobs with an equal digest are assumed byte-identical.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Digest {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SymlinkNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub target: String,
}

/// One node of the Merkle input tree. File, directory and symlink entries
/// must each be sorted by name, and names must be unique across all three
/// lists. The validator enforces that contract.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub files: Vec<FileNode>,
    #[prost(message, repeated, tag = "2")]
    pub directories: Vec<DirectoryNode>,
    #[prost(message, repeated, tag = "3")]
    pub symlinks: Vec<SymlinkNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, repeated, tag = "1")]
    pub arguments: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub environment_variables: Vec<command::EnvironmentVariable>,
    #[prost(string, repeated, tag = "3")]
    pub output_files: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub output_directories: Vec<String>,
    #[prost(message, optional, tag = "5")]
    pub platform: Option<Platform>,
    #[prost(string, tag = "6")]
    pub working_directory: String,
}

pub mod command {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EnvironmentVariable {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Platform {
    #[prost(message, repeated, tag = "1")]
    pub properties: Vec<platform::Property>,
}

pub mod platform {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Property {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Action {
    #[prost(message, optional, tag = "1")]
    pub command_digest: Option<Digest>,
    #[prost(message, optional, tag = "2")]
    pub input_root_digest: Option<Digest>,
    #[prost(message, optional, tag = "6")]
    pub timeout: Option<::prost_types::Duration>,
    #[prost(bool, tag = "7")]
    pub do_not_cache: bool,
}

pub mod execution_stage {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Value {
        Unknown = 0,
        CacheCheck = 1,
        Queued = 2,
        Executing = 3,
        Completed = 4,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteOperationMetadata {
    #[prost(enumeration = "execution_stage::Value", tag = "1")]
    pub stage: i32,
    #[prost(message, optional, tag = "2")]
    pub action_digest: Option<Digest>,
    #[prost(string, tag = "3")]
    pub stdout_stream_name: String,
    #[prost(string, tag = "4")]
    pub stderr_stream_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputFile {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputDirectory {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "3")]
    pub tree_digest: Option<Digest>,
}

/// The cached outcome of a completed action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResult {
    #[prost(message, repeated, tag = "2")]
    pub output_files: Vec<OutputFile>,
    #[prost(message, repeated, tag = "3")]
    pub output_directories: Vec<OutputDirectory>,
    #[prost(int32, tag = "4")]
    pub exit_code: i32,
    #[prost(bytes = "bytes", tag = "5")]
    pub stdout_raw: ::bytes::Bytes,
    #[prost(message, optional, tag = "6")]
    pub stdout_digest: Option<Digest>,
    #[prost(bytes = "bytes", tag = "7")]
    pub stderr_raw: ::bytes::Bytes,
    #[prost(message, optional, tag = "8")]
    pub stderr_digest: Option<Digest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ActionResult>,
    #[prost(bool, tag = "2")]
    pub cached_result: bool,
    #[prost(message, optional, tag = "3")]
    pub status: Option<rpc::Status>,
}

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ToolDetails {
    #[prost(string, tag = "1")]
    pub tool_name: String,
    #[prost(string, tag = "2")]
    pub tool_version: String,
}

/// Client-supplied correlation metadata, forwarded on every consumed RPC.
/// Also the key of the recent-cache-served-execution dedup cache, hence
/// the Eq/Hash derives.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct RequestMetadata {
    #[prost(message, optional, tag = "1")]
    pub tool_details: Option<ToolDetails>,
    #[prost(string, tag = "2")]
    pub action_id: String,
    #[prost(string, tag = "3")]
    pub tool_invocation_id: String,
    #[prost(string, tag = "4")]
    pub correlated_invocations_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionPolicy {
    #[prost(int32, tag = "1")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultsCachePolicy {
    #[prost(int32, tag = "1")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingBlobsRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, repeated, tag = "2")]
    pub blob_digests: Vec<Digest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingBlobsResponse {
    #[prost(message, repeated, tag = "2")]
    pub missing_blob_digests: Vec<Digest>,
}

/// google.bytestream read/write, the blob transfer surface of workers.
pub mod bytestream {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadRequest {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(int64, tag = "2")]
        pub read_offset: i64,
        #[prost(int64, tag = "3")]
        pub read_limit: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadResponse {
        #[prost(bytes = "bytes", tag = "10")]
        pub data: ::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteRequest {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(int64, tag = "2")]
        pub write_offset: i64,
        #[prost(bool, tag = "3")]
        pub finish_write: bool,
        #[prost(bytes = "bytes", tag = "10")]
        pub data: ::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteResponse {
        #[prost(int64, tag = "1")]
        pub committed_size: i64,
    }
}

/// google.rpc / google.longrunning envelopes.
pub mod rpc {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: String,
        #[prost(message, repeated, tag = "3")]
        pub details: Vec<::prost_types::Any>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PreconditionFailure {
        #[prost(message, repeated, tag = "1")]
        pub violations: Vec<precondition_failure::Violation>,
    }

    pub mod precondition_failure {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Violation {
            #[prost(string, tag = "1")]
            pub r#type: String,
            #[prost(string, tag = "2")]
            pub subject: String,
            #[prost(string, tag = "3")]
            pub description: String,
        }
    }
}

/// A mutable execution record, owned by the backplane. `metadata` packs an
/// [ExecuteOperationMetadata] (or [QueuedOperationMetadata] once queued);
/// `result` is set exactly once, when the operation completes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<::prost_types::Any>,
    #[prost(bool, tag = "3")]
    pub done: bool,
    #[prost(oneof = "operation::Result", tags = "4, 5")]
    pub result: Option<operation::Result>,
}

pub mod operation {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "4")]
        Error(super::rpc::Status),
        #[prost(message, tag = "5")]
        Response(::prost_types::Any),
    }
}

/// The prequeue record, created once per execute() call and immutable
/// thereafter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteEntry {
    #[prost(string, tag = "1")]
    pub operation_name: String,
    #[prost(message, optional, tag = "2")]
    pub action_digest: Option<Digest>,
    #[prost(bool, tag = "3")]
    pub skip_cache_lookup: bool,
    #[prost(message, optional, tag = "4")]
    pub request_metadata: Option<RequestMetadata>,
    #[prost(message, optional, tag = "5")]
    pub execution_policy: Option<ExecutionPolicy>,
    #[prost(message, optional, tag = "6")]
    pub results_cache_policy: Option<ResultsCachePolicy>,
    #[prost(message, optional, tag = "7")]
    pub queued_timestamp: Option<::prost_types::Timestamp>,
    #[prost(string, tag = "8")]
    pub stdout_stream_name: String,
    #[prost(string, tag = "9")]
    pub stderr_stream_name: String,
}

/// A fully materialized input tree: the root digest plus every reachable
/// Directory, keyed by hash. A BTreeMap keeps the canonical encoding
/// deterministic, which the queued-operation digest depends on.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tree {
    #[prost(message, optional, tag = "1")]
    pub root_digest: Option<Digest>,
    #[prost(btree_map = "string, message", tag = "2")]
    pub directories: BTreeMap<String, Directory>,
}

/// The self-contained unit handed to workers: action + command + resolved
/// tree, stored as one content-addressed blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueuedOperation {
    #[prost(message, optional, tag = "1")]
    pub action: Option<Action>,
    #[prost(message, optional, tag = "2")]
    pub command: Option<Command>,
    #[prost(message, optional, tag = "3")]
    pub tree: Option<Tree>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueuedOperationMetadata {
    #[prost(message, optional, tag = "1")]
    pub execute_operation_metadata: Option<ExecuteOperationMetadata>,
    #[prost(message, optional, tag = "2")]
    pub queued_operation_digest: Option<Digest>,
    #[prost(message, optional, tag = "3")]
    pub request_metadata: Option<RequestMetadata>,
}

/// The unit placed on the distributed queue for worker dequeue/matching.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueEntry {
    #[prost(message, optional, tag = "1")]
    pub execute_entry: Option<ExecuteEntry>,
    #[prost(message, optional, tag = "2")]
    pub queued_operation_digest: Option<Digest>,
    #[prost(message, optional, tag = "3")]
    pub platform: Option<Platform>,
}

macro_rules! impl_name {
    ($type:ty, $package:literal, $name:literal) => {
        impl ::prost::Name for $type {
            const NAME: &'static str = $name;
            const PACKAGE: &'static str = $package;
        }
    };
}

// Names for everything that travels packed inside a google.protobuf.Any.
impl_name!(Action, "build.bazel.remote.execution.v2", "Action");
impl_name!(ActionResult, "build.bazel.remote.execution.v2", "ActionResult");
impl_name!(
    ExecuteOperationMetadata,
    "build.bazel.remote.execution.v2",
    "ExecuteOperationMetadata"
);
impl_name!(
    ExecuteResponse,
    "build.bazel.remote.execution.v2",
    "ExecuteResponse"
);
impl_name!(rpc::PreconditionFailure, "google.rpc", "PreconditionFailure");
impl_name!(
    QueuedOperationMetadata,
    "quern.v1",
    "QueuedOperationMetadata"
);
impl_name!(QueuedOperation, "quern.v1", "QueuedOperation");
