//! Shared test fixtures: canonical wire records and a scriptable worker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lazy_static::lazy_static;
use prost::Message;
use tonic::async_trait;

use quern_reapi::proto;

use crate::backplane::MemoryBackplane;
use crate::errors::Error;
use crate::workers::{Worker, WorkerPool};

lazy_static! {
    pub static ref REQUEST_METADATA: proto::RequestMetadata = proto::RequestMetadata {
        tool_details: Some(proto::ToolDetails {
            tool_name: "quern-test".into(),
            tool_version: "1".into(),
        }),
        action_id: "action-1".into(),
        tool_invocation_id: "invocation-1".into(),
        correlated_invocations_id: "build-1".into(),
    };
    pub static ref COMMAND: proto::Command = proto::Command {
        arguments: vec!["/bin/sh".into(), "-c".into(), "true".into()],
        ..Default::default()
    };
    pub static ref COMMAND_DIGEST: proto::Digest = proto::Digest::of_message(&*COMMAND);
    pub static ref INPUT_ROOT: proto::Directory = proto::Directory {
        files: vec![file_node("a.txt", b"aaa"), file_node("b.txt", b"bbb")],
        ..Default::default()
    };
    pub static ref INPUT_ROOT_DIGEST: proto::Digest = proto::Digest::of_message(&*INPUT_ROOT);
    pub static ref ACTION: proto::Action = proto::Action {
        command_digest: Some(COMMAND_DIGEST.clone()),
        input_root_digest: Some(INPUT_ROOT_DIGEST.clone()),
        ..Default::default()
    };
    pub static ref ACTION_DIGEST: proto::Digest = proto::Digest::of_message(&*ACTION);
    pub static ref ACTION_RESULT: proto::ActionResult = proto::ActionResult {
        exit_code: 0,
        stdout_raw: Bytes::from_static(b"ok\n"),
        ..Default::default()
    };
}

pub fn file_node(name: &str, content: &[u8]) -> proto::FileNode {
    proto::FileNode {
        name: name.to_string(),
        digest: Some(proto::Digest::of_blob(content)),
        is_executable: false,
    }
}

pub fn directory_node(name: &str, directory: &proto::Directory) -> proto::DirectoryNode {
    proto::DirectoryNode {
        name: name.to_string(),
        digest: Some(proto::Digest::of_message(directory)),
    }
}

/// A worker whose responses can be scripted per call. Unscripted calls
/// answer from the held blob map.
#[derive(Default)]
pub struct FakeWorker {
    blobs: Mutex<HashMap<proto::Digest, Bytes>>,
    find_missing_script: Mutex<VecDeque<Result<Vec<proto::Digest>, Error>>>,
    get_blob_script: Mutex<VecDeque<Result<Bytes, Error>>>,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    pub find_missing_calls: AtomicUsize,
    pub get_blob_calls: AtomicUsize,
    pub uploads: Mutex<Vec<proto::Digest>>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(self, content: &[u8]) -> Self {
        self.blobs.lock().unwrap().insert(
            proto::Digest::of_blob(content),
            Bytes::copy_from_slice(content),
        );
        self
    }

    pub fn with_message<M: Message>(self, message: &M) -> Self {
        self.with_blob(&message.encode_to_vec())
    }

    pub fn script_find_missing(self, response: Result<Vec<proto::Digest>, Error>) -> Self {
        self.find_missing_script.lock().unwrap().push_back(response);
        self
    }

    pub fn script_get_blob(self, response: Result<Bytes, Error>) -> Self {
        self.get_blob_script.lock().unwrap().push_back(response);
        self
    }

    /// Makes every get_blob wait on `gate` before answering, so a test
    /// can hold fetches in flight and release them at will.
    pub fn with_gate(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn holds(&self, digest: &proto::Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(digest)
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn find_missing_blobs(
        &self,
        digests: Vec<proto::Digest>,
        _metadata: &proto::RequestMetadata,
    ) -> Result<Vec<proto::Digest>, Error> {
        self.find_missing_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.find_missing_script.lock().unwrap().pop_front() {
            return response;
        }
        let blobs = self.blobs.lock().unwrap();
        Ok(digests
            .into_iter()
            .filter(|d| !blobs.contains_key(d))
            .collect())
    }

    async fn get_blob(
        &self,
        digest: &proto::Digest,
        _metadata: &proto::RequestMetadata,
    ) -> Result<Bytes, Error> {
        self.get_blob_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Unavailable("gate closed".into()))?;
        }
        if let Some(response) = self.get_blob_script.lock().unwrap().pop_front() {
            return response;
        }
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(digest.clone()))
    }

    async fn put_blob(
        &self,
        digest: &proto::Digest,
        data: Bytes,
        _metadata: &proto::RequestMetadata,
    ) -> Result<(), Error> {
        self.uploads.lock().unwrap().push(digest.clone());
        self.blobs.lock().unwrap().insert(digest.clone(), data);
        Ok(())
    }
}

/// Registers `workers` with the backplane and builds a pool whose factory
/// serves them.
pub async fn worker_pool(
    backplane: Arc<MemoryBackplane>,
    workers: Vec<(&str, Arc<FakeWorker>)>,
) -> Arc<WorkerPool> {
    let mut stubs: HashMap<String, Arc<FakeWorker>> = HashMap::new();
    for (name, worker) in workers {
        backplane.add_worker(name).await;
        stubs.insert(name.to_string(), worker);
    }
    Arc::new(WorkerPool::new(
        backplane,
        Box::new(move |name| {
            stubs
                .get(name)
                .map(|w| w.clone() as Arc<dyn Worker>)
                .ok_or_else(|| Error::Unavailable(format!("unknown worker {}", name)))
        }),
    ))
}
