//! Digest-addressed wire records shared by the scheduler and its
//! collaborators (workers, backplane, service adapters).

pub mod digests;
pub mod proto;

pub use digests::{blob_name, ActionKey, DigestError};

use prost::Name;

/// Packs a message into a `google.protobuf.Any`, type-url included.
pub fn pack_any<M: Name>(message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: M::type_url(),
        value: message.encode_to_vec(),
    }
}

/// Unpacks an `Any` if it holds an `M`; `None` on a type-url mismatch or
/// an undecodable payload.
pub fn unpack_any<M: Name + Default>(any: &prost_types::Any) -> Option<M> {
    if any.type_url != M::type_url() {
        return None;
    }
    M::decode(any.value.as_slice()).ok()
}

pub fn any_is<M: Name>(any: &prost_types::Any) -> bool {
    any.type_url == M::type_url()
}

/// google.rpc.Code value carried by a CANCELLED completion.
pub const RPC_CODE_CANCELLED: i32 = 1;
pub const RPC_CODE_OK: i32 = 0;

impl proto::Operation {
    /// Extracts the execution metadata, looking through the queued
    /// wrapper if the operation has already been transformed.
    pub fn expect_execute_operation_metadata(&self) -> Option<proto::ExecuteOperationMetadata> {
        let any = self.metadata.as_ref()?;
        if let Some(queued) = unpack_any::<proto::QueuedOperationMetadata>(any) {
            return queued.execute_operation_metadata;
        }
        unpack_any::<proto::ExecuteOperationMetadata>(any)
    }

    pub fn stage(&self) -> proto::execution_stage::Value {
        self.expect_execute_operation_metadata()
            .and_then(|m| proto::execution_stage::Value::try_from(m.stage).ok())
            .unwrap_or(proto::execution_stage::Value::Unknown)
    }

    pub fn is_cancelled(&self) -> bool {
        self.done
            && matches!(
                &self.result,
                Some(proto::operation::Result::Error(status))
                    if status.code == RPC_CODE_CANCELLED
            )
    }

    /// The packed ExecuteResponse, present only on completed operations.
    pub fn execute_response(&self) -> Option<proto::ExecuteResponse> {
        match &self.result {
            Some(proto::operation::Result::Response(any)) => {
                unpack_any::<proto::ExecuteResponse>(any)
            }
            _ => None,
        }
    }

    /// Replaces any queued metadata with the bare execute metadata, the
    /// form watchers outside the scheduler observe.
    pub fn strip_queued_metadata(mut self) -> Self {
        if let Some(metadata) = self.expect_execute_operation_metadata() {
            self.metadata = Some(pack_any(&metadata));
        }
        self
    }
}
