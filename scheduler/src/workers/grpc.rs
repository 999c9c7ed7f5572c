use bytes::{Bytes, BytesMut};
use tonic::async_trait;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::BinaryMetadataValue;
use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use quern_reapi::{blob_name, proto};

use super::Worker;
use crate::errors::Error;

const FIND_MISSING_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs";
const BYTESTREAM_READ_PATH: &str = "/google.bytestream.ByteStream/Read";
const BYTESTREAM_WRITE_PATH: &str = "/google.bytestream.ByteStream/Write";

/// Correlation metadata rides along as the standard binary header.
const REQUEST_METADATA_HEADER: &str = "build.bazel.remote.execution.v2.requestmetadata-bin";

const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// A [Worker] reached over its gRPC endpoint. Connections are established
/// lazily, so construction never blocks on an unreachable worker.
pub struct GrpcWorker {
    grpc: tonic::client::Grpc<Channel>,
    instance_name: String,
}

impl GrpcWorker {
    pub fn connect_lazy(address: &str, instance_name: String) -> Result<Self, Error> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::InvalidRequest(format!("bad worker address: {}", e)))?
            .connect_lazy();
        Ok(Self {
            grpc: tonic::client::Grpc::new(channel),
            instance_name,
        })
    }

    fn resource_name(&self, digest: &proto::Digest) -> String {
        if self.instance_name.is_empty() {
            blob_name(digest)
        } else {
            format!("{}/{}", self.instance_name, blob_name(digest))
        }
    }

    fn request_with_metadata<T>(
        message: T,
        metadata: &proto::RequestMetadata,
    ) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.metadata_mut().insert_bin(
            REQUEST_METADATA_HEADER,
            BinaryMetadataValue::from_bytes(&prost::Message::encode_to_vec(metadata)),
        );
        request
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<Channel>, Error> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| Error::Unavailable(format!("worker channel not ready: {}", e)))?;
        Ok(grpc)
    }
}

#[async_trait]
impl Worker for GrpcWorker {
    async fn find_missing_blobs(
        &self,
        digests: Vec<proto::Digest>,
        metadata: &proto::RequestMetadata,
    ) -> Result<Vec<proto::Digest>, Error> {
        let mut grpc = self.ready().await?;
        let request = Self::request_with_metadata(
            proto::FindMissingBlobsRequest {
                instance_name: self.instance_name.clone(),
                blob_digests: digests,
            },
            metadata,
        );
        let response: tonic::Response<proto::FindMissingBlobsResponse> = grpc
            .unary(
                request,
                PathAndQuery::from_static(FIND_MISSING_BLOBS_PATH),
                tonic::codec::ProstCodec::default(),
            )
            .await?;
        Ok(response.into_inner().missing_blob_digests)
    }

    async fn get_blob(
        &self,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Bytes, Error> {
        let mut grpc = self.ready().await?;
        let request = Self::request_with_metadata(
            proto::bytestream::ReadRequest {
                resource_name: self.resource_name(digest),
                read_offset: 0,
                read_limit: 0,
            },
            metadata,
        );
        let response: tonic::Response<tonic::Streaming<proto::bytestream::ReadResponse>> = grpc
            .server_streaming(
                request,
                PathAndQuery::from_static(BYTESTREAM_READ_PATH),
                tonic::codec::ProstCodec::default(),
            )
            .await?;
        let mut stream = response.into_inner();
        let mut content = BytesMut::with_capacity(digest.size_bytes as usize);
        while let Some(chunk) = stream.message().await? {
            content.extend_from_slice(&chunk.data);
        }
        Ok(content.freeze())
    }

    async fn put_blob(
        &self,
        digest: &proto::Digest,
        data: Bytes,
        metadata: &proto::RequestMetadata,
    ) -> Result<(), Error> {
        let mut grpc = self.ready().await?;
        let resource_name = if self.instance_name.is_empty() {
            format!("uploads/{}/{}", Uuid::new_v4(), blob_name(digest))
        } else {
            format!(
                "{}/uploads/{}/{}",
                self.instance_name,
                Uuid::new_v4(),
                blob_name(digest)
            )
        };

        let size = data.len();
        let mut requests = Vec::with_capacity(size / WRITE_CHUNK_SIZE + 1);
        let mut offset = 0usize;
        loop {
            let end = (offset + WRITE_CHUNK_SIZE).min(size);
            requests.push(proto::bytestream::WriteRequest {
                resource_name: resource_name.clone(),
                write_offset: offset as i64,
                finish_write: end == size,
                data: data.slice(offset..end),
            });
            if end == size {
                break;
            }
            offset = end;
        }

        let request = Self::request_with_metadata(futures::stream::iter(requests), metadata);
        let response: tonic::Response<proto::bytestream::WriteResponse> = grpc
            .client_streaming(
                request,
                PathAndQuery::from_static(BYTESTREAM_WRITE_PATH),
                tonic::codec::ProstCodec::default(),
            )
            .await?;

        let committed = response.into_inner().committed_size;
        if committed != digest.size_bytes {
            return Err(Error::Backplane(format!(
                "short write for {}: committed {} bytes",
                digest, committed
            )));
        }
        Ok(())
    }
}
