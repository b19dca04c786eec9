//! Kubelet pod-resources wire protocol
//!
//! Hand-written mirror of the kubelet `v1alpha1.PodResourcesLister` API:
//! prost message types plus a thin tonic client. The kubelet only exposes
//! this service over a node-local unix socket, so the connector dials the
//! socket and the URI authority is a placeholder.

use std::path::Path;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::{ExporterError, Result};

pub use self::v1alpha1::pod_resources_lister_client::PodResourcesListerClient;
pub use self::v1alpha1::{
    ContainerDevices, ContainerResources, ListPodResourcesRequest, ListPodResourcesResponse,
    PodResources,
};

/// Dial and per-call deadline for the kubelet.
pub const KUBELET_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to the pod-resources socket.
pub async fn connect(socket_path: &Path) -> Result<PodResourcesListerClient<Channel>> {
    let path = socket_path.to_path_buf();
    let channel = Endpoint::from_static("http://[::1]:50051")
        .connect_timeout(KUBELET_TIMEOUT)
        .timeout(KUBELET_TIMEOUT)
        .connect_with_connector(service_fn(move |_: Uri| {
            tokio::net::UnixStream::connect(path.clone())
        }))
        .await
        .map_err(|e| ExporterError::Scrape(format!("pod-resources dial failed: {e}")))?;
    Ok(PodResourcesListerClient::new(channel))
}

pub mod v1alpha1 {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesRequest {}

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub pod_resources: Vec<PodResources>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PodResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub namespace: String,
        #[prost(message, repeated, tag = "3")]
        pub containers: Vec<ContainerResources>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub devices: Vec<ContainerDevices>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerDevices {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(string, repeated, tag = "2")]
        pub device_ids: Vec<String>,
    }

    pub mod pod_resources_lister_client {
        use super::*;
        use tonic::codegen::*;

        #[derive(Debug, Clone)]
        pub struct PodResourcesListerClient<T> {
            inner: tonic::client::Grpc<T>,
        }

        impl PodResourcesListerClient<tonic::transport::Channel> {
            pub fn new(channel: tonic::transport::Channel) -> Self {
                let inner = tonic::client::Grpc::new(channel);
                Self { inner }
            }
        }

        impl<T> PodResourcesListerClient<T>
        where
            T: tonic::client::GrpcService<tonic::body::BoxBody>,
            T::Error: Into<StdError>,
            T::ResponseBody: Body<Data = Bytes> + Send + 'static,
            <T::ResponseBody as Body>::Error: Into<StdError> + Send,
        {
            pub async fn list(
                &mut self,
                request: impl tonic::IntoRequest<ListPodResourcesRequest>,
            ) -> Result<tonic::Response<ListPodResourcesResponse>, tonic::Status> {
                self.inner.ready().await.map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("service was not ready: {}", e.into()),
                    )
                })?;
                let codec = tonic::codec::ProstCodec::default();
                let path =
                    http::uri::PathAndQuery::from_static("/v1alpha1.PodResourcesLister/List");
                self.inner.unary(request.into_request(), path, codec).await
            }
        }
    }
}
