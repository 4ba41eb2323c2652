//! Streaming RPC Pipeline Backend
//!
//! Client for the bidirectional streaming backend that carries speech
//! audio, streaming transcription, and streamed text chat. Tasks depend
//! on the [`StreamingBackend`] trait; [`GrpcStreamingBackend`] is the
//! production implementation over a gRPC channel.
//!
//! The protobuf types and client stubs in [`pb`] are written out by hand
//! (the schema is small and stable) so the crate builds without a
//! protobuf compiler.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::BackendError;

/// Wire-compatible protobuf messages and the raw gRPC client stub.
#[allow(missing_docs)]
pub mod pb {
    use futures::stream::BoxStream;
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::transport::{Channel, Endpoint};

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Empty {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PipelineRequest {
        #[prost(string, tag = "1")]
        pub stream_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChatRequest {
        #[prost(string, tag = "1")]
        pub stream_id: String,
        #[prost(string, tag = "2")]
        pub query_id: String,
        #[prost(string, tag = "3")]
        pub query: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChatResponse {
        #[prost(string, tag = "1")]
        pub text: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AudioStreamConfig {
        #[prost(uint32, tag = "1")]
        pub channel_count: u32,
        #[prost(uint32, tag = "2")]
        pub sample_rate_hz: u32,
        #[prost(string, tag = "3")]
        pub encoding: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AudioRequest {
        #[prost(oneof = "audio_request::Payload", tags = "1, 2")]
        pub payload: ::core::option::Option<audio_request::Payload>,
    }

    pub mod audio_request {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "1")]
            Config(super::AudioStreamConfig),
            #[prost(bytes = "vec", tag = "2")]
            Chunk(Vec<u8>),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AudioResponse {
        #[prost(bytes = "vec", tag = "1")]
        pub audio: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InterimResult {
        #[prost(string, tag = "1")]
        pub transcript: String,
        #[prost(bool, tag = "2")]
        pub is_final: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TranscriptResponse {
        #[prost(oneof = "transcript_response::Result", tags = "1, 2")]
        pub result: ::core::option::Option<transcript_response::Result>,
    }

    pub mod transcript_response {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "1")]
            Interim(super::InterimResult),
            #[prost(string, tag = "2")]
            DisplayText(String),
        }
    }

    /// Thin client over `tonic::client::Grpc`, equivalent to what
    /// `tonic-build` would generate for the pipeline service.
    #[derive(Clone, Debug)]
    pub struct PipelineClient {
        inner: tonic::client::Grpc<Channel>,
    }

    impl PipelineClient {
        /// Connect to the pipeline service.
        pub async fn connect(url: String) -> Result<Self, tonic::transport::Error> {
            let channel = Endpoint::from_shared(url)?.connect().await?;
            Ok(Self {
                inner: tonic::client::Grpc::new(channel),
            })
        }

        async fn ready(&mut self) -> Result<(), tonic::Status> {
            self.inner
                .ready()
                .await
                .map_err(|e| tonic::Status::unknown(format!("service was not ready: {e}")))
        }

        pub async fn create_pipeline(
            &mut self,
            request: PipelineRequest,
        ) -> Result<tonic::Response<Empty>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/pipeline.Pipeline/CreatePipeline");
            self.inner
                .unary(tonic::Request::new(request), path, codec)
                .await
        }

        pub async fn free_pipeline(
            &mut self,
            request: PipelineRequest,
        ) -> Result<tonic::Response<Empty>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/pipeline.Pipeline/FreePipeline");
            self.inner
                .unary(tonic::Request::new(request), path, codec)
                .await
        }

        pub async fn chat(
            &mut self,
            request: ChatRequest,
        ) -> Result<tonic::Response<tonic::Streaming<ChatResponse>>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/pipeline.Pipeline/Chat");
            self.inner
                .server_streaming(tonic::Request::new(request), path, codec)
                .await
        }

        pub async fn receive_audio(
            &mut self,
            request: PipelineRequest,
        ) -> Result<tonic::Response<tonic::Streaming<AudioResponse>>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/pipeline.Pipeline/ReceiveAudio");
            self.inner
                .server_streaming(tonic::Request::new(request), path, codec)
                .await
        }

        pub async fn send_audio(
            &mut self,
            request: tonic::Request<BoxStream<'static, AudioRequest>>,
        ) -> Result<tonic::Response<Empty>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/pipeline.Pipeline/SendAudio");
            self.inner.client_streaming(request, path, codec).await
        }

        pub async fn transcribe(
            &mut self,
            request: PipelineRequest,
        ) -> Result<tonic::Response<tonic::Streaming<TranscriptResponse>>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/pipeline.Pipeline/Transcribe");
            self.inner
                .server_streaming(tonic::Request::new(request), path, codec)
                .await
        }
    }
}

/// One item on the outbound audio stream: the configuration record first,
/// then raw chunks.
#[derive(Clone, Debug)]
pub enum AudioFrame {
    /// Stream parameters; always the first frame.
    Config {
        /// Number of channels (the bridge always sends mono).
        channels: u32,
        /// Sample rate in Hz.
        sample_rate: u32,
    },
    /// One chunk of linear PCM audio.
    Chunk(Bytes),
}

/// One result on the transcription feed.
#[derive(Clone, Debug, PartialEq)]
pub enum SpeechResult {
    /// Finalized display text, rendered as a complete bot utterance.
    Display(String),
    /// A recognition update for the user's in-progress utterance.
    Interim {
        /// Recognized text so far.
        transcript: String,
        /// Whether the backend considers the utterance complete.
        is_final: bool,
    },
}

/// The bidirectional streaming backend as tasks see it.
#[async_trait]
pub trait StreamingBackend: Send + Sync {
    /// Acquire a remote pipeline for this session. Called at most once
    /// per session task; released via [`Self::free_pipeline`].
    async fn create_pipeline(&self, stream_id: &str) -> Result<(), BackendError>;

    /// Release a previously acquired pipeline.
    async fn free_pipeline(&self, stream_id: &str) -> Result<(), BackendError>;

    /// Open the synthesized-audio feed for this session.
    async fn receive_audio(
        &self,
        stream_id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, BackendError>>, BackendError>;

    /// Drive the user-audio upload; the call completes when the backend
    /// closes the stream.
    async fn send_audio(
        &self,
        frames: BoxStream<'static, AudioFrame>,
    ) -> Result<(), BackendError>;

    /// Issue one text turn; fragments stream back until the turn is done.
    async fn chat(
        &self,
        stream_id: &str,
        query_id: &str,
        query: &str,
    ) -> Result<BoxStream<'static, Result<String, BackendError>>, BackendError>;

    /// Open the transcription feed for this session.
    async fn transcribe(
        &self,
        stream_id: &str,
    ) -> Result<BoxStream<'static, Result<SpeechResult, BackendError>>, BackendError>;
}

/// Production [`StreamingBackend`] over a gRPC channel. Cheap to clone;
/// all clones share one HTTP/2 connection.
#[derive(Clone, Debug)]
pub struct GrpcStreamingBackend {
    client: pb::PipelineClient,
    encoding: &'static str,
}

impl GrpcStreamingBackend {
    /// Connect to the pipeline service at `url`.
    pub async fn connect(url: String) -> Result<Self, BackendError> {
        let client = pb::PipelineClient::connect(url)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            encoding: "LINEAR_PCM",
        })
    }
}

fn from_status(status: tonic::Status) -> BackendError {
    BackendError::Failed(status.to_string())
}

#[async_trait]
impl StreamingBackend for GrpcStreamingBackend {
    async fn create_pipeline(&self, stream_id: &str) -> Result<(), BackendError> {
        let mut client = self.client.clone();
        client
            .create_pipeline(pb::PipelineRequest {
                stream_id: stream_id.to_string(),
            })
            .await
            .map_err(from_status)?;
        Ok(())
    }

    async fn free_pipeline(&self, stream_id: &str) -> Result<(), BackendError> {
        let mut client = self.client.clone();
        client
            .free_pipeline(pb::PipelineRequest {
                stream_id: stream_id.to_string(),
            })
            .await
            .map_err(from_status)?;
        Ok(())
    }

    async fn receive_audio(
        &self,
        stream_id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, BackendError>>, BackendError> {
        let mut client = self.client.clone();
        let stream = client
            .receive_audio(pb::PipelineRequest {
                stream_id: stream_id.to_string(),
            })
            .await
            .map_err(from_status)?
            .into_inner();
        Ok(stream
            .map(|item| {
                item.map(|resp| Bytes::from(resp.audio))
                    .map_err(from_status)
            })
            .boxed())
    }

    async fn send_audio(
        &self,
        frames: BoxStream<'static, AudioFrame>,
    ) -> Result<(), BackendError> {
        let encoding = self.encoding;
        let requests = frames.map(move |frame| match frame {
            AudioFrame::Config {
                channels,
                sample_rate,
            } => pb::AudioRequest {
                payload: Some(pb::audio_request::Payload::Config(pb::AudioStreamConfig {
                    channel_count: channels,
                    sample_rate_hz: sample_rate,
                    encoding: encoding.to_string(),
                })),
            },
            AudioFrame::Chunk(chunk) => pb::AudioRequest {
                payload: Some(pb::audio_request::Payload::Chunk(chunk.to_vec())),
            },
        });
        let mut client = self.client.clone();
        client
            .send_audio(tonic::Request::new(requests.boxed()))
            .await
            .map_err(from_status)?;
        Ok(())
    }

    async fn chat(
        &self,
        stream_id: &str,
        query_id: &str,
        query: &str,
    ) -> Result<BoxStream<'static, Result<String, BackendError>>, BackendError> {
        let mut client = self.client.clone();
        let stream = client
            .chat(pb::ChatRequest {
                stream_id: stream_id.to_string(),
                query_id: query_id.to_string(),
                query: query.to_string(),
            })
            .await
            .map_err(from_status)?
            .into_inner();
        Ok(stream
            .map(|item| item.map(|resp| resp.text).map_err(from_status))
            .boxed())
    }

    async fn transcribe(
        &self,
        stream_id: &str,
    ) -> Result<BoxStream<'static, Result<SpeechResult, BackendError>>, BackendError> {
        let mut client = self.client.clone();
        let stream = client
            .transcribe(pb::PipelineRequest {
                stream_id: stream_id.to_string(),
            })
            .await
            .map_err(from_status)?
            .into_inner();
        Ok(stream
            .filter_map(|item| async move {
                match item {
                    Err(status) => Some(Err(from_status(status))),
                    Ok(resp) => resp.result.map(|result| {
                        Ok(match result {
                            pb::transcript_response::Result::Interim(interim) => {
                                SpeechResult::Interim {
                                    transcript: interim.transcript,
                                    is_final: interim.is_final,
                                }
                            }
                            pb::transcript_response::Result::DisplayText(text) => {
                                SpeechResult::Display(text)
                            }
                        })
                    }),
                }
            })
            .boxed())
    }
}
