//! Wire Message Bodies
//!
//! Protobuf payloads carried inside data-plane and control frames.

/// First frame on a data-plane connection; names the rendezvous and the
/// sender. Authenticated by the frame HMAC, keyed with the stream token.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeRequest {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub sender_peer_id: Vec<u8>,
}

/// Relay's verdict on a handshake
#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeAck {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Server peer asks the relay for an allocation addressed to `client_peer_id`
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateStreamRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub client_peer_id: Vec<u8>,
}

/// The minted stream handle
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateStreamResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(uint64, tag = "3")]
    pub stream_id: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub token: Vec<u8>,
    #[prost(string, tag = "5")]
    pub relay_endpoint: String,
}

/// Client asks the server peer to arrange a relayed stream; carries nothing
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartRelayStreamRequest {}

/// Server peer forwards the stream handle to the client
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartRelayStreamResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(string, tag = "3")]
    pub relay_endpoint: String,
    #[prost(uint64, tag = "4")]
    pub stream_id: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub token: Vec<u8>,
}
