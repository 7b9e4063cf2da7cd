//! Wire messages for `rpcbase.pingpong.PingPong`.

/// Request for `PingPong/Ping`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PingRequest {
    /// Milliseconds the handler waits before answering.
    #[prost(uint64, tag = "1")]
    pub delay_ms: u64,
}

/// Response for `PingPong/Ping`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PingResponse {
    #[prost(bool, tag = "1")]
    pub pong: bool,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn default_request_has_no_delay() {
        assert_eq!(PingRequest::default().delay_ms, 0);
    }

    #[test]
    fn request_decodes_delay() {
        let bytes = PingRequest { delay_ms: 1500 }.encode_to_vec();
        let decoded = PingRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.delay_ms, 1500);
    }
}
