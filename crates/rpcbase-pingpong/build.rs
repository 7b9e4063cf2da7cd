//! Generates the PingPong client and server stubs.
//!
//! Messages are declared by hand with `prost` derives in `src/messages.rs`,
//! so the manual builder is used and no `protoc` is needed at build time.

fn main() {
    let ping_pong = tonic_build::manual::Service::builder()
        .name("PingPong")
        .package("rpcbase.pingpong")
        .method(
            tonic_build::manual::Method::builder()
                .name("ping")
                .route_name("Ping")
                .input_type("crate::messages::PingRequest")
                .output_type("crate::messages::PingResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[ping_pong]);
}
