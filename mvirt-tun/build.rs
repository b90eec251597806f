fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tunnel.proto: ConnTunnel stream to the remote peer.
    // The server side is used by the in-process peer of the integration tests.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/tunnel.proto"], &["proto"])?;
    Ok(())
}
