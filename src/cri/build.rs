fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the CRI v1 protobuf definitions
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/api.proto"], &["proto"])?;

    Ok(())
}
