use tonic_build::manual::{Builder, Method, Service};

// Messages are declared with prost derives in src/messages.rs, so only the
// service glue is generated here and no protoc is needed at build time.
fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::messages::{}", input))
            .output_type(format!("crate::messages::{}", output))
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let service = Service::builder()
        .name("AgentService")
        .package("nwpd.v1")
        .method(method(
            "get_observations",
            "GetObservations",
            "GetObservationsRequest",
            "GetObservationsResponse",
        ))
        .method(method(
            "get_aggregated_observations",
            "GetAggregatedObservations",
            "GetObservationsRequest",
            "GetAggregatedObservationsResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
    println!("cargo:rerun-if-changed=build.rs");
}
