//! Wire types, servers and clients for the two reporting protocols,
//! generated from `proto/*.proto` by `build.rs`.

pub mod tipb {
    tonic::include_proto!("tipb");
}

pub mod resource_usage_agent {
    tonic::include_proto!("resource_usage_agent");
}
