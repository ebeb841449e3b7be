//! Infrastructure adapters: the Spacelift GraphQL client plus one
//! [`Controller`](poolscale_domain::Controller) implementation per cloud
//! platform.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod spacelift;

pub use aws::AwsController;
pub use azure::AzureController;
pub use gcp::GcpController;
pub use spacelift::SpaceliftClient;
