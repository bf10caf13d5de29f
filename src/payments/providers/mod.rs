pub mod mpesa;
pub mod sandbox;

pub use mpesa::{MpesaConfig, MpesaEnvironment, MpesaGateway};
pub use sandbox::{SandboxGateway, SandboxQueryMode};
