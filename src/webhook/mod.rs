//! Validating admission webhook for NfsPvc resources

pub mod server;
pub mod validator;

pub use server::{router, serve, TlsFiles, WebhookConfig, WebhookState, VALIDATE_PATH};
pub use validator::{parse_quantity, NfsPvcValidator, Rejection};
