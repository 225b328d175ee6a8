pub mod adapter;
pub mod config;
pub mod error;
pub mod keys;
pub mod redaction;
pub mod types;

pub use adapter::Adapter;
pub use error::{
    ClassifiedError, ClassifiedResult, ErrorKind, GatewayError, GatewayResult, RetryPolicy,
    Severity,
};
pub use types::*;
