pub mod diagnostics;
pub mod headers;
pub mod logging;
pub mod message;
pub mod token;

pub use diagnostics::{
    DiagnosticContext, DiagnosticEvent, DiagnosticEventType, DiagnosticSink, SharedDiagnosticSink,
    TracingDiagnosticSink,
};
pub use headers::{HeaderError, Headers, Importance};
pub use message::Message;
pub use token::{HmacTokenService, Principal, SecurityTokenService, TokenError};
