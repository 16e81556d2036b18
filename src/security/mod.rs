//! Protection of planner data: admission control, encryption at rest and
//! input validation.

pub mod encryption;
pub mod rate_limiter;
pub mod validation;

pub use encryption::{EncryptionAtRest, EncryptionStatus, RotationReport, SealedValue};
pub use rate_limiter::{
    format_wait, AdmissionController, AdmissionResult, LimitExceededEvent, LimitStatus, LimiterStatistics,
    RateLimitExceeded, DEFAULT_IDENTIFIER,
};
pub use validation::{escape_html, sanitize_text, validate_task, ValidationError};
