//! issuemirror Core Library
//!
//! Shared types for the issuemirror synchronization engine.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (`TaskId`, `OperationId`, `RequestId`)
//! - [`context`] - Typed call context carrying request metadata and cancellation
//! - [`error`] - Failure taxonomy (`ErrorType`, `Severity`, `ClassifiedError`)
//! - [`classifier`] - Maps raw failures onto the taxonomy
//!
//! # Example
//!
//! ```
//! use issuemirror_core::{CallContext, ErrorClassifier, ErrorType, UpstreamError};
//!
//! let ctx = CallContext::new("upstream", "search");
//! let classifier = ErrorClassifier::new();
//!
//! let err = UpstreamError::status(503, "service unavailable");
//! let classified = classifier.classify_in(&err, &ctx);
//! assert_eq!(classified.error_type, ErrorType::Transient);
//! assert!(classified.retryable);
//! ```

pub mod classifier;
pub mod context;
pub mod error;
pub mod ids;

pub use classifier::{ClassifierConfig, ErrorClassifier};
pub use context::CallContext;
pub use error::{Cancelled, ClassifiedError, ErrorType, ParseErrorTypeError, Severity, UpstreamError};
pub use ids::{OperationId, ParseIdError, RequestId, TaskId};
