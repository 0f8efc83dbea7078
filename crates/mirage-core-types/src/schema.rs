//! Canonical schema constants for structured logging and events
//!
//! These constants keep field keys consistent across all logging and error
//! reporting in the engine.

// Canonical field keys for structured logging
pub const FIELD_COMPONENT: &str = "component";
pub const FIELD_OP: &str = "op";
pub const FIELD_EVENT: &str = "event";
pub const FIELD_DURATION_MS: &str = "duration_ms";
pub const FIELD_REQUEST_ID: &str = "request_id";
pub const FIELD_TRACE_ID: &str = "trace_id";

// Engine identifiers
pub const FIELD_ENTITY: &str = "entity";
pub const FIELD_QUERY: &str = "query";
pub const FIELD_FIELD: &str = "field";
pub const FIELD_PROPERTY: &str = "property";
pub const FIELD_ROUND: &str = "round";

// Collection sizes
pub const FIELD_ROW_COUNT: &str = "row_count";
pub const FIELD_CHANGE_COUNT: &str = "change_count";

// Error fields
pub const FIELD_ERR_KIND: &str = "err.kind";
pub const FIELD_ERR_CODE: &str = "err.code";

// Canonical event names
pub const EVENT_START: &str = "start";
pub const EVENT_END: &str = "end";
pub const EVENT_END_ERROR: &str = "end_error";
