/// Error code registry for checkflow
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Expression errors
/// - 3000-3999: Memory store errors
/// - 4000-4999: Provider errors
/// - 5000-5999: Journal errors
/// - 9000-9999: Internal errors
#[allow(dead_code)]
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;
    pub const CONFIG_CYCLE_DETECTED: u16 = 1010;
    pub const CONFIG_UNKNOWN_DEPENDENCY: u16 = 1011;
    pub const CONFIG_UNKNOWN_ROUTING_TARGET: u16 = 1012;
    pub const CONFIG_UNKNOWN_PROVIDER: u16 = 1013;
    pub const CONFIG_UNKNOWN_CHECK: u16 = 1014;

    // Expression errors (2000-2999)
    pub const EXPR_GENERIC: u16 = 2000;
    pub const EXPR_SYNTAX: u16 = 2001;
    pub const EXPR_RUNTIME: u16 = 2002;
    pub const EXPR_FORBIDDEN: u16 = 2003;

    // Memory store errors (3000-3999)
    pub const MEMORY_GENERIC: u16 = 3000;
    pub const MEMORY_NOT_NUMERIC: u16 = 3001;
    pub const MEMORY_PERSISTENCE: u16 = 3002;

    // Provider errors (4000-4999)
    pub const PROVIDER_GENERIC: u16 = 4000;
    pub const PROVIDER_TIMEOUT: u16 = 4001;

    // Journal errors (5000-5999)
    pub const JOURNAL_GENERIC: u16 = 5000;
    pub const JOURNAL_SNAPSHOT_IO: u16 = 5001;
    pub const JOURNAL_SNAPSHOT_FORMAT: u16 = 5002;

    // Internal errors (9000-9999)
    pub const INTERNAL_GENERIC: u16 = 9000;
    pub const INTERNAL_INVALID_TRANSITION: u16 = 9001;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Failed to parse configuration",
        1003 => "Invalid value in configuration",
        1010 => "Dependency cycle detected between checks",
        1011 => "Check depends on an unknown check",
        1012 => "Routing rule targets an unknown check",
        1013 => "Check uses an unregistered provider type",
        1014 => "Unknown check selected for execution",

        2000 => "Generic expression error",
        2001 => "Expression syntax error",
        2002 => "Expression evaluation failed",
        2003 => "Expression used a forbidden construct",

        3000 => "Generic memory store error",
        3001 => "Memory value is not numeric",
        3002 => "Memory store persistence failed",

        4000 => "Generic provider error",
        4001 => "Provider call timed out",

        5000 => "Generic journal error",
        5001 => "Journal snapshot could not be read or written",
        5002 => "Journal snapshot has an unsupported format",

        9000 => "Internal engine error",
        9001 => "Invalid engine state transition",

        _ => "Unknown error code",
    }
}
