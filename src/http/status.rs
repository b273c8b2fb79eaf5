pub const OK: u16 = 200;
pub const CREATED: u16 = 201;
pub const NO_CONTENT: u16 = 204;
pub const BAD_REQUEST: u16 = 400;
pub const UNAUTHORIZED: u16 = 401;
pub const FORBIDDEN: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const METHOD_NOT_ALLOWED: u16 = 405;
pub const REQUEST_TIMEOUT: u16 = 408;
pub const PAYLOAD_TOO_LARGE: u16 = 413;
pub const REQUEST_HEADER_TOO_LARGE: u16 = 494;
pub const CLIENT_CLOSED_REQUEST: u16 = 499;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const BAD_GATEWAY: u16 = 502;
pub const GATEWAY_TIMEOUT: u16 = 504;

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        444 => "No Response",
        494 => "Request Header Too Large",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        400..=499 => "Client Error",
        500..=599 => "Server Error",
        _ => "Unknown",
    }
}

/// Generic, user-facing explanation for an error status.
pub fn description(code: u16) -> &'static str {
    match code {
        400 => "The server cannot process the request due to invalid syntax.",
        401 => "Authentication is required to access this resource.",
        403 => "You don't have permission to access this resource on this server.",
        404 => "The requested resource could not be found on this server.",
        405 => "The request method is not allowed for the requested resource.",
        408 => "The server timed out waiting for the request.",
        413 => "The request is larger than the server is willing or able to process.",
        494 => "The client sent too large request headers.",
        499 => "The client closed the connection before the server could respond.",
        500 => "The server encountered an unexpected condition that prevented it from fulfilling the request.",
        502 => "The server received an invalid response from an upstream program.",
        504 => "The server did not receive a timely response from an upstream program.",
        400..=499 => "A client error occurred while processing your request.",
        500..=599 => "A server error occurred while processing your request.",
        _ => "An unexpected error occurred while processing your request.",
    }
}
