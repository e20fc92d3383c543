//! Mapping technical errors to user-facing messages.
//!
//! Provider and store errors carry internals (hostnames, SQL fragments, stack
//! text) that must never reach end users. [`map_error`] pattern-matches the
//! technical message against a fixed category table and returns a short human
//! message plus a suggested action. The returned text is always a fixed string
//! from the table, never derived from the input.

use serde::Serialize;

/// Known failure categories, matched in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Permission,
    NotFound,
    Validation,
    Persistence,
    Search,
    Network,
    Server,
    Unknown,
}

/// What the user sees. Both strings come from a fixed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub category: ErrorCategory,
    pub message: &'static str,
    pub action: &'static str,
}

struct Rule {
    patterns: &'static [&'static str],
    category: ErrorCategory,
    message: &'static str,
    action: &'static str,
}

// Ordered: more specific categories first so e.g. "404" is not-found rather
// than network, and "403 forbidden" is permission rather than server.
const RULES: &[Rule] = &[
    Rule {
        patterns: &["unauthorized", "401", "auth", "jwt", "token expired", "session expired", "not signed in"],
        category: ErrorCategory::Authentication,
        message: "Your session has expired or you are not signed in.",
        action: "Please sign in and try again.",
    },
    Rule {
        patterns: &["forbidden", "403", "permission", "access denied", "not allowed"],
        category: ErrorCategory::Permission,
        message: "You don't have permission to do that.",
        action: "Contact your workspace admin if you think you should have access.",
    },
    Rule {
        patterns: &["not found", "404", "no rows", "does not exist", "missing record"],
        category: ErrorCategory::NotFound,
        message: "We couldn't find what you were looking for.",
        action: "It may have been removed. Try refreshing the page.",
    },
    Rule {
        patterns: &["validation", "invalid", "required field", "constraint", "422", "malformed"],
        category: ErrorCategory::Validation,
        message: "Some of the provided information doesn't look right.",
        action: "Please check your input and try again.",
    },
    Rule {
        patterns: &["insert failed", "save failed", "update failed", "delete failed", "could not save", "write failed", "conflict"],
        category: ErrorCategory::Persistence,
        message: "We couldn't save your changes.",
        action: "Please try again in a moment.",
    },
    Rule {
        patterns: &["search failed", "query failed", "no results provider", "search provider"],
        category: ErrorCategory::Search,
        message: "Search is having trouble right now.",
        action: "Try adjusting your search or try again shortly.",
    },
    Rule {
        patterns: &["network", "fetch failed", "timeout", "timed out", "econn", "socket", "dns", "connection refused", "connection reset"],
        category: ErrorCategory::Network,
        message: "We're having trouble reaching the service.",
        action: "Check your connection and retry.",
    },
    Rule {
        patterns: &["500", "502", "503", "504", "internal server", "maintenance", "unavailable", "overloaded", "rate limit"],
        category: ErrorCategory::Server,
        message: "The service is temporarily unavailable.",
        action: "Please wait a moment and retry.",
    },
];

const FALLBACK: UserMessage = UserMessage {
    category: ErrorCategory::Unknown,
    message: "Something went wrong.",
    action: "Please try again, or contact support if the problem persists.",
};

/// Map a technical error message to a user-facing one.
///
/// Matching is case-insensitive substring search, first rule wins. Unmatched
/// input gets the generic message. The raw input never appears in the output.
pub fn map_error(technical: &str) -> UserMessage {
    let haystack = technical.to_lowercase();
    for rule in RULES {
        if rule.patterns.iter().any(|p| haystack.contains(p)) {
            return UserMessage {
                category: rule.category,
                message: rule.message,
                action: rule.action,
            };
        }
    }
    FALLBACK
}

/// Convenience for error types.
pub fn map_error_for<E: std::fmt::Display>(error: &E) -> UserMessage {
    map_error(&error.to_string())
}
