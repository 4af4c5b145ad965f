// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Small helpers shaping errors for the user facing responses.

const BACKTRACE_MARKER: &str = "\nBacktrace:\n";

/// Strip the backtrace block from a formatted error, it is noise in an HTTP
/// response body.
pub fn remove_backtrace_from_err(err_string: &str) -> &str {
    err_string
        .split(BACKTRACE_MARKER)
        .next()
        .unwrap_or(err_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_backtrace() {
        let cases = vec![
            ("plain error", "plain error"),
            (
                "Table not found, msg:t1.\nBacktrace:\n  0: main",
                "Table not found, msg:t1.",
            ),
            ("", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(remove_backtrace_from_err(input), expected);
        }
    }
}
