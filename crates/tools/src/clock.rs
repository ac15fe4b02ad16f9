//! Clock tool: reports the current date and time.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use hearth_core::{ParamType, Tool, ToolArguments, ToolError, ToolParameter};

const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S %:z";

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally at a fixed UTC offset."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::optional(
                "utc_offset",
                ParamType::String,
                "Offset from UTC such as '+02:00' or '-05:30'. Defaults to UTC.",
            ),
            ToolParameter::optional(
                "format",
                ParamType::String,
                "strftime-style format string. Defaults to '%Y-%m-%d %H:%M:%S %:z'.",
            ),
        ]
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<String, ToolError> {
        let offset = match arguments.opt_str("utc_offset")? {
            Some(raw) => parse_offset(raw)?,
            None => FixedOffset::east_opt(0).ok_or_else(|| invalid_offset("+00:00"))?,
        };
        let format = arguments.opt_str("format")?.unwrap_or(DEFAULT_FORMAT);
        render(Utc::now().with_timezone(&offset), format)
    }
}

fn invalid_offset(raw: &str) -> ToolError {
    ToolError::InvalidArguments(format!("invalid UTC offset '{raw}', expected +HH:MM"))
}

/// Accepts `Z`, `+HH`, `+HH:MM` and `+HHMM`.
fn parse_offset(raw: &str) -> Result<FixedOffset, ToolError> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| invalid_offset(raw));
    }
    let (sign, digits) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid_offset(raw)),
    };
    let digits = digits.replace(':', "");
    let (hours, minutes) = match digits.len() {
        2 => (digits.as_str(), "0"),
        4 => digits.split_at(2),
        _ => return Err(invalid_offset(raw)),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid_offset(raw))?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid_offset(raw))?;
    if minutes >= 60 {
        return Err(invalid_offset(raw));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| invalid_offset(raw))
}

fn render(now: DateTime<FixedOffset>, format: &str) -> Result<String, ToolError> {
    use std::fmt::Write;

    // `to_string` panics on an unknown specifier; `write!` returns the error.
    let mut out = String::new();
    write!(out, "{}", now.format(format))
        .map_err(|_| ToolError::InvalidArguments(format!("invalid format string '{format}'")))?;
    Ok(out)
}
