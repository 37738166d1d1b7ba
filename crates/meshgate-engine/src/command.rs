//! Driver command channel.
//!
//! Lines written to the `driver.command` field are whitespace separated:
//! a verb followed by `key=value` or positional arguments.
//!
//! ```text
//! add-association 5 1 2
//! add-association src=5 group=1 target=2
//! delete-association 5 1          # removes every target of group 1
//! set-config-parameter 5 3 2 -300
//! enable-trace on
//! ```
//!
//! Parsing checks argument counts and ranges, so a malformed line never
//! reaches the link.

use std::fmt;

use meshgate_classes::builtin::MAX_WAKEUP_INTERVAL;
use meshgate_classes::{ConfigParameter, UnitId};
use meshgate_protocol::MAX_UNIT_ID;

use crate::error::CommandError;

/// A parsed driver command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    /// Add `target` to association group `group` of `src`.
    AddAssociation {
        /// Source unit.
        src: UnitId,
        /// Group number.
        group: u8,
        /// Unit to add.
        target: UnitId,
    },
    /// Remove `target` (or every target) from a group.
    DeleteAssociation {
        /// Source unit.
        src: UnitId,
        /// Group number.
        group: u8,
        /// Unit to remove; `None` clears the group.
        target: Option<UnitId>,
    },
    /// Read a group back from the device.
    QueryAssociation {
        /// Source unit.
        src: UnitId,
        /// Group number.
        group: u8,
    },
    /// Write a configuration parameter.
    SetConfigParameter {
        /// Target unit.
        unit: UnitId,
        /// Parameter, width and value.
        param: ConfigParameter,
    },
    /// Read a configuration parameter.
    GetConfigParameter {
        /// Target unit.
        unit: UnitId,
        /// Parameter number.
        param: u8,
    },
    /// Change a sleeping unit's wake-up interval.
    SetWakeupInterval {
        /// Target unit.
        unit: UnitId,
        /// Interval in seconds.
        seconds: u32,
    },
    /// Turn frame tracing on or off.
    EnableTrace(bool),
    /// Interview a unit again.
    Refresh {
        /// Target unit.
        unit: UnitId,
    },
}

/// Verb names with their parameter names, in positional order.
/// Parameters after `required` are optional.
struct Signature {
    verb: &'static str,
    params: &'static [&'static str],
    required: usize,
    expected: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature {
        verb: "add-association",
        params: &["src", "group", "target"],
        required: 3,
        expected: "3",
    },
    Signature {
        verb: "delete-association",
        params: &["src", "group", "target"],
        required: 2,
        expected: "2 or 3",
    },
    Signature {
        verb: "query-association",
        params: &["src", "group"],
        required: 2,
        expected: "2",
    },
    Signature {
        verb: "set-config-parameter",
        params: &["unit", "param", "width", "value"],
        required: 4,
        expected: "4",
    },
    Signature {
        verb: "get-config-parameter",
        params: &["unit", "param"],
        required: 2,
        expected: "2",
    },
    Signature {
        verb: "set-wakeup-interval",
        params: &["unit", "seconds"],
        required: 2,
        expected: "2",
    },
    Signature {
        verb: "enable-trace",
        params: &["state"],
        required: 1,
        expected: "1",
    },
    Signature {
        verb: "refresh",
        params: &["unit"],
        required: 1,
        expected: "1",
    },
];

/// Arguments bound to parameter names.
struct Args<'a> {
    verb: &'static str,
    values: Vec<(&'static str, &'a str)>,
}

impl<'a> Args<'a> {
    fn bind(sig: &Signature, tokens: &[&'a str]) -> Result<Self, CommandError> {
        if tokens.len() < sig.required || tokens.len() > sig.params.len() {
            return Err(CommandError::ParameterCount {
                verb: sig.verb,
                expected: sig.expected,
                actual: tokens.len(),
            });
        }

        let mut values: Vec<(&'static str, &'a str)> = Vec::with_capacity(tokens.len());
        let mut positional = Vec::new();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) => {
                    let Some(&name) = sig.params.iter().find(|p| **p == key) else {
                        return Err(format_error(sig.verb, "parameter", key, "unknown parameter"));
                    };
                    if values.iter().any(|(n, _)| *n == name) {
                        return Err(format_error(sig.verb, name, value, "given twice"));
                    }
                    values.push((name, value));
                }
                None => positional.push(*token),
            }
        }

        // Positional arguments fill the parameters not given by name, in order.
        let free: Vec<&'static str> = sig
            .params
            .iter()
            .copied()
            .filter(|p| !values.iter().any(|(n, _)| n == p))
            .collect();
        let mut free = free.into_iter();
        for token in positional {
            match free.next() {
                Some(name) => values.push((name, token)),
                None => {
                    return Err(CommandError::ParameterCount {
                        verb: sig.verb,
                        expected: sig.expected,
                        actual: tokens.len(),
                    })
                }
            }
        }

        let missing = sig.params[..sig.required]
            .iter()
            .any(|p| !values.iter().any(|(n, _)| n == p));
        if missing {
            return Err(CommandError::ParameterCount {
                verb: sig.verb,
                expected: sig.expected,
                actual: tokens.len(),
            });
        }

        Ok(Args {
            verb: sig.verb,
            values,
        })
    }

    fn raw(&self, name: &'static str) -> Option<&'a str> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    fn int(&self, name: &'static str, min: i64, max: i64) -> Result<Option<i64>, CommandError> {
        let Some(raw) = self.raw(name) else {
            return Ok(None);
        };
        let value = parse_int(raw).ok_or_else(|| format_error(self.verb, name, raw, "not a number"))?;
        if value < min || value > max {
            return Err(format_error(
                self.verb,
                name,
                raw,
                &format!("must be in {}..={}", min, max),
            ));
        }
        Ok(Some(value))
    }

    fn required(&self, name: &'static str, min: i64, max: i64) -> Result<i64, CommandError> {
        // Presence was checked by `bind`.
        self.int(name, min, max)?
            .ok_or_else(|| format_error(self.verb, name, "", "missing"))
    }

    fn unit(&self, name: &'static str) -> Result<UnitId, CommandError> {
        Ok(self.required(name, 1, MAX_UNIT_ID as i64)? as UnitId)
    }

    fn byte(&self, name: &'static str, min: i64) -> Result<u8, CommandError> {
        Ok(self.required(name, min, u8::MAX as i64)? as u8)
    }
}

fn format_error(verb: &'static str, name: &'static str, value: &str, reason: &str) -> CommandError {
    CommandError::Format {
        verb,
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Decimal or `0x`-prefixed hexadecimal, optionally negative.
fn parse_int(raw: &str) -> Option<i64> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl DriverCommand {
    /// Parse one command line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().ok_or(CommandError::Empty)?;
        let sig = SIGNATURES
            .iter()
            .find(|s| s.verb.eq_ignore_ascii_case(verb))
            .ok_or_else(|| CommandError::UnknownVerb(verb.to_string()))?;
        let rest: Vec<&str> = tokens.collect();
        let args = Args::bind(sig, &rest)?;

        let command = match sig.verb {
            "add-association" => DriverCommand::AddAssociation {
                src: args.unit("src")?,
                group: args.byte("group", 1)?,
                target: args.unit("target")?,
            },
            "delete-association" => DriverCommand::DeleteAssociation {
                src: args.unit("src")?,
                group: args.byte("group", 1)?,
                target: args
                    .int("target", 1, MAX_UNIT_ID as i64)?
                    .map(|t| t as UnitId),
            },
            "query-association" => DriverCommand::QueryAssociation {
                src: args.unit("src")?,
                group: args.byte("group", 1)?,
            },
            "set-config-parameter" => {
                let unit = args.unit("unit")?;
                let number = args.byte("param", 0)?;
                let width = args.required("width", 1, 4)?;
                if !matches!(width, 1 | 2 | 4) {
                    return Err(format_error(
                        sig.verb,
                        "width",
                        args.raw("width").unwrap_or_default(),
                        "must be 1, 2 or 4",
                    ));
                }
                let value = args.required("value", i32::MIN as i64, u32::MAX as i64)?;
                let param = ConfigParameter::new(number, width as u8, value).map_err(|e| {
                    format_error(
                        sig.verb,
                        "value",
                        args.raw("value").unwrap_or_default(),
                        &e.to_string(),
                    )
                })?;
                DriverCommand::SetConfigParameter { unit, param }
            }
            "get-config-parameter" => DriverCommand::GetConfigParameter {
                unit: args.unit("unit")?,
                param: args.byte("param", 0)?,
            },
            "set-wakeup-interval" => DriverCommand::SetWakeupInterval {
                unit: args.unit("unit")?,
                seconds: args.required("seconds", 0, MAX_WAKEUP_INTERVAL as i64)? as u32,
            },
            "enable-trace" => {
                let raw = args.raw("state").unwrap_or_default();
                let on = parse_switch(raw)
                    .ok_or_else(|| format_error(sig.verb, "state", raw, "expected on or off"))?;
                DriverCommand::EnableTrace(on)
            }
            _ => DriverCommand::Refresh {
                unit: args.unit("unit")?,
            },
        };
        Ok(command)
    }

    /// Verb name.
    pub fn verb(&self) -> &'static str {
        match self {
            DriverCommand::AddAssociation { .. } => "add-association",
            DriverCommand::DeleteAssociation { .. } => "delete-association",
            DriverCommand::QueryAssociation { .. } => "query-association",
            DriverCommand::SetConfigParameter { .. } => "set-config-parameter",
            DriverCommand::GetConfigParameter { .. } => "get-config-parameter",
            DriverCommand::SetWakeupInterval { .. } => "set-wakeup-interval",
            DriverCommand::EnableTrace(_) => "enable-trace",
            DriverCommand::Refresh { .. } => "refresh",
        }
    }

    /// Whether a successful run changes persisted configuration.
    pub fn mutates_config(&self) -> bool {
        matches!(
            self,
            DriverCommand::AddAssociation { .. }
                | DriverCommand::DeleteAssociation { .. }
                | DriverCommand::QueryAssociation { .. }
                | DriverCommand::SetConfigParameter { .. }
                | DriverCommand::GetConfigParameter { .. }
                | DriverCommand::SetWakeupInterval { .. }
                | DriverCommand::Refresh { .. }
        )
    }
}

impl fmt::Display for DriverCommand {
    /// Canonical positional form, parseable by [`DriverCommand::parse`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb())?;
        match self {
            DriverCommand::AddAssociation { src, group, target } => {
                write!(f, " {} {} {}", src, group, target)
            }
            DriverCommand::DeleteAssociation { src, group, target } => {
                write!(f, " {} {}", src, group)?;
                match target {
                    Some(t) => write!(f, " {}", t),
                    None => Ok(()),
                }
            }
            DriverCommand::QueryAssociation { src, group } => write!(f, " {} {}", src, group),
            DriverCommand::SetConfigParameter { unit, param } => {
                write!(f, " {} {} {} {}", unit, param.number, param.width, param.value)
            }
            DriverCommand::GetConfigParameter { unit, param } => write!(f, " {} {}", unit, param),
            DriverCommand::SetWakeupInterval { unit, seconds } => {
                write!(f, " {} {}", unit, seconds)
            }
            DriverCommand::EnableTrace(on) => write!(f, " {}", if *on { "on" } else { "off" }),
            DriverCommand::Refresh { unit } => write!(f, " {}", unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_and_named() {
        let expected = DriverCommand::AddAssociation {
            src: 5,
            group: 1,
            target: 2,
        };
        assert_eq!(DriverCommand::parse("add-association 5 1 2"), Ok(expected.clone()));
        assert_eq!(
            DriverCommand::parse("add-association target=2 src=5 group=1"),
            Ok(expected.clone())
        );
        assert_eq!(
            DriverCommand::parse("  add-association group=1 5 2 "),
            Ok(expected)
        );
    }

    #[test]
    fn test_optional_target() {
        assert_eq!(
            DriverCommand::parse("delete-association 5 1"),
            Ok(DriverCommand::DeleteAssociation {
                src: 5,
                group: 1,
                target: None
            })
        );
        assert_eq!(
            DriverCommand::parse("delete-association 5 1 0x02"),
            Ok(DriverCommand::DeleteAssociation {
                src: 5,
                group: 1,
                target: Some(2)
            })
        );
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(
            DriverCommand::parse("add-association 5 1"),
            Err(CommandError::ParameterCount {
                verb: "add-association",
                expected: "3",
                actual: 2
            })
        );
        assert!(matches!(
            DriverCommand::parse("refresh 5 6"),
            Err(CommandError::ParameterCount { actual: 2, .. })
        ));
        // Too many tokens, named or not.
        assert!(matches!(
            DriverCommand::parse("query-association src=5 6 7"),
            Err(CommandError::ParameterCount { .. })
        ));
    }

    #[test]
    fn test_format_errors() {
        assert!(matches!(
            DriverCommand::parse("refresh five"),
            Err(CommandError::Format { name: "unit", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("refresh 233"),
            Err(CommandError::Format { name: "unit", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("add-association 5 0 2"),
            Err(CommandError::Format { name: "group", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("set-config-parameter 5 3 3 1"),
            Err(CommandError::Format { name: "width", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("set-config-parameter 5 3 1 300"),
            Err(CommandError::Format { name: "value", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("set-wakeup-interval 5 16777216"),
            Err(CommandError::Format { name: "seconds", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("enable-trace maybe"),
            Err(CommandError::Format { name: "state", .. })
        ));
        assert!(matches!(
            DriverCommand::parse("refresh node=5"),
            Err(CommandError::Format { reason, .. }) if reason == "unknown parameter"
        ));
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(DriverCommand::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            DriverCommand::parse("reboot now"),
            Err(CommandError::UnknownVerb("reboot".into()))
        );
    }

    #[test]
    fn test_config_parameter() {
        let cmd = DriverCommand::parse("set-config-parameter 5 3 2 -300").expect("should parse");
        match &cmd {
            DriverCommand::SetConfigParameter { unit, param } => {
                assert_eq!(*unit, 5);
                assert_eq!(param.width, 2);
                assert_eq!(param.value, -300);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cmd.to_string(), "set-config-parameter 5 3 2 -300");
    }

    #[test]
    fn test_display_parses_back() {
        for line in [
            "add-association 5 1 2",
            "delete-association 5 1",
            "query-association 5 1",
            "get-config-parameter 9 12",
            "set-wakeup-interval 9 3600",
            "enable-trace off",
            "refresh 4",
        ] {
            let cmd = DriverCommand::parse(line).expect("should parse");
            assert_eq!(cmd.to_string(), line);
        }
    }
}
