//! Instrument configuration that must hold before a sweep.
//!
//! Each entry pairs a query with a validator and the command that forces the expected
//! value. The controller checks every entry in order, enforces only the ones that fail,
//! and re-reads to confirm the enforcement took.

use super::commands;

/// A single check-enforce-verify entry.
#[derive(Debug, Clone)]
pub struct PrerequisiteCheck {
    pub name: &'static str,
    pub check_command: &'static str,
    pub enforce_command: String,
    /// Human-readable description of a passing response, used in errors.
    pub expected: String,
    rule: Rule,
}

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    /// Exact token after trimming.
    Equals(&'static str),
    /// ASCII case-insensitive token after trimming.
    EqualsIgnoreCase(&'static str),
    /// Numeric value within `1e-6` of the target.
    Number(f64),
}

impl PrerequisiteCheck {
    pub fn validate(&self, response: &str) -> bool {
        let response = response.trim();
        match self.rule {
            Rule::Equals(expected) => response == expected,
            Rule::EqualsIgnoreCase(expected) => response.eq_ignore_ascii_case(expected),
            Rule::Number(expected) => response
                .parse::<f64>()
                .is_ok_and(|value| (value - expected).abs() < 1e-6),
        }
    }
}

/// The ordered prerequisite list for a regulated sweep at `tolerance`.
pub fn standard_prerequisites(tolerance: f64) -> Vec<PrerequisiteCheck> {
    vec![
        PrerequisiteCheck {
            name: "Output State",
            check_command: commands::OUTPUT_STATE_QUERY,
            enforce_command: commands::OUTPUT_STATE_ON.to_string(),
            expected: "1".to_string(),
            rule: Rule::Equals("1"),
        },
        PrerequisiteCheck {
            name: "Pressure Mode",
            check_command: commands::PRESSURE_MODE_QUERY,
            enforce_command: commands::PRESSURE_MODE_CONTROL.to_string(),
            expected: "CONTROL".to_string(),
            rule: Rule::EqualsIgnoreCase("CONTROL"),
        },
        PrerequisiteCheck {
            name: "Static Mode",
            check_command: commands::STATIC_MODE_QUERY,
            enforce_command: commands::STATIC_MODE_OFF.to_string(),
            expected: "0".to_string(),
            rule: Rule::Equals("0"),
        },
        PrerequisiteCheck {
            name: "Tolerance",
            check_command: commands::TOLERANCE_QUERY,
            enforce_command: commands::set_tolerance(tolerance),
            expected: format!("{tolerance}"),
            rule: Rule::Number(tolerance),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str) -> PrerequisiteCheck {
        standard_prerequisites(0.1)
            .into_iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    #[test]
    fn test_order_is_fixed() {
        let names: Vec<_> = standard_prerequisites(0.1)
            .iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            ["Output State", "Pressure Mode", "Static Mode", "Tolerance"]
        );
    }

    #[test]
    fn test_output_state_requires_literal_one() {
        let c = check("Output State");
        assert!(c.validate("1"));
        assert!(c.validate("1\r"));
        assert!(!c.validate("0"));
        assert!(!c.validate("ON"));
    }

    #[test]
    fn test_pressure_mode_is_case_insensitive() {
        let c = check("Pressure Mode");
        assert!(c.validate("CONTROL"));
        assert!(c.validate("Control"));
        assert!(!c.validate("MEASURE"));
    }

    #[test]
    fn test_static_mode_requires_zero() {
        let c = check("Static Mode");
        assert!(c.validate("0"));
        assert!(!c.validate("1"));
    }

    #[test]
    fn test_tolerance_compares_numerically() {
        let c = check("Tolerance");
        assert!(c.validate("0.1"));
        assert!(c.validate("1.000000E-01"));
        assert!(!c.validate("0.5"));
        assert!(!c.validate("garbage"));
        assert_eq!(c.enforce_command, "SOURce:PRESsure:TOLerance 0.1");
    }
}
