//! Password policy: what setup accepts as a master password.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Character classes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CharClass {
    Lower,
    Upper,
    Digit,
    Symbol,
}

fn classify(c: char) -> CharClass {
    if c.is_lowercase() {
        CharClass::Lower
    } else if c.is_uppercase() {
        CharClass::Upper
    } else if c.is_numeric() {
        CharClass::Digit
    } else {
        CharClass::Symbol
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Strength rules applied once, at setup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    /// Minimum length in characters.
    pub min_length: usize,
    /// How many of {lower, upper, digit, symbol} must appear.
    pub min_classes: usize,
    /// Reject passwords made of one repeated character.
    pub reject_repeated: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            min_classes: 3,
            reject_repeated: true,
        }
    }
}

/// Result of evaluating a password against a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyVerdict {
    Acceptable,
    Rejected { reason: String },
}

impl PolicyVerdict {
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Self::Acceptable)
    }
}

impl PasswordPolicy {
    /// Accept anything non-empty. For tests and embedded callers that do
    /// their own checks.
    pub fn permissive() -> Self {
        Self {
            min_length: 1,
            min_classes: 0,
            reject_repeated: false,
        }
    }

    /// Evaluate a candidate. The reason never echoes the password.
    pub fn evaluate(&self, password: &str) -> PolicyVerdict {
        let length = password.chars().count();
        if length < self.min_length.max(1) {
            return PolicyVerdict::Rejected {
                reason: format!("must be at least {} characters", self.min_length.max(1)),
            };
        }

        let mut seen: Vec<CharClass> = Vec::with_capacity(4);
        for class in password.chars().map(classify) {
            if !seen.contains(&class) {
                seen.push(class);
            }
        }
        if seen.len() < self.min_classes {
            return PolicyVerdict::Rejected {
                reason: format!(
                    "must mix at least {} of lowercase, uppercase, digits and symbols",
                    self.min_classes
                ),
            };
        }

        if self.reject_repeated && length > 1 {
            let mut chars = password.chars();
            if let Some(first) = chars.next() {
                if chars.all(|c| c == first) {
                    return PolicyVerdict::Rejected {
                        reason: "must not be a single repeated character".into(),
                    };
                }
            }
        }

        PolicyVerdict::Acceptable
    }
}
