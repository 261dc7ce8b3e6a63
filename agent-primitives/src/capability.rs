//! Capability names addressed by the transport layer.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 256;

/// Name of an operation exposed by an agent.
///
/// Names are opaque to the transport layer: HTTP bindings append them to the
/// endpoint path, the local binding treats them as dotted symbol paths.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(String);

impl CapabilityName {
    /// Creates a capability name after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapabilityName`] if the name is empty, too long,
    /// or contains whitespace or control characters.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Returns the capability name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CapabilityName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for CapabilityName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CapabilityName> for String {
    fn from(value: CapabilityName) -> Self {
        value.0
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidCapabilityName {
            name: String::new(),
            reason: "name cannot be empty".into(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidCapabilityName {
            name: name.into(),
            reason: format!("name length must be <= {MAX_NAME_LEN}"),
        });
    }

    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidCapabilityName {
            name: name.into(),
            reason: "name cannot contain whitespace or control characters".into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_and_path_like_names() {
        assert!(CapabilityName::new("echo").is_ok());
        assert!(CapabilityName::new("math.add").is_ok());
        assert!(CapabilityName::new("v1/summarize").is_ok());
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        let err = CapabilityName::new("").expect_err("empty");
        assert!(matches!(err, Error::InvalidCapabilityName { .. }));

        let err = CapabilityName::new("has space").expect_err("space");
        assert!(matches!(err, Error::InvalidCapabilityName { name, .. } if name == "has space"));
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert!(CapabilityName::new(long).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: CapabilityName = serde_json::from_str("\"echo\"").unwrap();
        assert_eq!(ok.as_str(), "echo");
        assert!(serde_json::from_str::<CapabilityName>("\"\"").is_err());
    }
}
