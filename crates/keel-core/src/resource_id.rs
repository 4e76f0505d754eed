//! Resource identifier parsing.
//!
//! A resource id has the form `<entity_type>[<agent_name>,<attribute>=<value>]`,
//! e.g. `std::File[host1,path=/etc/motd]`. Ids are stable across model
//! versions; the version a resource belongs to is external context.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A resource id in string form. This is the key used by the scheduler.
pub type ResourceIdStr = String;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<type>[\w:.-]+)\[(?P<agent>[^,\[\]]+),(?P<attr>[^=,\[\]]+)=(?P<value>.+)\]$")
        .expect("resource id pattern is a valid regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceIdError {
    #[error("invalid resource id: {0}")]
    Invalid(String),
}

/// A parsed resource id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub entity_type: String,
    pub agent_name: String,
    pub attribute: String,
    pub attribute_value: String,
}

impl ResourceId {
    pub fn parse(id: &str) -> Result<Self, ResourceIdError> {
        let caps = ID_PATTERN
            .captures(id)
            .ok_or_else(|| ResourceIdError::Invalid(id.to_string()))?;
        Ok(ResourceId {
            entity_type: caps["type"].to_string(),
            agent_name: caps["agent"].to_string(),
            attribute: caps["attr"].to_string(),
            attribute_value: caps["value"].to_string(),
        })
    }

    pub fn resource_str(&self) -> ResourceIdStr {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{},{}={}]",
            self.entity_type, self.agent_name, self.attribute, self.attribute_value
        )
    }
}

/// Agent name of a resource id string.
///
/// Ids are validated when a model version is ingested, so this does a cheap
/// structural split instead of a full parse. A malformed id yields `""`.
pub fn agent_of(id: &str) -> &str {
    id.split_once('[')
        .and_then(|(_, rest)| rest.split_once(','))
        .map(|(agent, _)| agent)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_resource() {
        let id = ResourceId::parse("std::File[host1,path=/etc/motd]").unwrap();
        assert_eq!(id.entity_type, "std::File");
        assert_eq!(id.agent_name, "host1");
        assert_eq!(id.attribute, "path");
        assert_eq!(id.attribute_value, "/etc/motd");
    }

    #[test]
    fn test_display_roundtrips_the_string_form() {
        let raw = "test::Resource[agent-2,name=a,b]";
        let id = ResourceId::parse(raw).unwrap();
        assert_eq!(id.attribute_value, "a,b");
        assert_eq!(id.resource_str(), raw);
    }

    #[test]
    fn test_reject_malformed() {
        assert!(ResourceId::parse("std::File").is_err());
        assert!(ResourceId::parse("std::File[host1]").is_err());
        assert!(ResourceId::parse("[host1,path=/x]").is_err());
        assert_eq!(
            ResourceId::parse("nope"),
            Err(ResourceIdError::Invalid("nope".to_string()))
        );
    }

    #[test]
    fn test_agent_of() {
        assert_eq!(agent_of("std::File[host1,path=/etc/motd]"), "host1");
        assert_eq!(agent_of("garbage"), "");
    }
}
