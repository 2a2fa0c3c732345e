//! Endpoint parsing and formatting
//!
//! Every addressable context has a compact text form:
//! ```text
//! coordinator
//! popup
//! devtools@12
//! content-script@12
//! content-script@12.3
//! window@12.0
//! ```
//!
//! Hub-affine kinds (`coordinator`, `popup`, `options`) never carry a tab id.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const ENDPOINT_PATTERN: &str =
    r"^(coordinator|devtools|popup|options|content-script|window)(?:@(\d+)(?:\.(\d+))?)?$";

fn endpoint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ENDPOINT_PATTERN).expect("endpoint pattern is valid"))
}

/// The six kinds of execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    /// The hub every relay passes through
    Coordinator,
    Devtools,
    Popup,
    Options,
    ContentScript,
    /// Page-embedded script, reachable only through its content script
    Window,
}

impl ContextKind {
    pub const ALL: [ContextKind; 6] = [
        ContextKind::Coordinator,
        ContextKind::Devtools,
        ContextKind::Popup,
        ContextKind::Options,
        ContextKind::ContentScript,
        ContextKind::Window,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Coordinator => "coordinator",
            ContextKind::Devtools => "devtools",
            ContextKind::Popup => "popup",
            ContextKind::Options => "options",
            ContextKind::ContentScript => "content-script",
            ContextKind::Window => "window",
        }
    }

    /// Kinds that live alongside the hub and are never tab-scoped
    pub fn is_hub_affine(&self) -> bool {
        matches!(
            self,
            ContextKind::Coordinator | ContextKind::Popup | ContextKind::Options
        )
    }

    pub fn is_hub(&self) -> bool {
        matches!(self, ContextKind::Coordinator)
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ContextKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::AddressParse(format!("unknown context kind: {}", s)))
    }
}

/// An addressable context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub context: ContextKind,
    pub tab_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u32>,
}

impl Endpoint {
    /// Endpoint without tab or frame scoping
    pub const fn bare(context: ContextKind) -> Self {
        Self {
            context,
            tab_id: None,
            frame_id: None,
        }
    }

    pub const fn coordinator() -> Self {
        Self::bare(ContextKind::Coordinator)
    }

    pub const fn in_tab(context: ContextKind, tab_id: u32) -> Self {
        Self {
            context,
            tab_id: Some(tab_id),
            frame_id: None,
        }
    }

    pub const fn in_frame(context: ContextKind, tab_id: u32, frame_id: u32) -> Self {
        Self {
            context,
            tab_id: Some(tab_id),
            frame_id: Some(frame_id),
        }
    }

    /// Parse the `kind[@tabId[.frameId]]` text form
    pub fn parse(s: &str) -> Result<Self> {
        let caps = endpoint_regex()
            .captures(s)
            .ok_or_else(|| Error::AddressParse(format!("malformed endpoint: {:?}", s)))?;

        let context: ContextKind = caps[1].parse()?;
        let tab_id = caps.get(2).map(|m| parse_id(m.as_str(), s)).transpose()?;
        let frame_id = caps.get(3).map(|m| parse_id(m.as_str(), s)).transpose()?;

        if context.is_hub_affine() && tab_id.is_some() {
            return Err(Error::AddressParse(format!(
                "{} endpoints cannot be tab-scoped: {}",
                context, s
            )));
        }

        Ok(Self {
            context,
            tab_id,
            frame_id,
        })
    }

    /// Format into the text form accepted by [`Endpoint::parse`]
    pub fn format(&self) -> String {
        if self.context.is_hub_affine() {
            return self.context.as_str().to_string();
        }

        match (self.tab_id, self.frame_id) {
            (Some(tab), Some(frame)) => format!("{}@{}.{}", self.context, tab, frame),
            (Some(tab), None) => format!("{}@{}", self.context, tab),
            (None, _) => self.context.as_str().to_string(),
        }
    }

    /// True when no tab or frame sub-addressing remains
    pub fn is_unscoped(&self) -> bool {
        self.tab_id.is_none() && self.frame_id.is_none()
    }

    /// True if a packet addressed to `self` is meant for the running context
    /// whose full address is `local`. A missing frame means frame 0.
    pub fn reaches(&self, local: &Endpoint) -> bool {
        self.context == local.context
            && (self.is_unscoped()
                || (self.tab_id == local.tab_id
                    && self.frame_id.unwrap_or(0) == local.frame_id.unwrap_or(0)))
    }

    /// Fill missing tab/frame from the connection this endpoint arrived on
    pub fn scoped_like(&self, other: &Endpoint) -> Self {
        if self.tab_id.is_some() || self.context.is_hub_affine() {
            return *self;
        }
        Self {
            context: self.context,
            tab_id: other.tab_id,
            frame_id: other.frame_id,
        }
    }
}

fn parse_id(digits: &str, whole: &str) -> Result<u32> {
    digits
        .parse()
        .map_err(|_| Error::AddressParse(format!("id out of range in endpoint: {:?}", whole)))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl TryFrom<&str> for Endpoint {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl From<ContextKind> for Endpoint {
    fn from(kind: ContextKind) -> Self {
        Endpoint::bare(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_kinds() {
        for kind in ContextKind::ALL {
            let ep = Endpoint::parse(kind.as_str()).unwrap();
            assert_eq!(ep, Endpoint::bare(kind));
        }
    }

    #[test]
    fn test_parse_scoped() {
        let ep = Endpoint::parse("content-script@12.3").unwrap();
        assert_eq!(ep.context, ContextKind::ContentScript);
        assert_eq!(ep.tab_id, Some(12));
        assert_eq!(ep.frame_id, Some(3));

        let ep = Endpoint::parse("devtools@7").unwrap();
        assert_eq!(ep, Endpoint::in_tab(ContextKind::Devtools, 7));
    }

    #[test]
    fn test_hub_affine_rejects_tab() {
        assert!(Endpoint::parse("coordinator@1").is_err());
        assert!(Endpoint::parse("popup@1.2").is_err());
        assert!(Endpoint::parse("options@4").is_err());
    }

    #[test]
    fn test_hub_affine_formats_bare() {
        let ep = Endpoint {
            context: ContextKind::Popup,
            tab_id: Some(9),
            frame_id: Some(1),
        };
        assert_eq!(ep.format(), "popup");
    }

    #[test]
    fn test_frame_zero_is_kept() {
        let ep = Endpoint::parse("window@5.0").unwrap();
        assert_eq!(ep.format(), "window@5.0");
    }

    #[test]
    fn test_scoped_like() {
        let conn = Endpoint::in_frame(ContextKind::ContentScript, 4, 0);
        let origin = Endpoint::bare(ContextKind::Window).scoped_like(&conn);
        assert_eq!(origin, Endpoint::in_frame(ContextKind::Window, 4, 0));

        let popup = Endpoint::bare(ContextKind::Popup).scoped_like(&conn);
        assert!(popup.is_unscoped());
    }

    #[test]
    fn test_reaches() {
        let local = Endpoint::in_frame(ContextKind::ContentScript, 7, 0);
        assert!(Endpoint::bare(ContextKind::ContentScript).reaches(&local));
        assert!(Endpoint::in_tab(ContextKind::ContentScript, 7).reaches(&local));
        assert!(Endpoint::in_frame(ContextKind::ContentScript, 7, 0).reaches(&local));
        assert!(!Endpoint::in_frame(ContextKind::ContentScript, 7, 1).reaches(&local));
        assert!(!Endpoint::in_tab(ContextKind::ContentScript, 8).reaches(&local));
        assert!(!Endpoint::in_tab(ContextKind::Window, 7).reaches(&local));

        let popup = Endpoint::bare(ContextKind::Popup);
        assert!(popup.reaches(&popup));
    }
}
