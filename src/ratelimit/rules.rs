//! Rate limit rules and their textual form.
//!
//! A rule set is written one rule per line:
//!
//! ```text
//! # internal clients
//! 10.0.0.0/8     = 3/minute
//! 192.168.1.17   = unlimited/hour
//! *              = 1/minute
//! ```
//!
//! The left-hand side is a CIDR block, a bare address (a host network) or `*`
//! for any address. The right-hand side is a positive rate, or `unlimited`,
//! followed by a unit. Lines are kept in the order they were written and the
//! first matching line wins.

use ipnet::IpNet;
use serde::{Serialize, Serializer};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

use super::period::TimeUnit;
use crate::error::{NetquotaError, Result};

/// Symbol that matches any client address, or allows any rate.
pub const ANY: &str = "*";

/// The left-hand side of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkPattern {
    /// Matches every address
    Any,
    /// Matches addresses inside the network
    Net(IpNet),
}

impl NetworkPattern {
    /// Whether this pattern covers `addr`.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            NetworkPattern::Any => true,
            NetworkPattern::Net(net) => net.contains(addr),
        }
    }
}

impl FromStr for NetworkPattern {
    type Err = NetquotaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == ANY {
            return Ok(NetworkPattern::Any);
        }

        if s.contains('/') {
            let net: IpNet = s
                .parse()
                .map_err(|e| NetquotaError::Config(format!("Invalid network `{}`: {}", s, e)))?;
            return Ok(NetworkPattern::Net(net.trunc()));
        }

        let addr: IpAddr = s
            .parse()
            .map_err(|e| NetquotaError::Config(format!("Invalid network `{}`: {}", s, e)))?;
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        let net = IpNet::new(addr, prefix_len)
            .map_err(|e| NetquotaError::Config(format!("Invalid network `{}`: {}", s, e)))?;
        Ok(NetworkPattern::Net(net))
    }
}

impl std::fmt::Display for NetworkPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkPattern::Any => f.write_str(ANY),
            NetworkPattern::Net(net) => write!(f, "{}", net),
        }
    }
}

impl Serialize for NetworkPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How many requests a rule allows per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rate {
    /// At most this many requests
    Limited(u64),
    /// No ceiling; requests are still counted
    Unlimited,
}

impl FromStr for Rate {
    type Err = NetquotaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == ANY || s.eq_ignore_ascii_case("unlimited") {
            return Ok(Rate::Unlimited);
        }

        match s.parse::<u64>() {
            Ok(0) => Err(NetquotaError::Config("Rate must be greater than zero".to_string())),
            Ok(n) => Ok(Rate::Limited(n)),
            Err(e) => Err(NetquotaError::Config(format!("Invalid rate `{}`: {}", s, e))),
        }
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rate::Limited(n) => write!(f, "{}", n),
            Rate::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Rate::Limited(n) => serializer.serialize_u64(*n),
            Rate::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// A rate and the period it applies to, e.g. `100/minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateSpec {
    pub rate: Rate,
    pub unit: TimeUnit,
}

impl FromStr for RateSpec {
    type Err = NetquotaError;

    fn from_str(s: &str) -> Result<Self> {
        let (rate, unit) = s.split_once('/').ok_or_else(|| {
            NetquotaError::Config(format!("Expected `<rate>/<unit>`, got `{}`", s.trim()))
        })?;

        Ok(Self {
            rate: rate.parse()?,
            unit: unit.parse()?,
        })
    }
}

impl std::fmt::Display for RateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.rate, self.unit)
    }
}

/// One line of a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuleItem {
    pub network: NetworkPattern,
    pub rate: Rate,
    pub unit: TimeUnit,
}

impl RuleItem {
    /// Parse a single `<network> = <rate>/<unit>` line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let (network, spec) = line.split_once('=').ok_or_else(|| {
            NetquotaError::Config(format!("Expected `<network> = <rate>/<unit>`, got `{}`", line))
        })?;
        let spec: RateSpec = spec.parse()?;

        Ok(Self {
            network: network.parse()?,
            rate: spec.rate,
            unit: spec.unit,
        })
    }
}

impl std::fmt::Display for RuleItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}/{}", self.network, self.rate, self.unit)
    }
}

/// An ordered list of rules for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    items: Vec<RuleItem>,
    from_any: Option<RateSpec>,
}

impl RuleSet {
    /// A rule set that applies one rate to every client.
    pub fn from_any(rate: Rate, unit: TimeUnit) -> Self {
        Self {
            items: Vec::new(),
            from_any: Some(RateSpec { rate, unit }),
        }
    }

    /// Build a rule set from already parsed items.
    ///
    /// A set consisting of a single wildcard rule is turned into the from-any
    /// shortcut.
    pub fn from_items(items: Vec<RuleItem>) -> Result<Self> {
        if items.is_empty() {
            return Err(NetquotaError::Config("Rule set is empty".to_string()));
        }

        if let [only] = items.as_slice() {
            if only.network == NetworkPattern::Any {
                return Ok(Self::from_any(only.rate, only.unit));
            }
        }

        Ok(Self {
            items,
            from_any: None,
        })
    }

    /// Parse rule text, one rule per line.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut items = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let item = RuleItem::parse_line(line).map_err(|e| {
                NetquotaError::Config(format!("Line {}: {}", idx + 1, error_message(e)))
            })?;
            items.push(item);
        }

        let rules = Self::from_items(items)?;
        debug!(
            rules = rules.items.len(),
            from_any = ?rules.from_any.map(|spec| spec.to_string()),
            "Parsed rate limit rules"
        );
        Ok(rules)
    }

    /// The ordered rules.
    pub fn items(&self) -> &[RuleItem] {
        &self.items
    }

    /// The from-any shortcut, if configured.
    pub fn from_any_spec(&self) -> Option<RateSpec> {
        self.from_any
    }

    /// The first rule covering `addr`.
    pub fn find(&self, addr: &IpAddr) -> Option<&RuleItem> {
        self.items.iter().find(|item| item.network.matches(addr))
    }
}

impl std::fmt::Display for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(spec) = self.from_any {
            return write!(f, "{} = {}", ANY, spec);
        }
        for (idx, item) in self.items.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}

fn error_message(err: NetquotaError) -> String {
    match err {
        NetquotaError::Config(msg) => msg,
        other => other.to_string(),
    }
}
