use macaddr::MacAddr6;
use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
};

/// A single OpenFlow flow: a prioritized match and the actions applied to matching packets.
///
/// Flows are plain values: two flows are equal exactly when they render identically, so a flow
/// set can be compared against (or re-applied over) a previously installed one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowRule {
    table: u8,
    priority: u16,
    protocol: Protocol,
    matches: BTreeSet<Match>,
    actions: Vec<Action>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Tcp6,
}

/// Match fields. The variant order determines the rendering order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Match {
    CtState(CtState),
    CtZone(u16),
    DstAddr(IpAddr),
    DstPort(NonZeroU16),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtState {
    pub tracked: bool,

    /// `None` leaves the established bit unconstrained.
    pub established: Option<bool>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Ct(Ct),
    SetEthDst(MacAddr6),
    Normal,
}

/// The `ct` action: sends the packet through the connection tracker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ct {
    pub commit: bool,
    pub zone: u16,

    /// Resubmits the packet to this table once it has been tracked.
    pub table: Option<u8>,
    pub nat: Option<Nat>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Nat {
    /// Applies (or reverses) the translation already recorded for the connection.
    Stateful,

    /// Rewrites the destination of a new connection.
    Dst(SocketAddr),
}

/// An ordered, de-duplicated set of flows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowSet(BTreeSet<FlowRule>);

// === impl FlowRule ===

impl FlowRule {
    pub fn new(
        table: u8,
        priority: u16,
        protocol: Protocol,
        matches: impl IntoIterator<Item = Match>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            table,
            priority,
            protocol,
            matches: matches.into_iter().collect(),
            actions: actions.into_iter().collect(),
        }
    }

    pub fn table(&self) -> u8 {
        self.table
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn matches(&self) -> impl Iterator<Item = &Match> {
        self.matches.iter()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Returns true if no packet can match both flows.
    ///
    /// This is conservative: flows whose matches constrain different fields are assumed to
    /// overlap.
    pub fn is_disjoint(&self, other: &Self) -> bool {
        if self.table != other.table || self.protocol != other.protocol {
            return true;
        }

        self.matches.iter().any(|a| {
            other.matches.iter().any(|b| match (a, b) {
                (Match::CtState(a), Match::CtState(b)) => a.is_disjoint(b),
                (Match::CtZone(a), Match::CtZone(b)) => a != b,
                (Match::DstAddr(a), Match::DstAddr(b)) => a != b,
                (Match::DstPort(a), Match::DstPort(b)) => a != b,
                _ => false,
            })
        })
    }
}

/// Orders flows as `ovs-ofctl dump-flows` lists them: by table, then by descending priority.
impl Ord for FlowRule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.table
            .cmp(&other.table)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.protocol.cmp(&other.protocol))
            .then_with(|| self.matches.cmp(&other.matches))
            .then_with(|| self.actions.cmp(&other.actions))
    }
}

impl PartialOrd for FlowRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Renders the flow in `ovs-ofctl add-flow` syntax.
impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table={},priority={},{}",
            self.table, self.priority, self.protocol
        )?;
        for m in &self.matches {
            write!(f, ",{m}")?;
        }
        f.write_str(",actions=")?;
        for (i, a) in self.actions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{a}")?;
        }
        Ok(())
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn for_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Tcp,
            IpAddr::V6(_) => Self::Tcp6,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Tcp6 => f.write_str("tcp6"),
        }
    }
}

// === impl Match ===

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CtState(state) => write!(f, "ct_state={state}"),
            Self::CtZone(zone) => write!(f, "ct_zone={zone}"),
            Self::DstAddr(IpAddr::V4(ip)) => write!(f, "nw_dst={ip}"),
            Self::DstAddr(IpAddr::V6(ip)) => write!(f, "ipv6_dst={ip}"),
            Self::DstPort(port) => write!(f, "tp_dst={port}"),
        }
    }
}

// === impl CtState ===

impl CtState {
    pub const UNTRACKED: Self = Self {
        tracked: false,
        established: None,
    };

    pub const ESTABLISHED: Self = Self {
        tracked: true,
        established: Some(true),
    };

    fn is_disjoint(&self, other: &Self) -> bool {
        if self.tracked != other.tracked {
            return true;
        }
        matches!(
            (self.established, other.established),
            (Some(a), Some(b)) if a != b
        )
    }
}

impl fmt::Display for CtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.tracked { "+trk" } else { "-trk" })?;
        match self.established {
            Some(true) => f.write_str("+est"),
            Some(false) => f.write_str("-est"),
            None => Ok(()),
        }
    }
}

// === impl Action ===

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ct(ct) => fmt::Display::fmt(ct, f),
            Self::SetEthDst(mac) => {
                let [a, b, c, d, e, g] = mac.into_array();
                write!(
                    f,
                    "mod_dl_dst:{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}"
                )
            }
            Self::Normal => f.write_str("normal"),
        }
    }
}

impl fmt::Display for Ct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args = Vec::with_capacity(4);
        if self.commit {
            args.push("commit".to_string());
        }
        if let Some(table) = self.table {
            args.push(format!("table={table}"));
        }
        args.push(format!("zone={}", self.zone));
        match self.nat {
            None => {}
            Some(Nat::Stateful) => args.push("nat".to_string()),
            // `SocketAddr` brackets IPv6 addresses, as OVS expects.
            Some(Nat::Dst(dst)) => args.push(format!("nat(dst={dst})")),
        }
        write!(f, "ct({})", args.join(","))
    }
}

// === impl FlowSet ===

impl FlowSet {
    pub fn insert(&mut self, rule: FlowRule) -> bool {
        self.0.insert(rule)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, rule: &FlowRule) -> bool {
        self.0.contains(rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowRule> {
        self.0.iter()
    }

    /// Returns pairs of distinct flows that share a table and priority but may match the same
    /// packet, which would make the switch's choice between them undefined.
    pub fn ambiguities(&self) -> Vec<(&FlowRule, &FlowRule)> {
        let rules = self.0.iter().collect::<Vec<_>>();
        let mut ambiguous = Vec::new();
        for (i, a) in rules.iter().enumerate() {
            for b in &rules[i + 1..] {
                if a.table == b.table && a.priority == b.priority && !a.is_disjoint(b) {
                    ambiguous.push((*a, *b));
                }
            }
        }
        ambiguous
    }
}

impl Extend<FlowRule> for FlowSet {
    fn extend<T: IntoIterator<Item = FlowRule>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

impl FromIterator<FlowRule> for FlowSet {
    fn from_iter<T: IntoIterator<Item = FlowRule>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a FlowSet {
    type Item = &'a FlowRule;
    type IntoIter = std::collections::btree_set::Iter<'a, FlowRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Renders one flow per line, as read by `ovs-ofctl add-flows`.
impl fmt::Display for FlowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.0 {
            writeln!(f, "{rule}")?;
        }
        Ok(())
    }
}
