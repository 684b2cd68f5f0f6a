#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Compiles mesh upstream bindings into Open vSwitch flows.
//!
//! Each binding becomes a three-stage conntrack NAT pipeline in table 0:
//!
//! 1. `priority=60`: new connections to `vip:local_port` are committed to the mesh conntrack
//!    zone with their destination rewritten to the upstream endpoint, and are forwarded to the
//!    endpoint's MAC.
//! 2. `priority=50`: untracked packets (i.e. replies) are sent through the same zone so that
//!    conntrack reverses the translation, then resubmitted to table 0.
//! 3. `priority=50`: established packets in the zone that are addressed to the calling service
//!    are forwarded normally.
//!
//! Stages 2 and 3 share a priority and are kept disjoint by their `ct_state` matches.

mod ofctl;
mod rule;
mod select;
mod synthesize;

pub use self::{
    ofctl::{FlowSwitch, OvsOfctl, SwitchError},
    rule::{Action, Ct, CtState, FlowRule, FlowSet, Match, Nat, Protocol},
    select::{FirstEntry, SelectDestination},
    synthesize::{
        Destination, Synthesis, SynthesisError, Synthesizer, DEFAULT_CT_ZONE, REDIRECT_PRIORITY,
        RETURN_PRIORITY, TABLE,
    },
};
