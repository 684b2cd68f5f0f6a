use crate::rule::{Action, Ct, CtState, FlowRule, FlowSet, Match, Nat, Protocol};
use ovs_mesh_controller_core::{CatalogEntry, NetworkAttachment, UpstreamBinding};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
};

/// The table holding all mesh flows.
pub const TABLE: u8 = 0;

/// Priority of the flows that redirect new connections to an upstream endpoint.
pub const REDIRECT_PRIORITY: u16 = 60;

/// Priority of the flows that carry replies back to callers.
pub const RETURN_PRIORITY: u16 = 50;

/// The conntrack zone shared by all mesh connections.
pub const DEFAULT_CT_ZONE: u16 = 1;

/// The upstream instance selected for a binding, with its identity on the mesh network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub entry: CatalogEntry,
    pub attachment: NetworkAttachment,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("destination {service_id} does not expose a port")]
    ZeroPort { service_id: String },

    #[error("destination {service_id} has an unspecified address")]
    UnspecifiedAddress { service_id: String },

    #[error("virtual IP {virtual_ip}, destination {destination} and service {service} are not in the same address family")]
    AddressFamilyMismatch {
        virtual_ip: IpAddr,
        destination: IpAddr,
        service: IpAddr,
    },

    #[error("local port {port} is already bound to upstream {existing}")]
    PortConflict { port: NonZeroU16, existing: String },
}

/// The flows for a service's upstreams, along with the outcome of each binding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Synthesis {
    pub rules: FlowSet,
    pub outcomes: Vec<(UpstreamBinding, Result<(), SynthesisError>)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Synthesizer {
    zone: u16,
}

// === impl Synthesizer ===

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_CT_ZONE)
    }
}

impl Synthesizer {
    pub fn new(zone: u16) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> u16 {
        self.zone
    }

    /// Compiles the flows for each of a service's resolved upstreams.
    ///
    /// A binding that can't be compiled is reported in `outcomes` and contributes no flows; the
    /// remaining bindings are unaffected. Two bindings may only share a local port when they redirect
    /// to the same instance.
    pub fn synthesize<'a>(
        &self,
        service_address: IpAddr,
        bindings: impl IntoIterator<Item = (&'a UpstreamBinding, &'a Destination)>,
    ) -> Synthesis {
        let mut synthesis = Synthesis::default();
        // Each local port is claimed by the first binding that compiles, along with the instance
        // it was redirected to.
        let mut ports = HashMap::<(IpAddr, NonZeroU16), (&'a str, &'a str)>::new();

        for (binding, dst) in bindings {
            let key = (binding.local_bind_address, binding.local_bind_port);
            let claim = (
                binding.destination_service.as_str(),
                dst.entry.service_id.as_str(),
            );
            let conflict = ports
                .get(&key)
                .copied()
                .filter(|existing| *existing != claim);
            let result = match conflict {
                Some((existing, _)) => Err(SynthesisError::PortConflict {
                    port: binding.local_bind_port,
                    existing: existing.to_string(),
                }),
                None => self
                    .binding_rules(service_address, binding, dst)
                    .map(|rules| {
                        ports.insert(key, claim);
                        synthesis.rules.extend(rules);
                    }),
            };
            if let Err(error) = &result {
                tracing::debug!(upstream = %binding.destination_service, %error, "Skipping upstream");
            }
            synthesis.outcomes.push((binding.clone(), result));
        }

        debug_assert!(
            synthesis.rules.ambiguities().is_empty(),
            "equal-priority flows must be disjoint"
        );
        synthesis
    }

    /// Compiles the three flows that redirect `binding` to `dst`.
    pub fn binding_rules(
        &self,
        service_address: IpAddr,
        binding: &UpstreamBinding,
        dst: &Destination,
    ) -> Result<[FlowRule; 3], SynthesisError> {
        let entry = &dst.entry;
        if entry.port == 0 {
            return Err(SynthesisError::ZeroPort {
                service_id: entry.service_id.clone(),
            });
        }
        if entry.address.is_unspecified() {
            return Err(SynthesisError::UnspecifiedAddress {
                service_id: entry.service_id.clone(),
            });
        }
        let vip = binding.local_bind_address;
        if vip.is_ipv4() != entry.address.is_ipv4() || vip.is_ipv4() != service_address.is_ipv4()
        {
            return Err(SynthesisError::AddressFamilyMismatch {
                virtual_ip: vip,
                destination: entry.address,
                service: service_address,
            });
        }
        let protocol = Protocol::for_addr(vip);

        let redirect = FlowRule::new(
            TABLE,
            REDIRECT_PRIORITY,
            protocol,
            [Match::DstAddr(vip), Match::DstPort(binding.local_bind_port)],
            [
                Action::Ct(Ct {
                    commit: true,
                    zone: self.zone,
                    table: None,
                    nat: Some(Nat::Dst(SocketAddr::new(entry.address, entry.port))),
                }),
                Action::SetEthDst(dst.attachment.mac()),
                Action::Normal,
            ],
        );

        let untracked = FlowRule::new(
            TABLE,
            RETURN_PRIORITY,
            protocol,
            [Match::CtState(CtState::UNTRACKED)],
            [Action::Ct(Ct {
                commit: false,
                zone: self.zone,
                table: Some(TABLE),
                nat: Some(Nat::Stateful),
            })],
        );

        let established = FlowRule::new(
            TABLE,
            RETURN_PRIORITY,
            protocol,
            [
                Match::CtState(CtState::ESTABLISHED),
                Match::CtZone(self.zone),
                Match::DstAddr(service_address),
            ],
            [Action::Normal],
        );

        Ok([redirect, untracked, established])
    }
}
