use std::{net::IpAddr, num::NonZeroU16};

/// A declared dependency on another mesh service.
///
/// Callers reach the destination by connecting to `local_bind_address:local_bind_port`; the
/// switch rewrites that to the destination's real endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamBinding {
    pub destination_service: String,
    pub local_bind_address: IpAddr,
    pub local_bind_port: NonZeroU16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamParseError {
    #[error("upstream entry {0:?} must be formatted as `name:port`")]
    MissingPort(String),

    #[error("upstream entry {0:?} has an empty service name")]
    EmptyName(String),

    #[error("upstream entry {entry:?} has an invalid port")]
    InvalidPort {
        entry: String,
        #[source]
        error: std::num::ParseIntError,
    },

    #[error("upstream list contains an empty entry")]
    EmptyEntry,
}

/// Parses a comma-separated list of `name:port` pairs, binding each upstream to `virtual_ip`.
///
/// A single malformed entry invalidates the whole list. A blank value declares no upstreams.
pub fn parse_upstreams(
    spec: &str,
    virtual_ip: IpAddr,
) -> Result<Vec<UpstreamBinding>, UpstreamParseError> {
    if spec.trim().is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',')
        .map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return Err(UpstreamParseError::EmptyEntry);
            }

            let (name, port) = entry
                .split_once(':')
                .ok_or_else(|| UpstreamParseError::MissingPort(entry.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(UpstreamParseError::EmptyName(entry.to_string()));
            }
            // `NonZeroU16` rejects 0 as well as out-of-range values.
            let port = port
                .trim()
                .parse::<NonZeroU16>()
                .map_err(|error| UpstreamParseError::InvalidPort {
                    entry: entry.to_string(),
                    error,
                })?;

            Ok(UpstreamBinding {
                destination_service: name.to_string(),
                local_bind_address: virtual_ip,
                local_bind_port: port,
            })
        })
        .collect()
}
