//! Attributes derived from the network information of a request.
use logsreceiver::entry::Entry;

pub const PEER_IP: &str = "net.peer.ip";
pub const PEER_PORT: &str = "net.peer.port";
pub const HOST_IP: &str = "net.host.ip";
pub const HOST_PORT: &str = "net.host.port";
pub const PROTOCOL: &str = "protocol";
pub const PROTOCOL_VERSION: &str = "protocol_version";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("address '{0}' has no port")]
    MissingPort(String),
    #[error("address '{0}' has no host")]
    MissingHost(String),
    #[error("invalid port in address '{0}'")]
    InvalidPort(String),
    #[error("malformed address '{0}'")]
    MalformedAddress(String),
    #[error("invalid protocol '{0}', expected NAME/VERSION")]
    InvalidProtocol(String),
}

/// Sets `net.peer.ip` and `net.peer.port` from the address of the client.
pub fn add_peer_labels(remote_addr: &str, entry: &mut Entry) -> Result<(), LabelError> {
    let (ip, port) = split_host_port(remote_addr)?;
    entry.add_attribute(PEER_IP, ip);
    entry.add_attribute(PEER_PORT, port);
    Ok(())
}

/// Sets `net.host.ip` and `net.host.port` from the `Host` of the request.
pub fn add_host_labels(host: &str, entry: &mut Entry) -> Result<(), LabelError> {
    let (ip, port) = split_host_port(host)?;
    entry.add_attribute(HOST_IP, ip);
    entry.add_attribute(HOST_PORT, port);
    Ok(())
}

/// Sets `protocol` and `protocol_version` from a protocol string such as `HTTP/1.1`.
pub fn add_proto_labels(proto: &str, entry: &mut Entry) -> Result<(), LabelError> {
    let invalid = || LabelError::InvalidProtocol(proto.to_owned());
    let (name, version) = proto.split_once('/').ok_or_else(invalid)?;
    let valid_version = !version.is_empty()
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
        && version.chars().any(|c| c.is_ascii_digit());
    if name.is_empty() || !valid_version {
        return Err(invalid());
    }
    entry.add_attribute(PROTOCOL, name);
    entry.add_attribute(PROTOCOL_VERSION, version);
    Ok(())
}

/// Splits `host:port` or `[ipv6]:port`.
fn split_host_port(addr: &str) -> Result<(&str, &str), LabelError> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest
            .split_once(']')
            .ok_or_else(|| LabelError::MalformedAddress(addr.to_owned()))?;
        let port = port
            .strip_prefix(':')
            .ok_or_else(|| LabelError::MissingPort(addr.to_owned()))?;
        (host, port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| LabelError::MissingPort(addr.to_owned()))?;
        if host.contains(':') {
            // unbracketed IPv6
            return Err(LabelError::MalformedAddress(addr.to_owned()));
        }
        (host, port)
    };
    if host.is_empty() {
        return Err(LabelError::MissingHost(addr.to_owned()));
    }
    if port.is_empty() {
        return Err(LabelError::MissingPort(addr.to_owned()));
    }
    if port.parse::<u16>().is_err() {
        return Err(LabelError::InvalidPort(addr.to_owned()));
    }
    Ok((host, port))
}
