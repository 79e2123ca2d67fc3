use crate::error::ChannelError;
use crate::peer::types::IceServerConfig;
use crate::session::Role;
use rand::Rng;
use url::Url;

/// Path under which the relay serves the two consultation roles.
pub const CONSULTATION_PATH: &str = "/ws/live-consultation";

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Adds the protocol scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Derives the signaling endpoint from the page origin: same host, `wss`
/// when the page was served over https, `ws` otherwise.
pub fn signaling_endpoint(origin: &str, role: Role) -> Result<String, ChannelError> {
    let parsed = Url::parse(origin).map_err(|_| ChannelError::InvalidEndpoint(origin.to_owned()))?;
    let scheme = match parsed.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(ChannelError::InvalidEndpoint(origin.to_owned())),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| ChannelError::InvalidEndpoint(origin.to_owned()))?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    Ok(format!(
        "{scheme}://{authority}{CONSULTATION_PATH}/{}",
        role.path()
    ))
}

/// Role encoded in the last path segment of an endpoint.
pub fn role_from_endpoint(endpoint: &str) -> Option<Role> {
    endpoint
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
}
