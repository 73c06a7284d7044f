use sysinfo::System;

const DEFAULT_LISTEN: &str = "127.0.0.1:3000";

pub fn get_default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

const PULSE_LISTEN: &str = "PULSE_LISTEN";

/// Address the server listens on, falling back to `configured`.
pub fn get_listen(configured: &str) -> String {
    std::env::var(PULSE_LISTEN).unwrap_or_else(|_| configured.to_string())
}

const PULSE_SERVER: &str = "PULSE_SERVER";

/// Server address a relay dials, falling back to `configured`.
pub fn get_server(configured: &str) -> String {
    std::env::var(PULSE_SERVER).unwrap_or_else(|_| configured.to_string())
}

const PULSE_RELAY_ID: &str = "PULSE_RELAY_ID";

const FALLBACK_RELAY_ID: &str = "relay";

/// Relay id: environment, then `configured`, then the host name.
pub fn get_relay_id(configured: Option<&str>) -> String {
    std::env::var(PULSE_RELAY_ID)
        .ok()
        .or_else(|| configured.map(String::from))
        .or_else(System::host_name)
        .unwrap_or_else(|| FALLBACK_RELAY_ID.to_string())
}
