//! UDP discovery strings
//!
//! Probe:    `<APP>_DISCOVER`
//! Response: `<APP>_SERVER:<port>:<name>[:<version>]`

/// Parsed responder reply. The host is not part of the payload; it comes from
/// the datagram's source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAnnouncement {
    pub port: u16,
    pub name: String,
    pub version: Option<String>,
}

pub fn probe_message(app_tag: &str) -> String {
    format!("{}_DISCOVER", app_tag)
}

pub fn response_prefix(app_tag: &str) -> String {
    format!("{}_SERVER:", app_tag)
}

/// True if `text` is exactly the probe string for `app_tag`
pub fn is_probe(app_tag: &str, text: &str) -> bool {
    text.trim() == probe_message(app_tag)
}

/// Build the reply a responder sends back to a prober
///
/// `:` in the name would shift the version field, so it is replaced.
pub fn format_response(app_tag: &str, announcement: &ServerAnnouncement) -> String {
    let name = announcement.name.replace(':', "_");
    match &announcement.version {
        Some(version) => format!("{}{}:{}:{}", response_prefix(app_tag), announcement.port, name, version),
        None => format!("{}{}:{}", response_prefix(app_tag), announcement.port, name),
    }
}

/// Parse a responder reply, `None` for anything that is not one
pub fn parse_response(app_tag: &str, text: &str) -> Option<ServerAnnouncement> {
    let rest = text.trim().strip_prefix(&response_prefix(app_tag))?;
    let mut parts = rest.splitn(3, ':');

    let port = parts.next()?.parse::<u16>().ok().filter(|p| *p != 0)?;
    let name = parts.next()?.to_string();
    let version = parts.next().map(str::to_string).filter(|v| !v.is_empty());

    Some(ServerAnnouncement { port, name, version })
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "TELEMETRY_BRIDGE";

    #[test]
    fn test_probe_message() {
        assert_eq!(probe_message(APP), "TELEMETRY_BRIDGE_DISCOVER");
        assert!(is_probe(APP, "TELEMETRY_BRIDGE_DISCOVER\n"));
        assert!(!is_probe(APP, "OTHER_DISCOVER"));
    }

    #[test]
    fn test_parse_response_with_version() {
        let parsed = parse_response(APP, "TELEMETRY_BRIDGE_SERVER:8080:Desk PC:1.2.0").unwrap();
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.name, "Desk PC");
        assert_eq!(parsed.version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn test_parse_response_without_version() {
        let parsed = parse_response(APP, "TELEMETRY_BRIDGE_SERVER:9000:Laptop").unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_response(APP, "TELEMETRY_BRIDGE_DISCOVER").is_none());
        assert!(parse_response(APP, "TELEMETRY_BRIDGE_SERVER:notaport:x").is_none());
        assert!(parse_response(APP, "TELEMETRY_BRIDGE_SERVER:0:x").is_none());
        assert!(parse_response(APP, "TELEMETRY_BRIDGE_SERVER:8080").is_none());
        assert!(parse_response(APP, "OTHER_SERVER:8080:x").is_none());
    }

    #[test]
    fn test_format_then_parse() {
        let announcement = ServerAnnouncement {
            port: 8080,
            name: "Desk:PC".to_string(),
            version: Some("0.1.0".to_string()),
        };
        let text = format_response(APP, &announcement);
        assert_eq!(text, "TELEMETRY_BRIDGE_SERVER:8080:Desk_PC:0.1.0");

        let parsed = parse_response(APP, &text).unwrap();
        assert_eq!(parsed.name, "Desk_PC");
        assert_eq!(parsed.version.as_deref(), Some("0.1.0"));
    }
}
