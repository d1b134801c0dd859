use serde::Serialize;

/// Whether an outbound session addresses a single ship or a group channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundPeer {
    pub kind: PeerKind,
    pub id: String,
}

/// Canonical session addressing for one outbound Tlon message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundSession {
    pub peer: OutboundPeer,
    pub from: String,
    pub to: String,
}

/// Decode a user-supplied Tlon target into canonical peer/session ids.
///
/// Accepted shapes: `~ship` or a bare ship name, `dm:ship`, `group:X/Y`,
/// a bare `X/Y` pair, a full `chat/...` channel path, or `group:opaque`.
/// Blank input decodes to nothing.
pub fn normalize_tlon_target(raw: &str) -> Option<OutboundSession> {
    let target = raw.trim();
    let target = target.strip_prefix("tlon:").unwrap_or(target).trim();
    if target.is_empty() {
        return None;
    }

    if let Some(ship) = target.strip_prefix("dm:") {
        return direct(ship);
    }
    if let Some(rest) = target.strip_prefix("group:") {
        return group(canonical_group_id(rest.trim()));
    }
    if target.starts_with("chat/") {
        return group(target.to_string());
    }
    if target.contains('/') {
        return group(canonical_group_id(target));
    }
    direct(target)
}

fn direct(ship: &str) -> Option<OutboundSession> {
    let ship = ship.trim();
    if ship.is_empty() {
        return None;
    }
    let id = with_sigil(ship);
    Some(OutboundSession {
        from: format!("tlon:{id}"),
        to: format!("tlon:{id}"),
        peer: OutboundPeer {
            kind: PeerKind::Direct,
            id,
        },
    })
}

fn group(id: String) -> Option<OutboundSession> {
    if id.is_empty() {
        return None;
    }
    Some(OutboundSession {
        from: format!("tlon:group:{id}"),
        to: format!("tlon:{id}"),
        peer: OutboundPeer {
            kind: PeerKind::Group,
            id,
        },
    })
}

/// `X/Y` becomes `chat/~X/Y`; `chat/...` stays as-is; anything without a
/// slash is an opaque group id.
fn canonical_group_id(rest: &str) -> String {
    if rest.starts_with("chat/") {
        return rest.to_string();
    }
    match rest.split_once('/') {
        Some((host, name)) => format!("chat/{}/{name}", with_sigil(host)),
        None => rest.to_string(),
    }
}

fn with_sigil(ship: &str) -> String {
    if ship.starts_with('~') {
        ship.to_string()
    } else {
        format!("~{ship}")
    }
}
