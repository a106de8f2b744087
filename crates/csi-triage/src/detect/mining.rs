//! Text heuristics that recover structured facts from free-form event
//! messages.
//!
//! Every extractor is a pure function over the message text so the rules can
//! be exercised exhaustively without cluster fixtures. The rules overlap and
//! are order-sensitive; each function documents its rule order.

/// Sentinel returned when a volume or driver cannot be recovered.
pub const UNKNOWN: &str = "unknown";

/// CSI driver identifiers recognised without a target driver hint.
pub const KNOWN_DRIVERS: [&str; 6] = [
    "cinder.csi.openstack.org",
    "rook-ceph.rbd.csi.ceph.com",
    "rook-ceph.cephfs.csi.ceph.com",
    "ebs.csi.aws.com",
    "disk.csi.azure.com",
    "pd.csi.storage.gke.io",
];

const PUNCT: &[char] = &['"', '\'', ',', '.', '(', ')', '[', ']'];
const PUNCT_COLON: &[char] = &['"', '\'', ',', '.', '(', ')', '[', ']', ':'];

fn trim_punct(token: &str) -> &str {
    token.trim_matches(|c| PUNCT.contains(&c))
}

fn trim_punct_colon(token: &str) -> &str {
    token.trim_matches(|c| PUNCT_COLON.contains(&c))
}

/// Return the quoted span following `pattern` (which must end in `"`),
/// or `None` when the pattern or closing quote is missing.
fn quoted_after<'a>(message: &'a str, pattern: &str) -> Option<&'a str> {
    let start = message.find(pattern)? + pattern.len();
    let rest = &message[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Recover a volume handle from an event message.
///
/// Rule order: explicit `pvc-` token, quoted handle after a volume keyword,
/// unquoted token after a volume keyword, then a last-resort scan for
/// handle-shaped tokens. Returns [`UNKNOWN`] when nothing matches.
#[must_use]
pub fn extract_volume(message: &str) -> String {
    // PVC-named volumes are the common case for CSI.
    if message.contains("pvc-") {
        for token in message.split_whitespace() {
            if token.starts_with("pvc-") {
                return trim_punct(token).to_string();
            }
        }
    }

    for pattern in [
        "volume \"",
        "Volume \"",
        "volumeHandle \"",
        "volumeId \"",
        "volume_id \"",
    ] {
        if let Some(handle) = quoted_after(message, pattern) {
            if !handle.is_empty() && handle != UNKNOWN {
                return handle.to_string();
            }
        }
    }

    let words: Vec<&str> = message.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        for keyword in ["volume", "volumeHandle", "volumeId"] {
            if word.eq_ignore_ascii_case(keyword) && i + 1 < words.len() {
                let next = trim_punct_colon(words[i + 1]);
                if !next.is_empty() && next != UNKNOWN && !next.contains(' ') {
                    return next.to_string();
                }
            }
        }
    }

    for word in &words {
        let clean = trim_punct_colon(word);

        // Malformed forms like `volumes=[volume-name`.
        if let Some(idx) = clean.find("volumes=[") {
            let tail = clean[idx + "volumes=[".len()..]
                .trim_matches(|c| "[]()\"',.".contains(c));
            if !tail.is_empty() && tail != UNKNOWN {
                return tail.to_string();
            }
        }

        if clean.starts_with("pvc-") {
            return clean.to_string();
        }

        // Long mixed alphanumeric tokens are probably handles, except the
        // projected-token volume names kubelet injects everywhere.
        if clean.len() > 10
            && clean.bytes().any(|b| b.is_ascii_digit())
            && clean.bytes().any(|b| b.is_ascii_lowercase())
            && !clean.contains("kube-api-access-")
            && !clean.contains("default-token-")
        {
            return clean.to_string();
        }
    }

    UNKNOWN.to_string()
}

/// Recover a CSI driver identifier from an event message.
///
/// Scans the known driver list first, then the target driver when supplied.
#[must_use]
pub fn extract_driver(message: &str, target_driver: Option<&str>) -> String {
    for driver in KNOWN_DRIVERS {
        if message.contains(driver) {
            return driver.to_string();
        }
    }

    if let Some(target) = target_driver {
        if !target.is_empty() && message.contains(target) {
            return target.to_string();
        }
    }

    UNKNOWN.to_string()
}

/// Recover a node name from an event message.
///
/// Tries quoted forms first, then the token following a bare `node` /
/// `Node` marker. Returns the empty string when nothing matches.
#[must_use]
pub fn extract_node(message: &str) -> String {
    for pattern in ["node \"", "Node \"", " node ", " Node "] {
        if pattern.ends_with('"') {
            if let Some(node) = quoted_after(message, pattern) {
                return node.to_string();
            }
        } else if let Some(start) = message.find(pattern) {
            let rest = &message[start + pattern.len()..];
            if let Some(token) = rest.split_whitespace().next() {
                let node = trim_punct_colon(token);
                if !node.is_empty() {
                    return node.to_string();
                }
            }
        }
    }
    String::new()
}

/// Recover a PVC name from an event message.
///
/// Quoted claim references first, then the token following a bare
/// `pvc` / `PVC` / `claim` keyword. Returns the empty string when nothing
/// matches.
#[must_use]
pub fn extract_pvc(message: &str) -> String {
    for pattern in [
        "pvc \"",
        "PVC \"",
        "persistentvolumeclaim \"",
        "PersistentVolumeClaim \"",
        "claim \"",
    ] {
        if let Some(name) = quoted_after(message, pattern) {
            return name.to_string();
        }
    }

    let words: Vec<&str> = message.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        for keyword in ["pvc", "claim"] {
            if word.eq_ignore_ascii_case(keyword) && i + 1 < words.len() {
                let next = trim_punct_colon(words[i + 1]);
                if !next.is_empty() && !next.contains(' ') {
                    return next.to_string();
                }
            }
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_from_pvc_token() {
        assert_eq!(
            extract_volume("Multi-Attach error for volume pvc-123"),
            "pvc-123"
        );
        assert_eq!(
            extract_volume("detached volume pvc-aa11, retrying"),
            "pvc-aa11"
        );
    }

    #[test]
    fn volume_from_quoted_pattern() {
        // The quoted token does not match the bare `pvc-` prefix rule, so the
        // quoted-pattern rule has to pick it up.
        assert_eq!(
            extract_volume("MountVolume.SetUp failed for volume \"pvc-789\" : timeout"),
            "pvc-789"
        );
        assert_eq!(
            extract_volume("volumeHandle \"0011-aabb\" is busy"),
            "0011-aabb"
        );
    }

    #[test]
    fn volume_from_keyword_successor() {
        assert_eq!(extract_volume("cannot attach volume vol1 to node"), "vol1");
        assert_eq!(extract_volume("VOLUME data99: not found"), "data99");
    }

    #[test]
    fn volume_from_bracket_form() {
        assert_eq!(
            extract_volume("waiting on volumes=[data-disk-7"),
            "data-disk-7"
        );
    }

    #[test]
    fn volume_from_handle_shaped_token() {
        assert_eq!(
            extract_volume("operation failed on 0123456789abcdef"),
            "0123456789abcdef"
        );
        // kubelet token volumes never count as handles
        assert_eq!(
            extract_volume("could not mount kube-api-access-x7f2p correctly"),
            UNKNOWN
        );
        assert_eq!(
            extract_volume("could not mount default-token-abc12 correctly"),
            UNKNOWN
        );
    }

    #[test]
    fn volume_falls_back_to_unknown() {
        assert_eq!(extract_volume("nothing to see here"), UNKNOWN);
        assert_eq!(extract_volume(""), UNKNOWN);
    }

    #[test]
    fn driver_from_known_list() {
        assert_eq!(
            extract_driver("AttachVolume failed for cinder.csi.openstack.org", None),
            "cinder.csi.openstack.org"
        );
        assert_eq!(
            extract_driver("rpc error from ebs.csi.aws.com controller", None),
            "ebs.csi.aws.com"
        );
    }

    #[test]
    fn driver_from_target_fallback() {
        assert_eq!(
            extract_driver("error from custom.csi.example.io", Some("custom.csi.example.io")),
            "custom.csi.example.io"
        );
        assert_eq!(extract_driver("error from somewhere", Some("custom.csi.example.io")), UNKNOWN);
        assert_eq!(extract_driver("no driver here", None), UNKNOWN);
    }

    #[test]
    fn node_from_quoted_pattern() {
        assert_eq!(
            extract_node("volume is attached to node \"worker-3\" already"),
            "worker-3"
        );
    }

    #[test]
    fn node_from_unquoted_pattern() {
        assert_eq!(
            extract_node("cannot detach from node worker-9: busy"),
            "worker-9"
        );
    }

    #[test]
    fn node_empty_when_absent() {
        assert_eq!(extract_node("no location information"), "");
    }

    #[test]
    fn pvc_from_quoted_pattern() {
        assert_eq!(
            extract_pvc("pod references claim \"data-claim\" in use"),
            "data-claim"
        );
        assert_eq!(
            extract_pvc("PersistentVolumeClaim \"web-data\" not bound"),
            "web-data"
        );
    }

    #[test]
    fn pvc_from_keyword_successor() {
        assert_eq!(extract_pvc("waiting for PVC data-claim: pending"), "data-claim");
    }

    #[test]
    fn pvc_empty_when_absent() {
        assert_eq!(extract_pvc("nothing claim-like here"), "");
    }

    #[test]
    fn extractors_are_idempotent_on_their_output() {
        for message in [
            "Multi-Attach error for volume pvc-123",
            "MountVolume.SetUp failed for volume \"pvc-789\" : timeout",
            "cannot attach volume vol1 to node",
            "operation failed on 0123456789abcdef",
        ] {
            let volume = extract_volume(message);
            assert_eq!(extract_volume(&format!("retry for volume {volume} soon")), volume);
        }

        let node = extract_node("attached to node \"worker-3\"");
        assert_eq!(extract_node(&format!("still on node {node} now")), node);

        let claim = extract_pvc("waiting for claim \"data-claim\"");
        assert_eq!(extract_pvc(&format!("pvc {claim} pending")), claim);
    }
}
