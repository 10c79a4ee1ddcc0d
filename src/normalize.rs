//! Payload normalization.
//!
//! Upstreams hand back one of two shapes: a canonical Clash YAML document,
//! or a bundle of `ss://` share links (sometimes base64-wrapped as a whole).
//! Both are turned into the same canonical output: a Clash document with a
//! synthesized group set and the AI routing overlay, plus the typed node
//! list extracted from it. Malformed lines and documents degrade silently —
//! nothing in here aborts a refresh cycle.

use anyhow::{Context, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use indexmap::IndexMap;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::model::{ClashConfig, ProxyNode};

const PROBE_URL: &str = "http://www.gstatic.com/generate_204";
const PROBE_INTERVAL: u64 = 300;
const PROBE_TOLERANCE: u64 = 50;

const GROUP_AUTO: &str = "自动选择";
const GROUP_FALLBACK: &str = "故障转移";
const GROUP_ALL: &str = "全部节点";

const OVERLAY_GROUP: &str = "AI加速";
const OVERLAY_DOMAINS: &[&str] = &[
    "openai.com",
    "chatgpt.com",
    "oaistatic.com",
    "oaiusercontent.com",
    "anthropic.com",
    "claude.ai",
    "gemini.google.com",
    "perplexity.ai",
];

// Region codes are matched case-sensitively: "us" would otherwise hit the
// middle of words like "business".
const REGION_CODES: &[&str] = &["US", "JP", "SG", "TW"];
const REGION_WORDS: &[&str] = &[
    "美国",
    "united states",
    "日本",
    "japan",
    "新加坡",
    "singapore",
    "台湾",
    "taiwan",
];

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
const COMPONENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// What a fetched payload turned out to be.
#[derive(Debug)]
pub enum Payload {
    /// Already a Clash document with `proxies` or `proxy-groups`.
    Canonical(ClashConfig),
    /// Share-link text, base64 bundle already unwrapped.
    ShareLinks(String),
}

/// Canonical output of a normalization pass.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// Re-serialized canonical Clash YAML, overlay applied.
    pub text: String,
    /// Typed nodes extracted from (or parsed into) the document.
    pub nodes: Vec<ProxyNode>,
}

/// Normalize a fetched payload into canonical Clash YAML plus its node list.
pub fn normalize(payload: &str) -> Result<Normalized> {
    let (mut config, nodes) = match classify(payload) {
        Payload::Canonical(config) => {
            let nodes = nodes_from_config(&config);
            (config, nodes)
        }
        Payload::ShareLinks(text) => {
            let nodes = parse_share_lines(&text);
            if nodes.is_empty() {
                debug!("payload yielded no parseable share links");
            }
            let config = synthesize_from_nodes(&nodes)?;
            (config, nodes)
        }
    };
    apply_routing_overlay(&mut config);
    let text = config.to_yaml_string()?;
    Ok(Normalized { text, nodes })
}

/// Decide which shape a payload is.
///
/// A YAML mapping that carries `proxies` or `proxy-groups` is canonical.
/// Everything else — share-link text, base64 bundles, or documents too
/// malformed for the typed parse — goes down the share-link path (which
/// yields an empty node list when nothing matches).
pub fn classify(payload: &str) -> Payload {
    if let Ok(Value::Mapping(doc)) = serde_yaml::from_str::<Value>(payload) {
        let has_core = doc.get(&Value::from("proxies")).is_some()
            || doc.get(&Value::from("proxy-groups")).is_some();
        if has_core {
            if let Ok(config) = ClashConfig::from_yaml_str(payload) {
                return Payload::Canonical(config);
            }
            debug!("document has proxy keys but failed the typed parse; treating as text");
        }
    }
    Payload::ShareLinks(unwrap_bundle(payload))
}

/// Parse every `ss://` line in a text block; lines that don't fit the
/// grammar are dropped.
pub fn parse_share_lines(text: &str) -> Vec<ProxyNode> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("ss://"))
        .filter_map(parse_ss_link)
        .collect()
}

/// Parse one `ss://` share link.
///
/// Both wire forms are accepted: plain `cipher:password@host:port` and the
/// legacy form with that whole body base64-encoded. The fragment names the
/// node (percent-decoded, falling back to the host), and a `plugin` query
/// parameter is carried through.
pub fn parse_ss_link(line: &str) -> Option<ProxyNode> {
    let rest = line.trim().strip_prefix("ss://")?;

    let (rest, fragment) = match rest.split_once('#') {
        Some((body, frag)) => (body, Some(frag)),
        None => (rest, None),
    };
    let (body, query) = match rest.split_once('?') {
        Some((body, query)) => (body, Some(query)),
        None => (rest, None),
    };

    let decoded;
    let body = if body.contains('@') {
        body
    } else {
        decoded = decode_loose_base64(body)?;
        decoded.as_str()
    };

    // First `@` splits credentials from endpoint; first `:` splits cipher
    // from password (passwords may contain colons); last `:` splits host
    // from port (hosts may contain colons).
    let (auth, endpoint) = body.split_once('@')?;
    let (cipher, password) = auth.split_once(':')?;
    let (host, port_text) = endpoint.rsplit_once(':')?;
    if host.is_empty() || cipher.is_empty() {
        return None;
    }
    let port = port_text.parse::<u16>().unwrap_or(0);

    let name = fragment
        .map(percent_decode_lossy)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| host.to_string());
    let plugin = query.and_then(plugin_param);

    Some(ProxyNode {
        name,
        proxy_type: "ss".to_string(),
        server: host.to_string(),
        port,
        cipher: cipher.to_string(),
        password: password.to_string(),
        udp: true,
        plugin,
    })
}

/// Build the canonical document for a set of parsed nodes: the three stock
/// groups plus a terminal MATCH rule.
pub fn synthesize_from_nodes(nodes: &[ProxyNode]) -> Result<ClashConfig> {
    let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    let proxies = nodes
        .iter()
        .map(|n| serde_yaml::to_value(n).context("failed to convert node to YAML"))
        .collect::<Result<Vec<_>>>()?;

    let proxy_groups = vec![
        probe_group(GROUP_AUTO, "url-test", Some(PROBE_TOLERANCE), &names),
        probe_group(GROUP_FALLBACK, "fallback", None, &names),
        select_group(GROUP_ALL, &names),
    ];
    let rules = vec![format!("MATCH,{GROUP_ALL}")];

    Ok(ClashConfig {
        extra: IndexMap::new(),
        proxies,
        proxy_groups,
        rules,
    })
}

/// Prepend the AI routing overlay: a url-test group pooling the
/// region-matched nodes (all nodes when none match) and one
/// `DOMAIN-SUFFIX` rule per accelerated domain, ahead of existing rules.
///
/// Applying the overlay to a document that already carries it is a no-op.
pub fn apply_routing_overlay(config: &mut ClashConfig) {
    let already = config.proxy_groups.iter().any(|g| {
        g.as_mapping()
            .and_then(|m| m.get(&Value::from("name")))
            .and_then(Value::as_str)
            == Some(OVERLAY_GROUP)
    });
    if already {
        return;
    }

    let names = config.proxy_names();
    let regional: Vec<String> = names
        .iter()
        .filter(|name| region_match(name))
        .cloned()
        .collect();
    let members = if regional.is_empty() { names } else { regional };

    config.proxy_groups.insert(
        0,
        probe_group(OVERLAY_GROUP, "url-test", Some(PROBE_TOLERANCE), &members),
    );

    let mut rules: Vec<String> = OVERLAY_DOMAINS
        .iter()
        .map(|domain| format!("DOMAIN-SUFFIX,{domain},{OVERLAY_GROUP}"))
        .collect();
    rules.extend(config.rules.drain(..));
    config.rules = rules;
}

/// Extract the typed `ss` nodes from a canonical document. Proxies of other
/// protocols (or with missing fields) are skipped.
pub fn nodes_from_config(config: &ClashConfig) -> Vec<ProxyNode> {
    config
        .proxies
        .iter()
        .filter_map(|p| serde_yaml::from_value::<ProxyNode>(p.clone()).ok())
        .collect()
}

/// Serialize a node back into an `ss://` link for Shadowrocket-style
/// clients. Nodes that are not `ss` or are missing endpoint material yield
/// `None`.
pub fn node_to_ss_link(node: &ProxyNode) -> Option<String> {
    if node.proxy_type != "ss" {
        return None;
    }
    if node.server.is_empty() || node.port == 0 || node.cipher.is_empty() || node.password.is_empty()
    {
        return None;
    }

    let auth = STANDARD.encode(format!(
        "{}:{}@{}:{}",
        node.cipher, node.password, node.server, node.port
    ));
    let mut link = format!("ss://{auth}");
    if let Some(plugin) = node.plugin.as_deref().filter(|p| !p.is_empty()) {
        link.push_str("?plugin=");
        link.push_str(&encode_component(plugin));
    }
    link.push('#');
    link.push_str(&encode_component(&node.name));
    Some(link)
}

pub fn links_from_nodes(nodes: &[ProxyNode]) -> Vec<String> {
    nodes.iter().filter_map(node_to_ss_link).collect()
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Unwrap a whole-payload base64 bundle. Text that already contains share
/// links, or that doesn't decode to any, is returned as-is.
fn unwrap_bundle(payload: &str) -> String {
    if contains_share_line(payload) {
        return payload.to_string();
    }
    decode_loose_base64(payload)
        .filter(|decoded| contains_share_line(decoded))
        .unwrap_or_else(|| payload.to_string())
}

fn contains_share_line(text: &str) -> bool {
    text.lines().any(|l| l.trim_start().starts_with("ss://"))
}

/// Forgiving base64: whitespace stripped, padding repaired, both the
/// standard and URL-safe alphabets accepted.
fn decode_loose_base64(text: &str) -> Option<String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let bytes = STANDARD
        .decode(pad_base64(&compact))
        .ok()
        .or_else(|| URL_SAFE_NO_PAD.decode(compact.trim_end_matches('=')).ok())?;
    String::from_utf8(bytes).ok()
}

fn pad_base64(text: &str) -> String {
    let mut padded = text.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    padded
}

fn percent_decode_lossy(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().to_string()
}

fn encode_component(text: &str) -> String {
    utf8_percent_encode(text, COMPONENT_SET).to_string()
}

fn plugin_param(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key.eq_ignore_ascii_case("plugin") && !value.is_empty() {
            Some(percent_decode_lossy(value))
        } else {
            None
        }
    })
}

fn region_match(name: &str) -> bool {
    if REGION_CODES.iter().any(|code| name.contains(code)) {
        return true;
    }
    let lower = name.to_lowercase();
    REGION_WORDS.iter().any(|word| lower.contains(word))
}

fn probe_group(name: &str, group_type: &str, tolerance: Option<u64>, members: &[String]) -> Value {
    let mut group = Mapping::new();
    insert_string(&mut group, "name", name);
    insert_string(&mut group, "type", group_type);
    insert_string(&mut group, "url", PROBE_URL);
    insert_u64(&mut group, "interval", PROBE_INTERVAL);
    if let Some(tolerance) = tolerance {
        insert_u64(&mut group, "tolerance", tolerance);
    }
    insert_members(&mut group, members);
    Value::Mapping(group)
}

fn select_group(name: &str, members: &[String]) -> Value {
    let mut group = Mapping::new();
    insert_string(&mut group, "name", name);
    insert_string(&mut group, "type", "select");
    insert_members(&mut group, members);
    Value::Mapping(group)
}

fn insert_string(map: &mut Mapping, key: &str, value: &str) {
    map.insert(Value::from(key), Value::from(value));
}

fn insert_u64(map: &mut Mapping, key: &str, value: u64) {
    map.insert(Value::from(key), Value::from(value));
}

fn insert_members(map: &mut Mapping, members: &[String]) {
    let list: Vec<Value> = members.iter().map(|m| Value::from(m.as_str())).collect();
    map.insert(Value::from("proxies"), Value::Sequence(list));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_name(group: &Value) -> Option<&str> {
        group
            .as_mapping()
            .and_then(|m| m.get(&Value::from("name")))
            .and_then(Value::as_str)
    }

    fn group_members(group: &Value) -> Vec<String> {
        group
            .as_mapping()
            .and_then(|m| m.get(&Value::from("proxies")))
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn parses_base64_share_link() {
        // "aes-256-gcm:pass@asia.1.1.1:8443"
        let node = parse_ss_link("ss://YWVzLTI1Ni1nY206cGFzc0Bhc2lhLjEuMS4xOjg0NDM=#NodeA").unwrap();
        assert_eq!(node.name, "NodeA");
        assert_eq!(node.proxy_type, "ss");
        assert_eq!(node.server, "asia.1.1.1");
        assert_eq!(node.port, 8443);
        assert_eq!(node.cipher, "aes-256-gcm");
        assert_eq!(node.password, "pass");
        assert!(node.udp);
        assert_eq!(node.plugin, None);
    }

    #[test]
    fn parses_plain_link_with_plugin_and_encoded_name() {
        let node = parse_ss_link(
            "ss://chacha20-ietf-poly1305:secret@host.example.com:443?plugin=obfs-local%3Bobfs%3Dhttp#%E9%A6%99%E6%B8%AF%2001",
        )
        .unwrap();
        assert_eq!(node.name, "香港 01");
        assert_eq!(node.server, "host.example.com");
        assert_eq!(node.port, 443);
        assert_eq!(node.cipher, "chacha20-ietf-poly1305");
        assert_eq!(node.password, "secret");
        assert_eq!(node.plugin.as_deref(), Some("obfs-local;obfs=http"));
    }

    #[test]
    fn password_keeps_embedded_colons() {
        let node = parse_ss_link("ss://aes-128-gcm:pa:ss:word@h.example.com:8080#X").unwrap();
        assert_eq!(node.cipher, "aes-128-gcm");
        assert_eq!(node.password, "pa:ss:word");
    }

    #[test]
    fn unparseable_port_becomes_zero() {
        let node = parse_ss_link("ss://aes-128-gcm:pw@h.example.com:notaport#X").unwrap();
        assert_eq!(node.port, 0);
        // and such a node is skipped on the way back out
        assert_eq!(node_to_ss_link(&node), None);
    }

    #[test]
    fn name_falls_back_to_host() {
        let node = parse_ss_link("ss://aes-128-gcm:pw@h.example.com:8080").unwrap();
        assert_eq!(node.name, "h.example.com");
    }

    #[test]
    fn lines_that_do_not_fit_are_dropped() {
        let text = "\n\
            ss://YWVzLTI1Ni1nY206cGFzc0Bhc2lhLjEuMS4xOjg0NDM=#NodeA\n\
            vmess://eyJ2IjoiMiJ9\n\
            ss://bm90LWEtdmFsaWQtYm9keQ==\n\
            \n\
            not a link at all\n";
        let nodes = parse_share_lines(text);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "NodeA");
    }

    #[test]
    fn classify_detects_canonical_documents() {
        let doc = "proxies:\n  - { name: a, type: ss, server: h, port: 1, cipher: c, password: p }\n";
        match classify(doc) {
            Payload::Canonical(config) => assert_eq!(config.proxies.len(), 1),
            other => panic!("expected canonical, got {other:?}"),
        }

        match classify("ss://YWVzLTI1Ni1nY206cGFzc0Bhc2lhLjEuMS4xOjg0NDM=#NodeA") {
            Payload::ShareLinks(text) => assert!(text.starts_with("ss://")),
            other => panic!("expected share links, got {other:?}"),
        }
    }

    #[test]
    fn whole_payload_base64_bundle_is_unwrapped() {
        let bundle = "ss://YWVzLTI1Ni1nY206cGFzc0Bhc2lhLjEuMS4xOjg0NDM=#NodeA\nss://YWVzLTEyOC1nY206cHdAZXUuMi4yLjI6NDQz#NodeB\n";
        let encoded = STANDARD.encode(bundle);
        match classify(&encoded) {
            Payload::ShareLinks(text) => {
                let nodes = parse_share_lines(&text);
                assert_eq!(nodes.len(), 2);
                assert_eq!(nodes[1].server, "eu.2.2.2");
                assert_eq!(nodes[1].port, 443);
            }
            other => panic!("expected share links, got {other:?}"),
        }
    }

    #[test]
    fn synthesized_document_has_stock_groups_and_match_rule() {
        let nodes = parse_share_lines(
            "ss://YWVzLTI1Ni1nY206cGFzc0Bhc2lhLjEuMS4xOjg0NDM=#NodeA\nss://YWVzLTEyOC1nY206cHdAZXUuMi4yLjI6NDQz#NodeB",
        );
        let config = synthesize_from_nodes(&nodes).unwrap();

        assert_eq!(config.proxies.len(), 2);
        let names: Vec<_> = config.proxy_groups.iter().filter_map(group_name).collect();
        assert_eq!(names, vec!["自动选择", "故障转移", "全部节点"]);
        assert_eq!(group_members(&config.proxy_groups[0]), vec!["NodeA", "NodeB"]);
        assert_eq!(config.rules, vec!["MATCH,全部节点".to_string()]);

        let auto = config.proxy_groups[0].as_mapping().unwrap();
        assert_eq!(
            auto.get(&Value::from("url")).and_then(Value::as_str),
            Some(PROBE_URL)
        );
        assert_eq!(
            auto.get(&Value::from("interval")).and_then(Value::as_u64),
            Some(PROBE_INTERVAL)
        );
        assert_eq!(
            auto.get(&Value::from("tolerance")).and_then(Value::as_u64),
            Some(PROBE_TOLERANCE)
        );
    }

    #[test]
    fn overlay_prefers_region_matched_nodes() {
        let nodes = vec![
            node("美国 US-01"),
            node("香港 HK-01"),
            node("日本 JP-02"),
        ];
        let mut config = synthesize_from_nodes(&nodes).unwrap();
        apply_routing_overlay(&mut config);

        assert_eq!(group_name(&config.proxy_groups[0]), Some("AI加速"));
        assert_eq!(
            group_members(&config.proxy_groups[0]),
            vec!["美国 US-01", "日本 JP-02"]
        );
        assert_eq!(config.rules.len(), 9);
        assert_eq!(config.rules[0], "DOMAIN-SUFFIX,openai.com,AI加速");
        assert_eq!(config.rules[8], "MATCH,全部节点");
    }

    #[test]
    fn overlay_pools_everything_when_no_region_matches() {
        let nodes = vec![node("香港 HK-01"), node("德国 DE-01")];
        let mut config = synthesize_from_nodes(&nodes).unwrap();
        apply_routing_overlay(&mut config);
        assert_eq!(
            group_members(&config.proxy_groups[0]),
            vec!["香港 HK-01", "德国 DE-01"]
        );
    }

    #[test]
    fn overlay_is_not_applied_twice() {
        let nodes = vec![node("美国 US-01")];
        let mut config = synthesize_from_nodes(&nodes).unwrap();
        apply_routing_overlay(&mut config);
        apply_routing_overlay(&mut config);

        let overlays = config
            .proxy_groups
            .iter()
            .filter(|g| group_name(g) == Some("AI加速"))
            .count();
        assert_eq!(overlays, 1);
        assert_eq!(config.rules.len(), 9);
    }

    #[test]
    fn normalize_share_bundle_end_to_end() {
        let result = normalize(
            "ss://YWVzLTI1Ni1nY206cGFzc0Bhc2lhLjEuMS4xOjg0NDM=#NodeA\nss://YWVzLTEyOC1nY206cHdAZXUuMi4yLjI6NDQz#NodeB",
        )
        .unwrap();
        assert_eq!(result.nodes.len(), 2);

        let config = ClashConfig::from_yaml_str(&result.text).unwrap();
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.proxy_groups.len(), 4);
        assert_eq!(group_name(&config.proxy_groups[0]), Some("AI加速"));
    }

    #[test]
    fn normalize_canonical_preserves_upstream_keys() {
        let doc = r#"
port: 7890
mode: rule
proxies:
  - { name: "美国 US-01", type: ss, server: h.example.com, port: 443, cipher: aes-256-gcm, password: pw }
proxy-groups: []
rules:
  - "GEOIP,CN,DIRECT"
"#;
        let result = normalize(doc).unwrap();
        assert!(result.text.contains("port: 7890"));
        assert!(result.text.contains("mode: rule"));
        assert_eq!(result.nodes.len(), 1);

        let config = ClashConfig::from_yaml_str(&result.text).unwrap();
        assert_eq!(group_name(&config.proxy_groups[0]), Some("AI加速"));
        assert_eq!(config.rules[8], "GEOIP,CN,DIRECT");
    }

    #[test]
    fn share_link_roundtrip() {
        let original = ProxyNode {
            name: "美国 US-01".into(),
            proxy_type: "ss".into(),
            server: "h.example.com".into(),
            port: 8443,
            cipher: "aes-256-gcm".into(),
            password: "s3cret".into(),
            udp: true,
            plugin: Some("obfs-local;obfs=http".into()),
        };
        let link = node_to_ss_link(&original).unwrap();
        let parsed = parse_ss_link(&link).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn non_ss_nodes_are_not_serialized() {
        let node = ProxyNode {
            name: "vm".into(),
            proxy_type: "vmess".into(),
            server: "h".into(),
            port: 443,
            cipher: "auto".into(),
            password: "id".into(),
            udp: false,
            plugin: None,
        };
        assert_eq!(node_to_ss_link(&node), None);
    }

    #[test]
    fn region_matching_is_case_aware() {
        assert!(region_match("美国 洛杉矶 01"));
        assert!(region_match("JP Tokyo"));
        assert!(region_match("singapore-premium"));
        assert!(!region_match("Russia 01"));
        assert!(!region_match("business line"));
    }

    fn node(name: &str) -> ProxyNode {
        ProxyNode {
            name: name.into(),
            proxy_type: "ss".into(),
            server: "h.example.com".into(),
            port: 443,
            cipher: "aes-256-gcm".into(),
            password: "pw".into(),
            udp: true,
            plugin: None,
        }
    }
}
