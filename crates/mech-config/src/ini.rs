//! Configuration file format (spec §6.2): plain text INI, `=` separator,
//! `#` comment, `[namespace]` sections. Keys are known per namespace
//! (declared by the user module); unknown namespaces and unknown keys
//! inside a known namespace are fatal, with line number.
//!
//! No off-the-shelf INI crate is used: none appears anywhere in this
//! corpus, and the dynamic-namespace / fatal-with-line-number semantics
//! don't map onto a static `#[derive(Deserialize)]` struct the way
//! `core-config`'s TOML loading does.

use std::fs;
use std::path::Path;

use mech_types::{MechError, CONFIG_MAX_LINE_LENGTH};

/// One `[namespace]` section: an ordered, unique-key name -> value table
/// (spec §9 "Generic collections").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigNamespace {
    pub name: String,
    options: Vec<(String, String)>,
}

impl ConfigNamespace {
    pub fn new(name: impl Into<String>, options: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Serializes parsed namespaces for the bootstrap `TAG_STANDBY` broadcast
/// (spec §4.10 "carries config options during bootstrap"): only the
/// master ever calls [`load_file`], so every worker needs this wire form
/// to receive the same resolved option table read-only (spec §5 "read-only
/// on workers for the remainder of the run").
pub fn encode_namespaces(namespaces: &[ConfigNamespace]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(namespaces.len() as u32).to_le_bytes());
    for ns in namespaces {
        write_str(&mut out, &ns.name);
        out.extend_from_slice(&(ns.options.len() as u32).to_le_bytes());
        for (k, v) in &ns.options {
            write_str(&mut out, k);
            write_str(&mut out, v);
        }
    }
    out
}

/// Inverse of [`encode_namespaces`].
pub fn decode_namespaces(bytes: &[u8]) -> Result<Vec<ConfigNamespace>, MechError> {
    let mut cursor = 0usize;
    let ns_count = read_u32(bytes, &mut cursor)?;
    let mut namespaces = Vec::with_capacity(ns_count as usize);
    for _ in 0..ns_count {
        let name = read_str(bytes, &mut cursor)?;
        let option_count = read_u32(bytes, &mut cursor)?;
        let mut options = Vec::with_capacity(option_count as usize);
        for _ in 0..option_count {
            let key = read_str(bytes, &mut cursor)?;
            let value = read_str(bytes, &mut cursor)?;
            options.push((key, value));
        }
        namespaces.push(ConfigNamespace::new(name, options));
    }
    Ok(namespaces)
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, MechError> {
    let end = *cursor + 4;
    let field = bytes
        .get(*cursor..end)
        .ok_or_else(|| MechError::Transport("config broadcast truncated reading length".into()))?;
    *cursor = end;
    Ok(u32::from_le_bytes(field.try_into().unwrap()))
}

fn read_str(bytes: &[u8], cursor: &mut usize) -> Result<String, MechError> {
    let len = read_u32(bytes, cursor)? as usize;
    let end = *cursor + len;
    let field = bytes
        .get(*cursor..end)
        .ok_or_else(|| MechError::Transport("config broadcast truncated reading string".into()))?;
    *cursor = end;
    String::from_utf8(field.to_vec())
        .map_err(|e| MechError::Transport(format!("config broadcast: invalid utf8: {e}")))
}

/// `(namespace, known keys)` — declared by the user module's `Init`/`Setup`
/// callbacks (spec §6.3), passed in by the caller so this parser stays
/// agnostic of any particular module's option set.
pub type KnownNamespaces<'a> = &'a [(&'a str, &'a [&'a str])];

/// Parses `text` against `known`, producing one [`ConfigNamespace`] per
/// declared `[section]`, in file order. Fails with [`MechError::Setup`]
/// (spec §7 "Setup") carrying a 1-based line number on any unknown
/// namespace, unknown key, malformed line, or over-length line.
pub fn parse(text: &str, known: KnownNamespaces) -> Result<Vec<ConfigNamespace>, MechError> {
    let mut namespaces = Vec::new();
    let mut current: Option<ConfigNamespace> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if raw_line.len() > CONFIG_MAX_LINE_LENGTH {
            return Err(MechError::Setup(format!(
                "line {line_no}: exceeds CONFIG_MAX_LINE_LENGTH ({CONFIG_MAX_LINE_LENGTH})"
            )));
        }
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(ns) = current.take() {
                namespaces.push(ns);
            }
            let name = section.trim().to_string();
            if !known.iter().any(|(n, _)| *n == name) {
                return Err(MechError::Setup(format!(
                    "line {line_no}: unknown config namespace '{name}'"
                )));
            }
            current = Some(ConfigNamespace {
                name,
                options: Vec::new(),
            });
            continue;
        }

        let ns = current.as_mut().ok_or_else(|| {
            MechError::Setup(format!(
                "line {line_no}: key=value outside of any [namespace]"
            ))
        })?;
        let (key, value) = line.split_once('=').ok_or_else(|| {
            MechError::Setup(format!("line {line_no}: expected 'key = value'"))
        })?;
        let key = key.trim().to_string();
        let value = value.trim().to_string();

        let allowed = known
            .iter()
            .find(|(n, _)| *n == ns.name)
            .map(|(_, keys)| *keys)
            .unwrap_or(&[]);
        if !allowed.contains(&key.as_str()) {
            return Err(MechError::Setup(format!(
                "line {line_no}: unknown key '{key}' in namespace '{}'",
                ns.name
            )));
        }

        if let Some(slot) = ns.options.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            ns.options.push((key, value));
        }
    }
    if let Some(ns) = current.take() {
        namespaces.push(ns);
    }
    Ok(namespaces)
}

/// Loads and parses a config file (spec §6.1 `--config PATH`). A missing
/// file is fatal only when `path` was explicitly passed — modeled by the
/// caller only invoking this when `Args::config` is `Some`.
pub fn load_file(path: &Path, known: KnownNamespaces) -> Result<Vec<ConfigNamespace>, MechError> {
    let text = fs::read_to_string(path)
        .map_err(|e| MechError::Setup(format!("reading {}: {e}", path.display())))?;
    parse(&text, known)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &[(&str, &[&str])] = &[("board", &["xres", "yres", "zres"])];

    #[test]
    fn parses_known_namespace_and_keys() {
        let text = "# comment\n[board]\nxres = 8\nyres=8 # inline\n";
        let namespaces = parse(text, KNOWN).unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].name, "board");
        assert_eq!(namespaces[0].get("xres"), Some("8"));
        assert_eq!(namespaces[0].get("yres"), Some("8"));
    }

    #[test]
    fn unknown_namespace_is_fatal_with_line_number() {
        let text = "[bogus]\nxres=1\n";
        let err = parse(text, KNOWN).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 1"));
        assert!(msg.contains("bogus"));
    }

    #[test]
    fn unknown_key_is_fatal_with_line_number() {
        let text = "[board]\nbogus=1\n";
        let err = parse(text, KNOWN).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"));
        assert!(msg.contains("bogus"));
    }

    #[test]
    fn later_duplicate_key_overwrites_earlier_value() {
        let text = "[board]\nxres=1\nxres=2\n";
        let namespaces = parse(text, KNOWN).unwrap();
        assert_eq!(namespaces[0].get("xres"), Some("2"));
    }

    #[test]
    fn key_outside_namespace_is_rejected() {
        let text = "xres=1\n";
        assert!(parse(text, KNOWN).is_err());
    }

    #[test]
    fn encode_decode_round_trips_namespaces() {
        let namespaces = parse("[board]\nxres=8\nyres=8\n", KNOWN).unwrap();
        let wire = encode_namespaces(&namespaces);
        let decoded = decode_namespaces(&wire).unwrap();
        assert_eq!(decoded, namespaces);
    }

    #[test]
    fn encode_decode_round_trips_empty_namespaces() {
        let wire = encode_namespaces(&[]);
        let decoded = decode_namespaces(&wire).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_wire() {
        let namespaces = parse("[board]\nxres=8\n", KNOWN).unwrap();
        let mut wire = encode_namespaces(&namespaces);
        wire.truncate(wire.len() - 1);
        assert!(decode_namespaces(&wire).is_err());
    }
}
