//! Lenient decoding of API envelopes and output files
//!
//! Upstream payloads name the same logical field differently depending on the
//! endpoint and API version. Each logical field gets one [`FieldAliases`]
//! list of JSON pointers, tried in order.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Ordered JSON pointer candidates for one logical field
#[derive(Debug, Clone, Copy)]
pub struct FieldAliases {
    pub name: &'static str,
    pub pointers: &'static [&'static str],
}

impl FieldAliases {
    /// First present, non-null value among the aliases
    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.pointers
            .iter()
            .filter_map(|p| value.pointer(p))
            .find(|v| !v.is_null())
    }

    pub fn lookup_str<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.lookup(value).and_then(Value::as_str)
    }

    /// Integer lookup that also accepts numeric strings
    pub fn lookup_u64(&self, value: &Value) -> Option<u64> {
        match self.lookup(value)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Records of one page or output document
pub const RESULTS: FieldAliases = FieldAliases {
    name: "results",
    pointers: &["/page", "/results", "/matches", "/data"],
};

/// Page count announced by the first page
pub const TOTAL_PAGES: FieldAliases = FieldAliases {
    name: "total_pages",
    pointers: &["/total_pages", "/totalPages", "/meta/total_pages", "/pagination/total_pages"],
};

/// Where an IPv4 address lives inside a host record
pub const IP_FIELDS: FieldAliases = FieldAliases {
    name: "ip",
    pointers: &["/ip", "/ip_str", "/host/ip", "/address", "/ipv4"],
};

/// Original unit key stored in an output document
pub const UNIT_ID: FieldAliases = FieldAliases {
    name: "unit_id",
    pointers: &["/key", "/domain", "/ip", "/query"],
};

/// CVE identifier inside an NVD item or cached record
pub const CVE_ID: FieldAliases = FieldAliases {
    name: "cve_id",
    pointers: &[
        "/cve_id",
        "/cveId",
        "/cve/id",
        "/vulnerabilities/0/cve/id",
        "/nvd/vulnerabilities/0/cve/id",
    ],
};

/// Timestamp used for freshness precedence
pub const FETCHED_AT: FieldAliases = FieldAliases {
    name: "fetched_at",
    pointers: &["/fetched_at", "/exported_at", "/meta/fetched_at"],
};

/// Array of records in a document, or an empty slice
pub fn results_of(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        other => RESULTS
            .lookup(other)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
    }
}

/// Total page count from a first-page envelope, defaulting to 1
pub fn total_pages_of(value: &Value) -> u32 {
    TOTAL_PAGES
        .lookup_u64(value)
        .map(|n| n.clamp(1, u32::MAX as u64) as u32)
        .unwrap_or(1)
}

static IPV4_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid ipv4 regex"));

/// Canonical dotted quad, rejecting out-of-range octets and leading zeros
pub fn normalize_ipv4(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let addr: Ipv4Addr = trimmed.parse().ok()?;
    Some(addr.to_string())
}

/// All distinct IPv4 addresses in a record: alias fields first, then any
/// dotted quad found in string values.
pub fn extract_ipv4s(record: &Value) -> BTreeSet<String> {
    let mut found = BTreeSet::new();

    if let Some(ip) = IP_FIELDS.lookup_str(record).and_then(normalize_ipv4) {
        found.insert(ip);
    }

    collect_ipv4s(record, &mut found);
    found
}

fn collect_ipv4s(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for m in IPV4_CANDIDATE.find_iter(s) {
                if let Some(ip) = normalize_ipv4(m.as_str()) {
                    found.insert(ip);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ipv4s(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_ipv4s(v, found)),
        _ => {}
    }
}

/// Format a document was successfully read as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    JsonLines,
}

/// Outcome of the ordered parser attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedDocument {
    /// JSONL documents are returned as an array of their lines
    Parsed(DocumentFormat, Value),
    /// One error message per attempted format, in attempt order
    Unparseable(Vec<String>),
}

impl ParsedDocument {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ParsedDocument::Parsed(_, value) => Some(value),
            ParsedDocument::Unparseable(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            ParsedDocument::Parsed(_, value) => Some(value),
            ParsedDocument::Unparseable(_) => None,
        }
    }
}

/// Try whole-document JSON, then JSON Lines
pub fn parse_document(text: &str) -> ParsedDocument {
    let text = text.trim_start_matches('\u{feff}');
    let mut errors = Vec::new();

    match serde_json::from_str::<Value>(text) {
        Ok(value) => return ParsedDocument::Parsed(DocumentFormat::Json, value),
        Err(e) => errors.push(format!("json: {}", e)),
    }

    match parse_json_lines(text) {
        Ok(lines) => return ParsedDocument::Parsed(DocumentFormat::JsonLines, Value::Array(lines)),
        Err(e) => errors.push(format!("jsonl: {}", e)),
    }

    ParsedDocument::Unparseable(errors)
}

fn parse_json_lines(text: &str) -> Result<Vec<Value>, String> {
    let mut lines = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = serde_json::from_str(line).map_err(|e| format!("line {}: {}", idx + 1, e))?;
        lines.push(value);
    }
    if lines.is_empty() {
        return Err("no records".to_string());
    }
    Ok(lines)
}

/// Read a file and run the parser attempts; IO errors count as unparseable
pub fn read_document(path: &Path) -> ParsedDocument {
    match fs::read_to_string(path) {
        Ok(text) => parse_document(&text),
        Err(e) => ParsedDocument::Unparseable(vec![format!("read {}: {}", path.display(), e)]),
    }
}
