// TextFSM template engine with auto-selection
//
// Holds a read-only store of template sources keyed by command signature
// (e.g. `cisco_ios_show_version`) and picks the best parse for a blob of raw
// CLI text by scoring every candidate. Templates compile lazily; a source
// that fails to compile is reported once and excluded from candidate sets
// for the process lifetime.
//
// The dialect implemented here is the TextFSM subset the shipped template
// set needs: Value options Filldown/Required/List/Key, ${NAME} substitution,
// state sections, rule actions Next/Continue x Record/NoRecord/Clear/
// Clearall, state transitions, and Error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{DiscoveryError, ErrorContext, Result};

/// Score at or below which a parse is not considered trustworthy.
/// Callers compare with `score > TRUSTED_SCORE` unless they override.
pub const TRUSTED_SCORE: u32 = 10;

/// One parsed field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Single(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Single(s) => s.as_str(),
            FieldValue::List(items) => items.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }

    fn occurrences(&self) -> u32 {
        match self {
            FieldValue::Single(s) => u32::from(!s.is_empty()),
            FieldValue::List(items) => items.iter().filter(|s| !s.is_empty()).count() as u32,
        }
    }
}

/// One record produced by a template run
pub type Record = BTreeMap<String, FieldValue>;

/// Fetch a single-valued field, empty string when absent
pub fn field<'a>(record: &'a Record, name: &str) -> &'a str {
    record.get(name).map(|v| v.as_str()).unwrap_or("")
}

/// Fetch a list-valued field, empty when absent
pub fn field_list(record: &Record, name: &str) -> Vec<String> {
    match record.get(name) {
        Some(FieldValue::List(items)) => {
            items.iter().filter(|s| !s.is_empty()).cloned().collect()
        }
        Some(FieldValue::Single(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Winning parse returned by [`TemplateEngine::find_best_template`]
#[derive(Debug, Clone)]
pub struct BestMatch {
    pub template: String,
    pub records: Vec<Record>,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineAction {
    Next,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecordAction {
    NoRecord,
    Record,
    Clear,
    Clearall,
}

#[derive(Debug)]
struct ValueDef {
    name: String,
    filldown: bool,
    required: bool,
    list: bool,
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    line_action: LineAction,
    record_action: RecordAction,
    new_state: Option<usize>,
    error: bool,
}

#[derive(Debug)]
struct Template {
    values: Vec<ValueDef>,
    states: Vec<Vec<Rule>>,
    start: usize,
    has_eof_state: bool,
}

#[derive(Debug, Clone)]
enum Slot {
    Single(String),
    List(Vec<String>),
}

impl Template {
    fn compile(name: &str, source: &str) -> Result<Template> {
        let malformed = |reason: &str| DiscoveryError::Template {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let mut values: Vec<ValueDef> = Vec::new();
        let mut patterns: HashMap<String, String> = HashMap::new();
        // (state name, raw rule lines)
        let mut raw_states: Vec<(String, Vec<String>)> = Vec::new();
        let mut in_header = true;

        for line in source.lines() {
            let trimmed_end = line.trim_end();
            if trimmed_end.trim_start().starts_with('#') {
                continue;
            }
            if in_header {
                if trimmed_end.trim().is_empty() {
                    continue;
                }
                if let Some(rest) = trimmed_end.strip_prefix("Value ") {
                    let (def, pattern) = parse_value_line(rest)
                        .ok_or_else(|| malformed("unparseable Value line"))?;
                    // Validate the value pattern stands alone as a group
                    Regex::new(&format!("(?P<{}>{})", def.name, pattern))
                        .map_err(|e| malformed(&format!("bad value regex: {}", e)))?;
                    patterns.insert(def.name.clone(), pattern);
                    values.push(def);
                    continue;
                }
                in_header = false;
            }
            if trimmed_end.trim().is_empty() {
                continue;
            }
            if !trimmed_end.starts_with(' ') && !trimmed_end.starts_with('\t') {
                raw_states.push((trimmed_end.trim().to_string(), Vec::new()));
            } else {
                let rule_line = trimmed_end.trim_start().to_string();
                if !rule_line.starts_with('^') {
                    return Err(malformed("rule does not start with '^'"));
                }
                raw_states
                    .last_mut()
                    .ok_or_else(|| malformed("rule outside any state"))?
                    .1
                    .push(rule_line);
            }
        }

        if values.is_empty() {
            return Err(malformed("no Value definitions"));
        }

        let state_index: HashMap<String, usize> = raw_states
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (n.clone(), i))
            .collect();
        let start = *state_index
            .get("Start")
            .ok_or_else(|| malformed("missing Start state"))?;
        let has_eof_state = state_index.contains_key("EOF");

        let mut states = Vec::with_capacity(raw_states.len());
        for (_, rule_lines) in &raw_states {
            let mut rules = Vec::with_capacity(rule_lines.len());
            for line in rule_lines {
                rules.push(parse_rule(line, &patterns, &state_index, &malformed)?);
            }
            states.push(rules);
        }

        Ok(Template {
            values,
            states,
            start,
            has_eof_state,
        })
    }

    /// Run the state machine over the text. Returns None when an Error
    /// action fires, which disqualifies the candidate for this text.
    fn run(&self, text: &str) -> Option<Vec<Record>> {
        let mut slots: Vec<Slot> = self
            .values
            .iter()
            .map(|v| {
                if v.list {
                    Slot::List(Vec::new())
                } else {
                    Slot::Single(String::new())
                }
            })
            .collect();
        let mut rows: Vec<Record> = Vec::new();
        let mut state = self.start;

        for line in text.lines() {
            let mut idx = 0;
            while idx < self.states[state].len() {
                let rule = &self.states[state][idx];
                let Some(caps) = rule.regex.captures(line) else {
                    idx += 1;
                    continue;
                };
                if rule.error {
                    return None;
                }
                for (vi, value) in self.values.iter().enumerate() {
                    if let Some(m) = caps.name(&value.name) {
                        match &mut slots[vi] {
                            Slot::Single(s) => *s = m.as_str().to_string(),
                            Slot::List(items) => items.push(m.as_str().to_string()),
                        }
                    }
                }
                match rule.record_action {
                    RecordAction::Record => self.emit(&mut rows, &mut slots),
                    RecordAction::Clear => self.reset(&mut slots, false),
                    RecordAction::Clearall => self.reset(&mut slots, true),
                    RecordAction::NoRecord => {}
                }
                if let Some(next) = rule.new_state {
                    state = next;
                }
                match rule.line_action {
                    LineAction::Next => break,
                    LineAction::Continue => idx += 1,
                }
            }
        }

        if !self.has_eof_state {
            self.emit(&mut rows, &mut slots);
        }
        Some(rows)
    }

    /// Emit the pending row when it carries at least one non-Filldown value
    /// and every Required value is set, then reset non-Filldown slots
    fn emit(&self, rows: &mut Vec<Record>, slots: &mut [Slot]) {
        let mut has_own_data = false;
        let mut required_ok = true;
        for (vi, value) in self.values.iter().enumerate() {
            let filled = match &slots[vi] {
                Slot::Single(s) => !s.is_empty(),
                Slot::List(items) => !items.is_empty(),
            };
            if filled && !value.filldown {
                has_own_data = true;
            }
            if value.required && !filled {
                required_ok = false;
            }
        }
        if has_own_data && required_ok {
            let mut record = Record::new();
            for (vi, value) in self.values.iter().enumerate() {
                let fv = match &slots[vi] {
                    Slot::Single(s) => FieldValue::Single(s.clone()),
                    Slot::List(items) => FieldValue::List(items.clone()),
                };
                record.insert(value.name.clone(), fv);
            }
            rows.push(record);
        }
        self.reset(slots, false);
    }

    fn reset(&self, slots: &mut [Slot], include_filldown: bool) {
        for (vi, value) in self.values.iter().enumerate() {
            if value.filldown && !include_filldown {
                continue;
            }
            match &mut slots[vi] {
                Slot::Single(s) => s.clear(),
                Slot::List(items) => items.clear(),
            }
        }
    }
}

/// Parse the remainder of a `Value` line: `[options] NAME (regex)`
fn parse_value_line(rest: &str) -> Option<(ValueDef, String)> {
    let paren = rest.find('(')?;
    let pattern = rest[paren..].trim();
    if !pattern.starts_with('(') || !pattern.ends_with(')') {
        return None;
    }
    let pattern = pattern[1..pattern.len() - 1].to_string();

    let head: Vec<&str> = rest[..paren].split_whitespace().collect();
    let (options, name) = match head.len() {
        1 => ("", head[0]),
        2 => (head[0], head[1]),
        _ => return None,
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let mut def = ValueDef {
        name: name.to_string(),
        filldown: false,
        required: false,
        list: false,
    };
    for opt in options.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "Filldown" => def.filldown = true,
            "Required" => def.required = true,
            "List" => def.list = true,
            // Key affects TextFSM table joins only; accepted and ignored
            "Key" => {}
            _ => return None,
        }
    }
    Some((def, pattern))
}

fn parse_rule(
    line: &str,
    patterns: &HashMap<String, String>,
    state_index: &HashMap<String, usize>,
    malformed: &dyn Fn(&str) -> DiscoveryError,
) -> Result<Rule> {
    let (pattern_part, action_part) = match line.find(" -> ") {
        Some(pos) => (&line[..pos], line[pos + 4..].trim()),
        None => (line, ""),
    };

    // ${NAME} -> named capture groups, then $$ -> end anchor
    let subst = Regex::new(r"\$\{(\w+)\}").unwrap();
    let mut unknown: Option<String> = None;
    let expanded = subst.replace_all(pattern_part, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match patterns.get(name) {
            Some(p) => format!("(?P<{}>{})", name, p),
            None => {
                unknown = Some(name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = unknown {
        return Err(malformed(&format!("unknown value '{}' in rule", name)));
    }
    let expanded = expanded.replace("$$", "$");
    let regex = Regex::new(&expanded)
        .map_err(|e| malformed(&format!("bad rule regex: {}", e)))?;

    let mut rule = Rule {
        regex,
        line_action: LineAction::Next,
        record_action: RecordAction::NoRecord,
        new_state: None,
        error: false,
    };

    if !action_part.is_empty() {
        let mut tokens = action_part.split_whitespace();
        let first = tokens.next().unwrap();
        if first == "Error" {
            rule.error = true;
            return Ok(rule);
        }
        let mut first_was_state = false;
        if first.contains('.') || is_action_token(first) {
            for comp in first.split('.') {
                match comp {
                    "Next" => rule.line_action = LineAction::Next,
                    "Continue" => rule.line_action = LineAction::Continue,
                    "Record" => rule.record_action = RecordAction::Record,
                    "NoRecord" => rule.record_action = RecordAction::NoRecord,
                    "Clear" => rule.record_action = RecordAction::Clear,
                    "Clearall" => rule.record_action = RecordAction::Clearall,
                    _ => return Err(malformed(&format!("unknown action '{}'", comp))),
                }
            }
        } else {
            first_was_state = true;
            rule.new_state = Some(
                *state_index
                    .get(first)
                    .ok_or_else(|| malformed(&format!("unknown state '{}'", first)))?,
            );
        }
        if let Some(target) = tokens.next() {
            if first_was_state {
                return Err(malformed("trailing token after state target"));
            }
            rule.new_state = Some(
                *state_index
                    .get(target)
                    .ok_or_else(|| malformed(&format!("unknown state '{}'", target)))?,
            );
        }
        if rule.line_action == LineAction::Continue && rule.new_state.is_some() {
            return Err(malformed("Continue cannot change state"));
        }
    }
    Ok(rule)
}

fn is_action_token(token: &str) -> bool {
    matches!(
        token,
        "Next" | "Continue" | "Record" | "NoRecord" | "Clear" | "Clearall"
    )
}

/// Template sources compiled into the binary
const EMBEDDED_TEMPLATES: &[(&str, &str)] = &[
    (
        "cisco_ios_show_version",
        include_str!("../../templates/cisco_ios_show_version.textfsm"),
    ),
    (
        "cisco_nxos_show_version",
        include_str!("../../templates/cisco_nxos_show_version.textfsm"),
    ),
    (
        "arista_eos_show_version",
        include_str!("../../templates/arista_eos_show_version.textfsm"),
    ),
    (
        "juniper_junos_show_version",
        include_str!("../../templates/juniper_junos_show_version.textfsm"),
    ),
    (
        "cisco_ios_show_cdp_neighbors_detail",
        include_str!("../../templates/cisco_ios_show_cdp_neighbors_detail.textfsm"),
    ),
    (
        "cisco_nxos_show_cdp_neighbors_detail",
        include_str!("../../templates/cisco_nxos_show_cdp_neighbors_detail.textfsm"),
    ),
    (
        "cisco_ios_show_lldp_neighbors_detail",
        include_str!("../../templates/cisco_ios_show_lldp_neighbors_detail.textfsm"),
    ),
    (
        "cisco_nxos_show_lldp_neighbors_detail",
        include_str!("../../templates/cisco_nxos_show_lldp_neighbors_detail.textfsm"),
    ),
    (
        "arista_eos_show_lldp_neighbors_detail",
        include_str!("../../templates/arista_eos_show_lldp_neighbors_detail.textfsm"),
    ),
    (
        "juniper_junos_show_lldp_neighbors_detail",
        include_str!("../../templates/juniper_junos_show_lldp_neighbors_detail.textfsm"),
    ),
    (
        "hp_procurve_show_lldp_info_remote_detail",
        include_str!("../../templates/hp_procurve_show_lldp_info_remote_detail.textfsm"),
    ),
    (
        "arista_eos_show_ip_arp",
        include_str!("../../templates/arista_eos_show_ip_arp.textfsm"),
    ),
];

/// Read-only template store with lazy compilation and poisoning
pub struct TemplateEngine {
    store: BTreeMap<String, String>,
    compiled: Mutex<HashMap<String, Arc<Template>>>,
    poisoned: Mutex<HashSet<String>>,
}

impl TemplateEngine {
    /// Engine over the compiled-in template set
    pub fn embedded() -> TemplateEngine {
        TemplateEngine::from_pairs(
            EMBEDDED_TEMPLATES
                .iter()
                .map(|(n, s)| (n.to_string(), s.to_string())),
        )
    }

    /// Engine over a flat directory of `.textfsm` files, keyed by file stem
    pub fn from_dir(dir: &Path) -> Result<TemplateEngine> {
        let mut store = BTreeMap::new();
        let entries = std::fs::read_dir(dir).with_path_context(&dir.display().to_string())?;
        for entry in entries {
            let entry = entry.with_path_context(&dir.display().to_string())?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("textfsm") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source =
                std::fs::read_to_string(&path).with_path_context(&path.display().to_string())?;
            store.insert(stem.to_string(), source);
        }
        Ok(TemplateEngine {
            store,
            compiled: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> TemplateEngine {
        TemplateEngine {
            store: pairs.into_iter().collect(),
            compiled: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    pub fn template_names(&self) -> Vec<&str> {
        self.store.keys().map(|k| k.as_str()).collect()
    }

    /// Parse `raw` with every candidate template whose name contains
    /// `filter` (all templates when absent) and return the best-scoring
    /// parse. Score is the count of non-empty field occurrences across all
    /// produced records; ties break on record count, then template name.
    pub fn find_best_template(&self, raw: &str, filter: Option<&str>) -> Option<BestMatch> {
        let mut best: Option<BestMatch> = None;

        for (name, source) in &self.store {
            if let Some(f) = filter {
                if !name.contains(f) {
                    continue;
                }
            }
            let Some(template) = self.compiled_template(name, source) else {
                continue;
            };
            let Some(records) = template.run(raw) else {
                continue;
            };
            let score: u32 = records
                .iter()
                .map(|r| r.values().map(FieldValue::occurrences).sum::<u32>())
                .sum();
            if score == 0 {
                continue;
            }
            debug!(template = %name, score, records = records.len(), "candidate parse");
            let better = match &best {
                None => true,
                Some(b) => {
                    score > b.score
                        || (score == b.score && records.len() > b.records.len())
                        || (score == b.score
                            && records.len() == b.records.len()
                            && name.as_str() < b.template.as_str())
                }
            };
            if better {
                best = Some(BestMatch {
                    template: name.clone(),
                    records,
                    score,
                });
            }
        }
        best
    }

    fn compiled_template(&self, name: &str, source: &str) -> Option<Arc<Template>> {
        if self.poisoned.lock().contains(name) {
            return None;
        }
        if let Some(t) = self.compiled.lock().get(name) {
            return Some(Arc::clone(t));
        }
        match Template::compile(name, source) {
            Ok(t) => {
                let t = Arc::new(t);
                self.compiled.lock().insert(name.to_string(), Arc::clone(&t));
                Some(t)
            }
            Err(e) => {
                warn!(template = %name, error = %e, "excluding malformed template");
                self.poisoned.lock().insert(name.to_string());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
Value NAME (\\S+)
Value ADDR (\\d+\\.\\d+\\.\\d+\\.\\d+)

Start
  ^Host: ${NAME}
  ^Addr: ${ADDR} -> Record
";

    fn engine_with(pairs: &[(&str, &str)]) -> TemplateEngine {
        TemplateEngine::from_pairs(
            pairs
                .iter()
                .map(|(n, s)| (n.to_string(), s.to_string())),
        )
    }

    #[test]
    fn test_basic_parse_and_score() {
        let engine = engine_with(&[("simple", SIMPLE)]);
        let text = "Host: sw1\nAddr: 10.0.0.1\nHost: sw2\nAddr: 10.0.0.2\n";
        let best = engine.find_best_template(text, None).unwrap();
        assert_eq!(best.template, "simple");
        assert_eq!(best.records.len(), 2);
        assert_eq!(best.score, 4);
        assert_eq!(field(&best.records[0], "NAME"), "sw1");
        assert_eq!(field(&best.records[1], "ADDR"), "10.0.0.2");
    }

    #[test]
    fn test_filter_restricts_candidates() {
        let engine = engine_with(&[("alpha_show_x", SIMPLE), ("beta_show_y", SIMPLE)]);
        let text = "Host: sw1\nAddr: 10.0.0.1\n";
        let best = engine.find_best_template(text, Some("beta")).unwrap();
        assert_eq!(best.template, "beta_show_y");
        assert!(engine.find_best_template(text, Some("gamma")).is_none());
    }

    #[test]
    fn test_no_candidate_scores() {
        let engine = engine_with(&[("simple", SIMPLE)]);
        assert!(engine.find_best_template("nothing relevant here", None).is_none());
    }

    #[test]
    fn test_malformed_template_is_poisoned_not_fatal() {
        let broken = "Value X ([unclosed)\n\nStart\n  ^${X}\n";
        let engine = engine_with(&[("broken", broken), ("simple", SIMPLE)]);
        let text = "Host: sw1\nAddr: 10.0.0.1\n";
        // Twice: second call must skip the poisoned entry without recompiling
        for _ in 0..2 {
            let best = engine.find_best_template(text, None).unwrap();
            assert_eq!(best.template, "simple");
        }
        assert!(engine.poisoned.lock().contains("broken"));
    }

    #[test]
    fn test_filldown_and_list() {
        let tpl = "\
Value Filldown IFACE (\\S+)
Value List SERIAL (\\S+)
Value PEER (\\S+)

Start
  ^Interface ${IFACE}
  ^Serial ${SERIAL}
  ^Peer ${PEER} -> Record
";
        let engine = engine_with(&[("fd", tpl)]);
        let text = "Interface Eth1\nSerial A1\nSerial A2\nPeer p1\nPeer p2\n";
        let best = engine.find_best_template(text, None).unwrap();
        assert_eq!(best.records.len(), 2);
        assert_eq!(field(&best.records[0], "IFACE"), "Eth1");
        assert_eq!(field_list(&best.records[0], "SERIAL"), vec!["A1", "A2"]);
        // Filldown persists into the second record, list was cleared
        assert_eq!(field(&best.records[1], "IFACE"), "Eth1");
        assert!(field_list(&best.records[1], "SERIAL").is_empty());
        assert_eq!(field(&best.records[1], "PEER"), "p2");
    }

    #[test]
    fn test_required_suppresses_partial_rows() {
        let tpl = "\
Value Required NAME (\\S+)
Value PORT (\\S+)

Start
  ^name ${NAME}
  ^port ${PORT}
  ^--- -> Record
";
        let engine = engine_with(&[("req", tpl)]);
        let text = "port Gi0/1\n---\nname sw2\nport Gi0/2\n---\n";
        let best = engine.find_best_template(text, None).unwrap();
        assert_eq!(best.records.len(), 1);
        assert_eq!(field(&best.records[0], "NAME"), "sw2");
    }

    #[test]
    fn test_continue_record_flushes_previous_entry() {
        let tpl = "\
Value ID (\\S+)
Value DESC (.+)

Start
  ^Entry \\S+ -> Continue.Record
  ^Entry ${ID}
  ^Desc ${DESC}
";
        let engine = engine_with(&[("cr", tpl)]);
        let text = "Entry one\nDesc first\nEntry two\nDesc second\n";
        let best = engine.find_best_template(text, None).unwrap();
        assert_eq!(best.records.len(), 2);
        assert_eq!(field(&best.records[0], "ID"), "one");
        assert_eq!(field(&best.records[1], "DESC"), "second");
    }

    #[test]
    fn test_state_transition() {
        let tpl = "\
Value IP (\\d+\\.\\d+\\.\\d+\\.\\d+)
Value NAME (\\S+)

Start
  ^Device: ${NAME}
  ^Addresses: -> Addr

Addr
  ^\\s+ip ${IP} -> Start
";
        let engine = engine_with(&[("st", tpl)]);
        let text = "Device: sw1\nAddresses:\n  ip 10.1.1.1\n";
        let best = engine.find_best_template(text, None).unwrap();
        assert_eq!(field(&best.records[0], "IP"), "10.1.1.1");
        assert_eq!(field(&best.records[0], "NAME"), "sw1");
    }

    #[test]
    fn test_embedded_store_loads() {
        let engine = TemplateEngine::embedded();
        let names = engine.template_names();
        assert!(names.contains(&"cisco_ios_show_version"));
        assert!(names.contains(&"hp_procurve_show_lldp_info_remote_detail"));
        assert_eq!(names.len(), 12);
    }
}
