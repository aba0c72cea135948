//! Builds the single script evaluated in a fresh context.
//!
//! Layout: runtime preamble, plugin code verbatim, then an entry function
//! expression. The entry function is the script's completion value; it is
//! called with the parameters and settings as JSON text, so request data is
//! never spliced into source. Its third argument is a host function it uses
//! to report a missing entry point or an uncopyable result. Plugin code is
//! outside that closure and cannot reach it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delegate::DelegateSet;
use crate::error::{PlugletError, Result};
use crate::marshal::copy_in;
use crate::shim;

/// Fault kind reported when the entry point is missing; detail is its name.
pub const FAULT_MISSING_ENTRY: &str = "missing-entry";
/// Fault kind reported when the entry point's result cannot be copied out.
pub const FAULT_MARSHAL: &str = "marshal";

const RESERVED_WORDS: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "undefined", "var", "void", "while",
    "with", "yield",
];

/// One invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRequest {
    /// Correlation id for logs; defaults to the entry point name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Entry point function defined by `code`.
    pub name: String,
    /// Plugin source, trusted by nobody.
    pub code: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default = "empty_object")]
    pub user_settings: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl PluginRequest {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            code: code.into(),
            params: empty_object(),
            user_settings: empty_object(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.user_settings = settings;
        self
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// A validated request ready for evaluation.
#[derive(Debug, Clone)]
pub struct AssembledPlugin {
    pub id: String,
    pub name: String,
    pub source: String,
    pub params_json: String,
    pub settings_json: String,
}

/// Validate the request and produce the script for one context.
pub fn assemble(
    request: &PluginRequest,
    delegates: &DelegateSet,
    max_code_bytes: usize,
) -> Result<AssembledPlugin> {
    validate_entry_name(&request.name)?;

    if request.code.len() > max_code_bytes {
        return Err(PlugletError::CodeTooLarge {
            size: request.code.len(),
            max: max_code_bytes,
        });
    }

    let mut source = shim::preamble(delegates);
    source.push('\n');
    source.push_str(&request.code);
    source.push_str("\n;\n");
    source.push_str(&entry_function(&request.name));

    Ok(AssembledPlugin {
        id: request.id().to_string(),
        name: request.name.clone(),
        source,
        params_json: copy_in(&request.params)?,
        settings_json: copy_in(&request.user_settings)?,
    })
}

/// Entry names must be plain ASCII identifiers that are not reserved words.
pub fn validate_entry_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| PlugletError::InvalidEntryPoint {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name is empty")),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_' || c == '$') => {
            return Err(invalid("must start with a letter, '_' or '$'"));
        }
        Some(_) => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return Err(invalid("may only contain letters, digits, '_' and '$'"));
    }
    if RESERVED_WORDS.contains(&name) {
        return Err(invalid("is a reserved word"));
    }
    Ok(())
}

fn entry_function(name: &str) -> String {
    format!(
        r#"(async function (paramsJson, settingsJson, fault) {{
  if (typeof {name} !== "function") {{
    fault("{missing}", "{name}");
    return;
  }}
  const result = await {name}(JSON.parse(paramsJson), JSON.parse(settingsJson));
  let json;
  try {{
    json = JSON.stringify(result);
  }} catch (e) {{
    let reason;
    try {{
      reason = String(e && e.message);
    }} catch (_) {{
      reason = "unknown error";
    }}
    fault("{marshal}", "result cannot be copied: " + reason);
    return;
  }}
  return json === undefined ? "null" : json;
}})
"#,
        name = name,
        missing = FAULT_MISSING_ENTRY,
        marshal = FAULT_MARSHAL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_request() -> PluginRequest {
        PluginRequest::new("add", "function add(p) { return p.a + p.b; }")
            .with_params(json!({"a": 2, "b": 3}))
    }

    #[test]
    fn test_assemble_layout() {
        let assembled = assemble(&add_request(), &DelegateSet::new(), 1024).unwrap();
        let preamble_end = assembled.source.find("function add").unwrap();
        let entry_start = assembled.source.find("(async function").unwrap();
        assert!(preamble_end < entry_start);
        assert!(assembled.source.trim_end().ends_with("})"));
        assert_eq!(assembled.params_json, r#"{"a":2,"b":3}"#);
        assert_eq!(assembled.settings_json, "{}");
        assert_eq!(assembled.id, "add");
    }

    #[test]
    fn test_request_data_is_not_in_source() {
        let request = add_request().with_params(json!({"a": "\"); throw 1; (\""}));
        let assembled = assemble(&request, &DelegateSet::new(), 1024).unwrap();
        assert!(!assembled.source.contains("throw 1"));
    }

    #[test]
    fn test_harness_reports_through_fault_argument() {
        let assembled = assemble(&add_request(), &DelegateSet::new(), 1024).unwrap();
        assert!(assembled.source.contains("(async function (paramsJson, settingsJson, fault)"));
        assert!(assembled.source.contains(r#"fault("missing-entry", "add");"#));
        assert!(!assembled.source.contains("throw err"));
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "1abc", "a-b", "a b", "return", "add()", "名前"] {
            let err = validate_entry_name(name).unwrap_err();
            assert!(
                matches!(err, PlugletError::InvalidEntryPoint { .. }),
                "{name} accepted"
            );
        }
        for name in ["add", "_private", "$el", "run2"] {
            validate_entry_name(name).unwrap();
        }
    }

    #[test]
    fn test_code_limit() {
        let err = assemble(&add_request(), &DelegateSet::new(), 8).unwrap_err();
        assert!(matches!(err, PlugletError::CodeTooLarge { max: 8, .. }));
    }

    #[test]
    fn test_request_wire_names() {
        let request: PluginRequest = serde_json::from_value(json!({
            "name": "run",
            "code": "function run() {}",
            "userSettings": {"theme": "dark"}
        }))
        .unwrap();
        assert_eq!(request.user_settings, json!({"theme": "dark"}));
        assert_eq!(request.params, json!({}));
        assert_eq!(request.with_id("job-1").id(), "job-1");
    }
}
