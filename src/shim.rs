//! JavaScript installed into every sandbox before plugin code runs.
//!
//! The host binds three raw functions on the global object. The preamble
//! captures them in a closure and deletes them, so plugin code can only reach
//! the host through the capability wrappers the shims define.

use crate::delegate::DelegateSet;

/// Raw host function: `(callId, capability, argsJson) -> refusal | undefined`.
pub const HOST_CALL: &str = "__pluglet_call";
/// Raw host function: `(level, message)`.
pub const HOST_LOG: &str = "__pluglet_log";
/// Raw host function: registers the settle callback `(callId, ok, payload)`.
pub const HOST_BIND: &str = "__pluglet_bind";
/// Raw host function: records an error object as a genuine capability failure.
pub const HOST_MARK: &str = "__pluglet_mark";

/// Error name used when a delegate call is rejected.
pub const CAPABILITY_ERROR: &str = "CapabilityError";

const PREAMBLE_HEAD: &str = r#"(function (global, hostCall, hostLog, hostBind, hostMark) {
  "use strict";
  delete global.__pluglet_call;
  delete global.__pluglet_log;
  delete global.__pluglet_bind;
  delete global.__pluglet_mark;

  const pending = new Map();
  let nextId = 1;

  const capabilityError = (capability, message) => {
    const err = new Error(message);
    err.name = "CapabilityError";
    err.capability = capability;
    hostMark(err);
    return err;
  };

  const invoke = (capability) => (args) =>
    new Promise((resolve, reject) => {
      let payload;
      try {
        payload = JSON.stringify(args === undefined ? null : args);
      } catch (e) {
        reject(capabilityError(capability, "arguments cannot be copied: " + e.message));
        return;
      }
      const id = nextId++;
      pending.set(id, { capability, resolve, reject });
      const refused = hostCall(id, capability, payload);
      if (refused !== undefined) {
        pending.delete(id);
        reject(capabilityError(capability, refused));
      }
    });

  hostBind((id, ok, payload) => {
    const call = pending.get(id);
    if (call === undefined) return;
    pending.delete(id);
    if (ok) call.resolve(JSON.parse(payload));
    else call.reject(capabilityError(call.capability, payload));
  });

  const format = (value) => {
    if (typeof value === "string") return value;
    if (value instanceof Error) return value.name + ": " + value.message;
    try {
      const text = JSON.stringify(value);
      return text === undefined ? String(value) : text;
    } catch (_) {
      return String(value);
    }
  };
  const logger = (level) => (...args) => hostLog(level, args.map(format).join(" "));
  const console = Object.freeze({
    log: logger("info"),
    info: logger("info"),
    debug: logger("debug"),
    warn: logger("warn"),
    error: logger("error"),
  });
  Object.defineProperty(global, "console", { value: console, writable: true, configurable: true });
"#;

const PREAMBLE_TAIL: &str = r#"})(globalThis, globalThis.__pluglet_call, globalThis.__pluglet_log, globalThis.__pluglet_bind, globalThis.__pluglet_mark);
"#;

/// Network fetch shim: defines `fetch(url, options)` resolving to a
/// response-like object built from the delegate's plain record.
pub const FETCH_SHIM: &str = r#"(invoke, global) => {
  const copy = (value) => (value === undefined ? null : JSON.parse(JSON.stringify(value)));

  const toBytes = (text) => {
    let binary;
    try {
      binary = unescape(encodeURIComponent(text));
    } catch (_) {
      binary = text;
    }
    const bytes = new Uint8Array(binary.length);
    for (let i = 0; i < binary.length; i++) bytes[i] = binary.charCodeAt(i) & 0xff;
    return bytes;
  };

  const makeHeaders = (raw) => {
    const headers = {};
    for (const [key, value] of Object.entries(raw || {})) {
      headers[String(key).toLowerCase()] = String(value);
    }
    Object.defineProperty(headers, "get", {
      value: (name) => {
        const value = headers[String(name).toLowerCase()];
        return value === undefined ? null : value;
      },
    });
    Object.defineProperty(headers, "has", {
      value: (name) => Object.prototype.hasOwnProperty.call(headers, String(name).toLowerCase()),
    });
    return headers;
  };

  const makeBlob = (text, type) => {
    const bytes = toBytes(text);
    return {
      size: bytes.length,
      type,
      text: async () => text,
      arrayBuffer: async () => bytes.buffer.slice(0),
    };
  };

  const makeResponse = (raw) => {
    const data = raw.data === undefined ? null : raw.data;
    const headers = makeHeaders(raw.headers);
    return {
      ok: Boolean(raw.ok),
      status: raw.status,
      statusText: raw.statusText,
      headers,
      json: async () => copy(data),
      text: async () => JSON.stringify(data),
      blob: async () => makeBlob(JSON.stringify(data), headers.get("content-type") || ""),
      arrayBuffer: async () => new ArrayBuffer(0),
      clone: () => makeResponse(copy(raw)),
    };
  };

  const normalizeHeaders = (headers) => {
    const out = {};
    for (const [key, value] of Object.entries(headers || {})) out[String(key)] = String(value);
    return out;
  };

  const fetch = async (url, options) => {
    const init = options || {};
    const raw = await invoke({
      url: String(url),
      options: {
        method: init.method === undefined ? undefined : String(init.method),
        headers: normalizeHeaders(init.headers),
        body: init.body,
      },
    });
    return makeResponse(raw);
  };

  Object.defineProperty(global, "fetch", { value: fetch, writable: true, configurable: true });
}"#;

/// Build the runtime preamble for a delegate set: console plus one
/// `(shim)(invoke, global)` installation per capability.
pub fn preamble(delegates: &DelegateSet) -> String {
    let mut source = String::from(PREAMBLE_HEAD);
    for delegate in delegates.iter() {
        let name = serde_json::Value::String(delegate.name().to_string());
        source.push_str("\n  (");
        source.push_str(delegate.shim());
        source.push_str(&format!(")(invoke({}), global);\n", name));
    }
    source.push_str(PREAMBLE_TAIL);
    source
}
