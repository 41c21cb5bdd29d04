//! Guard injection for medium-risk JavaScript payloads.
//!
//! Used in `EnforcementMode::Mitigate`. The rewrite is a brace-level scan,
//! not a parse: it skips strings and comments but does not understand
//! regex literals or template interpolation.

use super::SecurityPolicyOptions;

/// Identifiers always shadowed by the wrapper, on top of `blocked_apis`.
const SHADOWED_GLOBALS: &[&str] = &["require", "process", "module", "exports", "Function"];

const TICK: &str = "__sandbox.tick();";
const ENTER: &str = "__sandbox.enter(); try {";
const EXIT: &str = "} finally { __sandbox.exit(); }";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Block {
    Loop,
    Function,
    Other,
}

/// Inserts a loop counter tick at the top of every loop body and a
/// depth counter around every `function` body.
pub fn sanitize_code(code: &str) -> String {
    let bytes = code.as_bytes();
    let mut inserts: Vec<(usize, &'static str)> = Vec::new();
    let mut stack: Vec<Block> = Vec::new();
    // Block kind waiting for its `{`, and the paren depth it was seen at.
    let mut pending: Option<(Block, usize)> = None;
    let mut parens = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
                continue;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                let after_dot = start > 0 && bytes[start - 1] == b'.';
                if !after_dot {
                    match &code[start..i] {
                        "for" | "while" | "do" => pending = Some((Block::Loop, parens)),
                        "function" => pending = Some((Block::Function, parens)),
                        _ => {}
                    }
                }
                continue;
            }
            b'(' => parens += 1,
            b')' => parens = parens.saturating_sub(1),
            b';' => {
                if pending.is_some_and(|(_, depth)| depth == parens) {
                    pending = None;
                }
            }
            b'{' => {
                let kind = match pending.take() {
                    Some((kind, depth)) if depth == parens => kind,
                    _ => Block::Other,
                };
                match kind {
                    Block::Loop => inserts.push((i + 1, TICK)),
                    Block::Function => inserts.push((i + 1, ENTER)),
                    Block::Other => {}
                }
                stack.push(kind);
            }
            b'}' => {
                if stack.pop() == Some(Block::Function) {
                    inserts.push((i, EXIT));
                }
            }
            _ => {}
        }
        i += 1;
    }

    // Stable: equal positions keep scan order, so `{}` gets enter before exit.
    inserts.sort_by_key(|(pos, _)| *pos);

    let extra: usize = inserts.iter().map(|(_, s)| s.len() + 1).sum();
    let mut out = String::with_capacity(code.len() + extra);
    let mut last = 0;
    for (pos, text) in inserts {
        out.push_str(&code[last..pos]);
        out.push(' ');
        out.push_str(text);
        last = pos;
    }
    out.push_str(&code[last..]);
    out
}

/// Wraps `code` so that blocked globals are shadowed by `undefined`,
/// the body runs in strict mode, and loop/recursion ceilings from
/// `options` throw once exceeded.
pub fn generate_safe_wrapper(code: &str, options: &SecurityPolicyOptions) -> String {
    let mut shadowed: Vec<&str> = Vec::new();
    for name in SHADOWED_GLOBALS
        .iter()
        .copied()
        .chain(options.blocked_apis.iter().map(String::as_str))
    {
        if is_identifier(name) && !shadowed.contains(&name) {
            shadowed.push(name);
        }
    }
    let params = shadowed.join(", ");
    let args = vec!["undefined"; shadowed.len()].join(", ");

    let mut out = String::new();
    out.push_str(&format!("(function ({params}) {{\n"));
    out.push_str("  return (function () {\n");
    out.push_str("    \"use strict\";\n");
    out.push_str("    const __sandbox = (function () {\n");
    out.push_str("      let loops = 0;\n");
    out.push_str("      let depth = 0;\n");
    out.push_str("      return Object.freeze({\n");
    out.push_str(&format!(
        "        tick() {{ if (++loops > {}) throw new Error(\"Loop limit exceeded\"); }},\n",
        options.max_loops
    ));
    out.push_str(&format!(
        "        enter() {{ if (++depth > {}) {{ depth = 0; throw new Error(\"Recursion limit exceeded\"); }} }},\n",
        options.max_recursion
    ));
    out.push_str("        exit() { depth = Math.max(0, depth - 1); },\n");
    out.push_str("      });\n");
    out.push_str("    })();\n");
    out.push_str(&sanitize_code(code));
    out.push_str("\n  })();\n");
    out.push_str(&format!("}})({args});\n"));
    out
}

fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$'
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn is_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    bytes.next().is_some_and(is_ident_start) && bytes.all(is_ident_byte)
}
