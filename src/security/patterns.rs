//! Pattern tables for the static scanner.
//!
//! These are text heuristics over raw source. Obfuscated code slips
//! through them; they are a risk filter in front of the worker boundary,
//! not a verifier.

use regex::Regex;

/// A compiled pattern with the reason reported when it matches.
#[derive(Debug, Clone)]
pub(crate) struct Rule {
    pub regex: Regex,
    pub reason: &'static str,
}

pub(crate) type RuleTable = &'static [(&'static str, &'static str)];

/// Always dangerous, whatever the policy flags say.
pub(crate) const DANGEROUS: RuleTable = &[
    (r"\beval\s*\(", "Direct eval() call executes arbitrary code"),
    (r"\bFunction\s*\(", "Function constructor executes arbitrary code"),
    (
        r#"\bset(?:Timeout|Interval|Immediate)\s*\(\s*['"`]"#,
        "String-based timer evaluates code",
    ),
    (r"__proto__", "Prototype pollution via __proto__"),
    (
        r"\bconstructor\s*\.\s*prototype\b",
        "Prototype pollution via constructor.prototype",
    ),
    (r"\bObject\s*\.\s*setPrototypeOf\s*\(", "Prototype rebinding via setPrototypeOf"),
    (
        r"\bprocess\s*\.\s*(?:exit|kill|abort|binding|dlopen|chdir|setuid|setgid)\b",
        "Process control escape",
    ),
    (r"\bprocess\s*\.\s*mainModule\b", "Module system escape via process.mainModule"),
    (r"\bglobal(?:This)?\s*\.\s*process\b", "Global process access"),
];

/// Dangerous only when `allow_network` is off.
pub(crate) const NETWORK: RuleTable = &[
    (r"\bfetch\s*\(", "Network access via fetch()"),
    (r"\bXMLHttpRequest\b", "Network access via XMLHttpRequest"),
    (r"\bnew\s+WebSocket\s*\(", "Network access via WebSocket"),
    (
        r#"\brequire\s*\(\s*['"](?:node:)?(?:http|https|http2|net|dgram|tls)['"]\s*\)"#,
        "Network module import",
    ),
];

/// Dangerous only when `allow_file_system` is off.
pub(crate) const FILESYSTEM: RuleTable = &[
    (
        r#"\brequire\s*\(\s*['"](?:node:)?fs(?:/promises)?['"]\s*\)"#,
        "Filesystem module import",
    ),
    (
        r"\b(?:readFileSync|writeFileSync|appendFileSync|unlinkSync|rmSync|rmdirSync|mkdirSync)\b",
        "Synchronous filesystem call",
    ),
    (r"\bfs\s*\.\s*\w+\s*\(", "Filesystem call"),
];

/// Dangerous only when `allow_child_process` is off.
pub(crate) const CHILD_PROCESS: RuleTable = &[
    (r"\bchild_process\b", "Child process module reference"),
    (
        r"\b(?:execSync|spawnSync|execFileSync)\s*\(",
        "Synchronous child process spawn",
    ),
];

/// Raise risk, never block.
pub(crate) const SUSPICIOUS: RuleTable = &[
    (r"\bwhile\s*\(\s*(?:true|1)\s*\)", "Unbounded while loop"),
    (r"\bfor\s*\(\s*;\s*;\s*\)", "Unbounded for loop"),
    (r"\(\?<[=!]", "Lookbehind regular expression"),
    (
        r"\bString\s*\.\s*fromCharCode\s*\(",
        "Character-code string building (possible obfuscation)",
    ),
    (r"\batob\s*\(", "Base64 decoding (possible obfuscation)"),
    (
        r"(?:\\x[0-9A-Fa-f]{2}){4,}",
        "Hex-escaped string literal (possible obfuscation)",
    ),
    (
        r"(?:\\u[0-9A-Fa-f]{4}){4,}",
        "Unicode-escaped string literal (possible obfuscation)",
    ),
    (r"\bperformance\s*\.\s*now\s*\(", "High-resolution timing call"),
    (r"\bprocess\s*\.\s*hrtime\b", "High-resolution timing call"),
];

/// Secondary pass for Python payloads.
pub(crate) const PYTHON_DANGEROUS: RuleTable = &[
    (r"\bexec\s*\(", "exec() executes arbitrary code"),
    (r"\b__import__\s*\(", "Dynamic import via __import__"),
    (
        r"\bos\s*\.\s*(?:system|popen|fork|kill|exec\w*|spawn\w*)\b",
        "OS process escape",
    ),
    (r"\bsubprocess\b", "subprocess module reference"),
    (r"\bpickle\s*\.\s*loads?\b", "Unsafe deserialization via pickle"),
    (r"\b__builtins__\b", "Builtins tampering"),
    (r"\b__subclasses__\b", "Class hierarchy escape"),
    (r"\bcompile\s*\(", "Dynamic compilation via compile()"),
];

pub(crate) const PYTHON_NETWORK: RuleTable = &[(
    r"(?m)^\s*(?:import|from)\s+(?:socket|urllib|requests|http|ftplib|smtplib)\b",
    "Network module import",
)];

pub(crate) const PYTHON_FILESYSTEM: RuleTable = &[
    (r"\bopen\s*\(", "File access via open()"),
    (r"\bshutil\b", "shutil module reference"),
];

/// `require('x')`
pub(crate) const REQUIRE_IMPORT: &str = r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#;
/// `import x from 'x'`, `import 'x'`, `import('x')`
pub(crate) const ES_IMPORT: &str =
    r#"\bimport\s*(?:\(\s*|[\w*\s{},$]+\s+from\s+)?['"]([^'"]+)['"]"#;
/// `import x` / `from x import y`
pub(crate) const PYTHON_IMPORT: &str = r"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))";

pub(crate) const URL_HOST: &str = r#"\bhttps?://([A-Za-z0-9.-]+)"#;
pub(crate) const LARGE_ARRAY: &str = r"\b(?:new\s+)?Array\s*\(\s*(\d+)\s*\)";
pub(crate) const LARGE_REPEAT: &str = r"\.repeat\s*\(\s*(\d+)\s*\)";
pub(crate) const CALL_SITE: &str = r"[A-Za-z_$][\w$]*\s*\(";

pub(crate) const NETWORK_MODULES: &[&str] = &["http", "https", "http2", "net", "dgram", "tls"];
pub(crate) const FILESYSTEM_MODULES: &[&str] = &["fs"];
pub(crate) const CHILD_PROCESS_MODULES: &[&str] = &["child_process", "cluster"];

pub(crate) fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Every static table is compiled in `test_tables_compile`
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

pub(crate) fn compile_table(table: RuleTable) -> Vec<Rule> {
    table
        .iter()
        .map(|(pattern, reason)| Rule {
            regex: compile_regex(pattern),
            reason,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_compile() {
        for table in [
            DANGEROUS,
            NETWORK,
            FILESYSTEM,
            CHILD_PROCESS,
            SUSPICIOUS,
            PYTHON_DANGEROUS,
            PYTHON_NETWORK,
            PYTHON_FILESYSTEM,
        ] {
            assert_eq!(compile_table(table).len(), table.len());
        }
        for pattern in [
            REQUIRE_IMPORT,
            ES_IMPORT,
            PYTHON_IMPORT,
            URL_HOST,
            LARGE_ARRAY,
            LARGE_REPEAT,
            CALL_SITE,
        ] {
            compile_regex(pattern);
        }
    }

    #[test]
    fn test_es_import_forms() {
        let re = compile_regex(ES_IMPORT);
        for (src, module) in [
            ("import fs from 'fs'", "fs"),
            ("import { readFile } from \"fs/promises\"", "fs/promises"),
            ("import * as cp from 'child_process'", "child_process"),
            ("import 'side-effect'", "side-effect"),
            ("const m = await import('vm')", "vm"),
        ] {
            let caps = re.captures(src).unwrap_or_else(|| panic!("no match: {src}"));
            assert_eq!(&caps[1], module);
        }
    }
}
