// Name and Env Helpers
// Cascaded path names, reversible encodings and envfile parsing shared by the
// scheduler, compiler and runner.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use crate::error::Result;
use crate::variables::Variables;

/// Delimiter joining ancestor graph/stage names into a cascaded path name.
pub const PIPELINE_DELIMITER: &str = "->";

/// Name of the per-project env file ingested before every task.
pub const PROJECT_ENV_FILE: &str = "conveyor.env";

/// Join ancestor names and the current name with the pipeline delimiter.
pub fn cascade_name(parents: &[String], name: &str) -> String {
    if parents.is_empty() {
        return name.to_string();
    }
    format!("{}{}{}", parents.join(PIPELINE_DELIMITER), PIPELINE_DELIMITER, name)
}

/// Last segment of a cascaded path name.
pub fn tail_extract(name: &str) -> &str {
    name.rsplit(PIPELINE_DELIMITER).next().unwrap_or(name)
}

/// Encode a stage or task name into a machine-friendly identifier usable in
/// filenames and CI job ids. The encoding is reversible: each replaced
/// sequence maps to a unique marker.
pub fn machine_friendly(name: &str) -> String {
    name.replace(PIPELINE_DELIMITER, "__a__")
        .replace(':', "__e__")
        .replace(' ', "__f__")
}

/// Invert [`machine_friendly`].
pub fn machine_friendly_decode(name: &str) -> String {
    name.replace("__a__", PIPELINE_DELIMITER)
        .replace("__e__", ":")
        .replace("__f__", " ")
}

const BASE62_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Base62-encode a name so human-oriented tools can round-trip it.
pub fn encode_base62(input: &str) -> String {
    // big-endian base-256 -> base-62 conversion by repeated division
    let mut num: Vec<u8> = input.as_bytes().to_vec();
    let mut digits: Vec<u8> = Vec::new();

    while !num.is_empty() {
        let mut rem: u32 = 0;
        let mut quotient: Vec<u8> = Vec::with_capacity(num.len());
        for &b in &num {
            let acc = rem * 256 + u32::from(b);
            quotient.push((acc / 62) as u8);
            rem = acc % 62;
        }
        let first = quotient.iter().position(|&b| b != 0).unwrap_or(quotient.len());
        num = quotient[first..].to_vec();
        digits.push(BASE62_ALPHABET[rem as usize]);
    }

    if digits.is_empty() {
        digits.push(b'0');
    }
    digits.reverse();
    digits.iter().map(|&b| b as char).collect()
}

/// Invert [`encode_base62`]. Unknown characters are ignored.
pub fn decode_base62(input: &str) -> String {
    let mut num: Vec<u8> = Vec::new();

    for c in input.bytes() {
        let Some(digit) = BASE62_ALPHABET.iter().position(|&b| b == c) else {
            continue;
        };
        let mut carry = digit as u32;
        for b in num.iter_mut().rev() {
            let acc = u32::from(*b) * 62 + carry;
            *b = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            num.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    String::from_utf8_lossy(&num).into_owned()
}

/// Parse an env file: one `KEY=VALUE` per line, split on the first `=`.
/// Values keep any further `=` verbatim; a blank key is kept only when the
/// left side of the line is empty. Lines without `=` are skipped.
pub fn read_env_file<R: BufRead>(reader: R) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.insert(key.to_string(), value.to_string());
        }
    }
    Ok(vars)
}

/// Parse `KEY=VALUE` pairs (one entry per element, values may span lines).
pub fn convert_from_env(pairs: &[String]) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for pair in pairs {
        if let Some((key, value)) = pair.split_once('=') {
            vars.insert(key.to_string(), value.to_string());
        }
    }
    vars
}

/// Flatten an env map to `KEY=VALUE` entries, sorted for determinism.
pub fn convert_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut entries: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    entries.sort();
    entries
}

/// Last non-empty line of a string, trimmed.
pub fn last_line(s: &str) -> String {
    s.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Env vars from the project env file in `dir`, empty when absent. Runs at
/// every task start so edits are picked up dynamically.
pub fn project_env(dir: &Path) -> Variables {
    let path = dir.join(PROJECT_ENV_FILE);
    let Ok(file) = std::fs::File::open(&path) else {
        return Variables::new();
    };
    match read_env_file(std::io::BufReader::new(file)) {
        Ok(map) => Variables::from_map(map),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable project env file");
            Variables::new()
        }
    }
}
