// Configuration interpolation
//
// Resolves `${NAME}` and `${env:NAME}` from the environment and
// `${secret:NAME}` from the secrets mount. A backslash before the token
// escapes it to a literal `${...}`.

use super::ConfigError;
use std::path::Path;

const SECRETS_DIR: &str = "/run/secrets";

/// Replace interpolation tokens in an expanded configuration document.
pub fn interpolate(contents: &str) -> Result<String, ConfigError> {
    interpolate_with_secrets_dir(contents, Path::new(SECRETS_DIR))
}

pub fn interpolate_with_secrets_dir(
    contents: &str,
    secrets_dir: &Path,
) -> Result<String, ConfigError> {
    let bytes = contents.as_bytes();
    let mut out = String::with_capacity(contents.len());
    let mut i = 0;

    while i < bytes.len() {
        // Escaped token: emit literally without the backslash.
        if bytes[i] == b'\\' && i + 1 < bytes.len() && bytes[i + 1] == b'$' {
            if let Some(end) = token_end(bytes, i + 1) {
                out.push_str(&contents[i + 1..end + 1]);
                i = end + 1;
                continue;
            }
        }

        if bytes[i] == b'$' {
            if let Some(end) = token_end(bytes, i) {
                let token = &contents[i + 2..end];
                out.push_str(&resolve(token, secrets_dir)?);
                i = end + 1;
                continue;
            }
        }

        let ch = contents[i..].chars().next().expect("in-bounds index");
        out.push(ch);
        i += ch.len_utf8();
    }

    Ok(out)
}

/// Index of the closing brace of a `${...}` token starting at `start`,
/// or None when `start` does not open a token.
fn token_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start + 1 >= bytes.len() || bytes[start] != b'$' || bytes[start + 1] != b'{' {
        return None;
    }
    bytes[start + 2..]
        .iter()
        .position(|b| *b == b'}')
        .map(|offset| start + 2 + offset)
}

fn resolve(token: &str, secrets_dir: &Path) -> Result<String, ConfigError> {
    if let Some(name) = token.strip_prefix("secret:") {
        let path = secrets_dir.join(name);
        return std::fs::read_to_string(&path)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| {
                ConfigError::Interpolation(format!("cannot read secret '{name}': {e}"))
            });
    }

    let name = token.strip_prefix("env:").unwrap_or(token);
    std::env::var(name)
        .map_err(|_| ConfigError::Interpolation(format!("environment variable '{name}' is not set")))
}
