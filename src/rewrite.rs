use crate::config::Substitution;
use regex::Regex;

/// Applies each substitution in declared order as a global replacement over
/// the full body. A pattern that fails to compile is logged and skipped;
/// remaining rules still apply.
pub fn apply_substitutions(body: &str, substitutions: &[Substitution]) -> String {
    let mut out = body.to_string();
    for substitution in substitutions {
        match Regex::new(&substitution.pattern) {
            Ok(pattern) => {
                out = pattern
                    .replace_all(&out, substitution.replacement.as_str())
                    .into_owned();
            }
            Err(err) => {
                tracing::warn!(
                    "skipping substitution with invalid pattern {:?}: {}",
                    substitution.pattern,
                    err
                );
            }
        }
    }
    out
}
