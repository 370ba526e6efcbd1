/// Token Diff - default output verification
///
/// Compares a reference answer with a produced output token by token.
/// Tokens are maximal runs of non-whitespace; casing is ignored unless
/// the group asks for `case_sensitive`. Tokens that both parse as floats
/// may match within a tolerance when one is configured.
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DiffError {
    #[error("invalid value for validator flag {flag}: {value}")]
    InvalidFlag { flag: String, value: String },
}

/// Options for the token diff, usually derived from group validator flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffArgs {
    pub case_sensitive: bool,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
}

impl DiffArgs {
    /// Parse `case_sensitive`, `float_tolerance ε`, `float_absolute_tolerance ε`
    /// and `float_relative_tolerance ε`. Values may be given either as the next
    /// flag or joined with `=`. Unknown flags are ignored.
    pub fn from_flags(flags: &[String]) -> Result<Self, DiffError> {
        let mut args = DiffArgs::default();
        let mut iter = flags.iter().peekable();
        while let Some(flag) = iter.next() {
            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (flag.as_str(), None),
            };
            match name {
                "case_sensitive" => args.case_sensitive = true,
                "float_tolerance" | "float_absolute_tolerance" | "float_relative_tolerance" => {
                    let value = match inline {
                        Some(value) => value,
                        None => iter.next().cloned().unwrap_or_default(),
                    };
                    let tolerance: f64 = value.parse().map_err(|_| DiffError::InvalidFlag {
                        flag: name.to_string(),
                        value: value.clone(),
                    })?;
                    if name != "float_relative_tolerance" {
                        args.absolute_tolerance = tolerance;
                    }
                    if name != "float_absolute_tolerance" {
                        args.relative_tolerance = tolerance;
                    }
                }
                _ => {}
            }
        }
        Ok(args)
    }

    fn has_tolerance(&self) -> bool {
        self.absolute_tolerance > 0.0 || self.relative_tolerance > 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub matched: bool,
    /// Human readable description of the first difference.
    pub description: String,
}

impl DiffResult {
    fn matched() -> Self {
        Self {
            matched: true,
            description: String::new(),
        }
    }

    fn mismatch(description: String) -> Self {
        Self {
            matched: false,
            description,
        }
    }
}

fn tokens_match(reference: &str, output: &str, args: &DiffArgs) -> bool {
    if reference == output {
        return true;
    }
    if !args.case_sensitive && reference.to_lowercase() == output.to_lowercase() {
        return true;
    }
    if args.has_tolerance() {
        if let (Ok(r), Ok(o)) = (reference.parse::<f64>(), output.parse::<f64>()) {
            let delta = (r - o).abs();
            return delta <= args.absolute_tolerance || delta <= args.relative_tolerance * r.abs();
        }
    }
    false
}

/// Compare `reference` against `output` token by token.
pub fn diff(reference: &str, output: &str, args: &DiffArgs) -> DiffResult {
    let mut ref_tokens = reference.split_whitespace();
    let mut out_tokens = output.split_whitespace();
    let mut position = 0usize;
    loop {
        position += 1;
        match (ref_tokens.next(), out_tokens.next()) {
            (None, None) => return DiffResult::matched(),
            (Some(r), None) => {
                return DiffResult::mismatch(format!(
                    "reference had token {} '{}'; output was EOF",
                    position, r
                ))
            }
            (None, Some(o)) => {
                return DiffResult::mismatch(format!(
                    "reference was EOF; output had token {} '{}'",
                    position, o
                ))
            }
            (Some(r), Some(o)) => {
                if !tokens_match(r, o, args) {
                    return DiffResult::mismatch(format!(
                        "token {} mismatched: reference '{}', output '{}'",
                        position, r, o
                    ));
                }
            }
        }
    }
}
