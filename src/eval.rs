//! Injection of per-run variables into otherwise fully-resolved command
//! text, e.g. `cc $(INPUTS) -o $(OUTPUT)`.
//!
//! Full variable/macro expansion happens in the layer that constructs the
//! graph; by the time a command reaches the engine the only references left
//! are rule-local variables, globals, and the values the engine computes per
//! run.  Lookups walk a chain of tables and substituted text is re-expanded,
//! so a variable may refer to another variable.

use anyhow::bail;
use rustc_hash::FxHashMap;

/// Variable names the engine computes fresh for every run.
pub const RUN_VARS: [&str; 4] = ["OUTPUT", "OUTPUTS", "INPUTS", "NEW_INPUTS"];

/// Re-expansion bound; self-referential variables error out instead of
/// recursing forever.
const MAX_DEPTH: usize = 32;

/// Expand every `$(NAME)` reference in `text`, looking names up in the given
/// tables in order.
pub fn expand(text: &str, lookups: &[&FxHashMap<String, String>]) -> anyhow::Result<String> {
    let mut out = String::with_capacity(text.len());
    expand_into(text, lookups, &mut out, 0)?;
    Ok(out)
}

fn expand_into(
    text: &str,
    lookups: &[&FxHashMap<String, String>],
    out: &mut String,
    depth: usize,
) -> anyhow::Result<()> {
    if depth > MAX_DEPTH {
        bail!("variable expansion too deep in {:?}", text);
    }
    let mut rest = text;
    while let Some(pos) = rest.find("$(") {
        out.push_str(&rest[..pos]);
        let end = match end_paren(rest.as_bytes(), pos + 2) {
            Some(end) => end,
            None => bail!("unterminated $( in {:?}", text),
        };
        let name = &rest[pos + 2..end];
        match lookup(name, lookups) {
            Some(value) => expand_into(value, lookups, out, depth + 1)?,
            None => bail!("undefined variable $({})", name),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(())
}

/// Verify that every variable reference in `text` will resolve at dispatch
/// time, when the per-run variables are also in scope.  An unresolvable
/// reference is a graph-construction failure, never a per-action error
/// during execution.
pub fn check_resolvable(
    text: &str,
    vars: &FxHashMap<String, String>,
    globals: &FxHashMap<String, String>,
) -> anyhow::Result<()> {
    let mut run_vars = FxHashMap::default();
    for &name in RUN_VARS.iter() {
        run_vars.insert(name.to_owned(), String::new());
    }
    expand(text, &[&run_vars, vars, globals]).map(|_| ())
}

fn lookup<'a>(name: &str, lookups: &[&'a FxHashMap<String, String>]) -> Option<&'a str> {
    for table in lookups {
        if let Some(value) = table.get(name) {
            return Some(value.as_str());
        }
    }
    None
}

/// Position of the `)` matching an already-consumed `$(`, allowing nested
/// parentheses; `pos` is the index just past the opening paren.
fn end_paren(bytes: &[u8], mut pos: usize) -> Option<usize> {
    let mut depth = 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
        pos += 1;
    }
    None
}
