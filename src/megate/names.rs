//! Combination names that downstream simulators accept as identifiers.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::AcceptedCombo;

pub const MAX_NAME_LEN: usize = 50;
const TRUNCATED_LEN: usize = 40;
const DIGEST_HEX_LEN: usize = 9;

static COMPLIANT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("Invalid compliant name regex"));
static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("Invalid non-word regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameChange {
    pub old_name: String,
    pub new_name: String,
}

pub fn is_neuron_compliant(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && COMPLIANT_NAME.is_match(name)
}

pub fn neuron_compliant(name: &str) -> String {
    if is_neuron_compliant(name) {
        return name.to_string();
    }
    let mut fixed = NON_WORD.replace_all(name, "_").into_owned();
    if !fixed.starts_with(|c: char| c.is_ascii_alphabetic()) {
        fixed.insert(0, 'x');
    }
    if fixed.len() > MAX_NAME_LEN {
        fixed = hashed(&fixed, name);
    }
    fixed
}

/// `<first 40 chars>_<9 hex digits of blake3(original)>`; `prefix` is already ASCII.
fn hashed(prefix: &str, original: &str) -> String {
    let digest = blake3::hash(original.as_bytes()).to_hex();
    let cut = prefix.len().min(TRUNCATED_LEN);
    format!("{}_{}", &prefix[..cut], &digest.as_str()[..DIGEST_HEX_LEN])
}

/// Renames every non-compliant combo in place and returns the changes made.
/// Two names that collapse onto the same identifier are told apart by digest.
pub fn make_names_compliant(combos: &mut [AcceptedCombo]) -> Vec<NameChange> {
    let mut taken: BTreeSet<String> = combos
        .iter()
        .filter(|c| is_neuron_compliant(&c.combo_name))
        .map(|c| c.combo_name.clone())
        .collect();
    let mut changes = Vec::new();
    for combo in combos.iter_mut() {
        if is_neuron_compliant(&combo.combo_name) {
            continue;
        }
        let mut new_name = neuron_compliant(&combo.combo_name);
        if taken.contains(&new_name) {
            let base = NON_WORD.replace_all(&combo.combo_name, "_");
            let base = if base.starts_with(|c: char| c.is_ascii_alphabetic()) {
                base.into_owned()
            } else {
                format!("x{base}")
            };
            new_name = hashed(&base, &combo.combo_name);
        }
        taken.insert(new_name.clone());
        changes.push(NameChange {
            old_name: std::mem::replace(&mut combo.combo_name, new_name.clone()),
            new_name,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compliant_names_are_untouched() {
        assert_eq!(neuron_compliant("emodel1_L1_A_1_morph1"), "emodel1_L1_A_1_morph1");
    }

    #[test]
    fn invalid_characters_and_leading_digit_are_fixed() {
        assert_eq!(neuron_compliant("emodel-1_L1_A:B_1_m.1"), "emodel_1_L1_A_B_1_m_1");
        assert_eq!(neuron_compliant("1emodel"), "x1emodel");
    }

    #[test]
    fn long_names_are_shortened_with_digest() {
        let long = format!("cADpyr_{}", "a".repeat(80));
        let fixed = neuron_compliant(&long);
        assert_eq!(fixed.len(), MAX_NAME_LEN);
        assert!(is_neuron_compliant(&fixed));
        assert_eq!(&fixed[..TRUNCATED_LEN], &long[..TRUNCATED_LEN]);
        assert_ne!(fixed, neuron_compliant(&format!("{long}b")));
    }
}
