//! Interactive passphrase entry

use anyhow::Context;
use flint_common::credentials::MIN_PASSPHRASE_LEN;

const ATTEMPTS: usize = 3;

/// Read one line from the terminal with echo turned off
pub fn read_hidden(prompt: &str) -> anyhow::Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read passphrase from the terminal")
}

/// Ask for a new passphrase twice until both entries match and it is long
/// enough.
pub fn new_passphrase() -> anyhow::Result<String> {
    for _ in 0..ATTEMPTS {
        let first = read_hidden("New web UI passphrase: ")?;
        let confirm = read_hidden("Confirm passphrase: ")?;
        match check_new_passphrase(&first, &confirm) {
            Ok(()) => return Ok(first),
            Err(problem) => eprintln!("{}", problem),
        }
    }
    anyhow::bail!("No passphrase set after {} attempts", ATTEMPTS)
}

fn check_new_passphrase(first: &str, confirm: &str) -> Result<(), String> {
    if first.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(format!(
            "Passphrase must be at least {} characters",
            MIN_PASSPHRASE_LEN
        ));
    }
    if first != confirm {
        return Err("Passphrases do not match".to_string());
    }
    Ok(())
}
