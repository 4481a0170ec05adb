use std::io::{self, BufRead, IsTerminal, Write};

use luks_fips_convert::{ConvertError, Device, Prompter};
use zeroize::Zeroizing;

/// Prompts on the terminal, or reads answers line by line from piped stdin.
///
/// Piped input per device: the confirmation answer (unless auto-confirmed),
/// then the passphrase, then its confirmation.
pub struct TerminalPrompter {
    interactive: bool,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self {
            interactive: io::stdin().is_terminal(),
        }
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&mut self, device: &Device, partitions: &str) -> Result<bool, ConvertError> {
        if self.interactive {
            let mut stderr = io::stderr();
            writeln!(stderr, "{}", partitions.trim_end())?;
            write!(stderr, "Convert the keyslot on {device}? [y/N] ")?;
            stderr.flush()?;
        }

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }

    fn passphrase(
        &mut self,
        device: &Device,
    ) -> Result<(Zeroizing<String>, Zeroizing<String>), ConvertError> {
        if !self.interactive {
            let stdin = io::stdin();
            let mut handle = stdin.lock();

            let mut pw1 = Zeroizing::new(String::new());
            let mut pw2 = Zeroizing::new(String::new());

            handle.read_line(&mut pw1)?;
            handle.read_line(&mut pw2)?;

            trim_newline(&mut pw1);
            trim_newline(&mut pw2);

            return Ok((pw1, pw2));
        }

        let pw1 = Zeroizing::new(rpassword::prompt_password(format!(
            "Passphrase for {device}: "
        ))?);
        let pw2 = Zeroizing::new(rpassword::prompt_password(format!(
            "Confirm passphrase for {device}: "
        ))?);

        Ok((pw1, pw2))
    }
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
