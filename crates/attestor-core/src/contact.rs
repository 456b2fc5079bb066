//! Operator contact configuration.
//!
//! The provider sends out-of-band confirmation codes to the contact address
//! attached to each submission, so the engine refuses to start without one.

use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Contact identity attached to provider submissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactConfig {
    /// Mailbox address the provider delivers confirmation codes to.
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form operator label, included in submissions when set.
    #[serde(default)]
    pub label: Option<String>,
}

impl ContactConfig {
    fn normalize(&mut self) {
        self.email = self.email.as_ref().map(|s| s.trim().to_string());
        if matches!(self.email.as_deref(), Some(s) if s.is_empty()) {
            self.email = None;
        }

        self.label = self.label.as_ref().map(|s| s.trim().to_string());
        if matches!(self.label.as_deref(), Some(s) if s.is_empty()) {
            self.label = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Path of the persisted contact configuration.
pub fn contact_config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("attestor").join("contact.json"))
}

/// Load the contact configuration, if one has been saved.
pub fn load_contact_config() -> anyhow::Result<Option<ContactConfig>> {
    let path = contact_config_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut cfg: ContactConfig = serde_json::from_str(&raw)?;
    cfg.normalize();
    Ok(Some(cfg))
}

/// Save the contact configuration (atomic write-then-rename).
pub fn save_contact_config(cfg: &ContactConfig) -> anyhow::Result<()> {
    let path = contact_config_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load the saved contact configuration, prompting for one on first run
/// when `interactive` is set.
pub fn ensure_contact_config(interactive: bool) -> anyhow::Result<Option<ContactConfig>> {
    match load_contact_config() {
        Ok(Some(cfg)) => return Ok(Some(cfg)),
        Ok(None) => {}
        Err(err) => {
            if !interactive {
                return Err(err);
            }
            eprintln!("warning: failed to read contact config (will recreate): {err:#}");
        }
    }
    if !interactive {
        return Ok(None);
    }

    let cfg = prompt_contact_config()?;
    save_contact_config(&cfg)?;
    Ok(Some(cfg))
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    let mut out = std::io::stdout();
    out.write_all(prompt.as_bytes())?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

fn prompt_contact_config() -> anyhow::Result<ContactConfig> {
    let path = contact_config_path()?;
    println!("First-run setup (saved to {}).", path.display());

    let email = loop {
        let v = prompt_line("Contact mailbox address: ")?;
        if v.contains('@') {
            break v;
        }
        println!("Invalid address: expected user@host.");
    };
    let label = prompt_line("Operator label (ENTER to skip): ")?;

    let mut cfg = ContactConfig {
        email: Some(email),
        label: Some(label),
    };
    cfg.normalize();
    Ok(cfg)
}
