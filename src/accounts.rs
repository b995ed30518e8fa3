//! Account list loading.
//!
//! `main.txt` holds the leader. Every other file in the directory holds
//! followers, one per line: `uid|proxy|multiplier` (proxy and multiplier
//! are optional). Blank lines and `#` comments are skipped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

pub const LEADER_FILE: &str = "main.txt";

/// Session credentials of one venue account.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub uid: String,
    /// `host:port` of a SOCKS5 proxy
    pub proxy: Option<String>,
}

// uid is a session token; keep it out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("uid", &mask_uid(&self.uid))
            .field("proxy", &self.proxy)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSpec {
    pub name: String,
    pub credentials: Credentials,
    pub multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct Accounts {
    pub leader: AccountSpec,
    pub followers: Vec<AccountSpec>,
}

/// `WEB1234abcd…wxyz` style rendering, enough to tell accounts apart.
pub fn mask_uid(uid: &str) -> String {
    let chars: Vec<char> = uid.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

struct Line {
    source: String,
    uid: String,
    proxy: Option<String>,
    multiplier: f64,
}

fn parse_line(raw: &str, source: String) -> Result<Option<Line>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.split('|').map(str::trim);
    let uid = parts.next().unwrap_or_default();
    if uid.is_empty() {
        bail!("{source}: missing uid");
    }
    let proxy = parts
        .next()
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    let multiplier = match parts.next().filter(|m| !m.is_empty()) {
        Some(m) => m
            .parse::<f64>()
            .with_context(|| format!("{source}: invalid multiplier {m:?}"))?,
        None => 1.0,
    };
    if !(multiplier.is_finite() && multiplier > 0.0) {
        return Err(anyhow!("{source}: multiplier must be positive, got {multiplier}"));
    }
    Ok(Some(Line {
        source,
        uid: uid.to_string(),
        proxy,
        multiplier,
    }))
}

fn read_lines(path: &Path) -> Result<Vec<Line>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        if let Some(line) = parse_line(raw, format!("{stem}:{}", idx + 1))? {
            out.push(line);
        }
    }
    Ok(out)
}

pub fn load_accounts(dir: &Path) -> Result<Accounts> {
    let leader_path = dir.join(LEADER_FILE);
    let leader = read_lines(&leader_path)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{} has no account line", leader_path.display()))?;

    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("list {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.file_name().is_some_and(|n| n != LEADER_FILE))
        .collect();
    paths.sort();

    let mut lines = Vec::new();
    for path in &paths {
        lines.extend(read_lines(path)?);
    }
    if lines.is_empty() {
        bail!("no follower accounts found in {}", dir.display());
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for l in &lines {
        *seen.entry(l.uid.as_str()).or_default() += 1;
    }
    let followers: Vec<AccountSpec> = lines
        .iter()
        .map(|l| AccountSpec {
            name: if seen[l.uid.as_str()] == 1 {
                mask_uid(&l.uid)
            } else {
                l.source.clone()
            },
            credentials: Credentials {
                uid: l.uid.clone(),
                proxy: l.proxy.clone(),
            },
            multiplier: l.multiplier,
        })
        .collect();

    Ok(Accounts {
        leader: AccountSpec {
            name: format!("leader {}", mask_uid(&leader.uid)),
            credentials: Credentials {
                uid: leader.uid,
                proxy: leader.proxy,
            },
            multiplier: 1.0,
        },
        followers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn loads_leader_and_followers() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.txt", "WEBleader0000001|127.0.0.1:1080\n");
        write(
            dir.path(),
            "batch1.txt",
            "# team A\nWEBfollower00001\n\nWEBfollower00002||2.5\nWEBfollower00003|10.0.0.2:9050|0.5\n",
        );

        let accounts = load_accounts(dir.path()).unwrap();
        assert_eq!(accounts.leader.credentials.proxy.as_deref(), Some("127.0.0.1:1080"));
        assert_eq!(accounts.followers.len(), 3);
        assert_eq!(accounts.followers[0].multiplier, 1.0);
        assert_eq!(accounts.followers[1].multiplier, 2.5);
        assert_eq!(accounts.followers[1].credentials.proxy, None);
        assert_eq!(accounts.followers[2].credentials.proxy.as_deref(), Some("10.0.0.2:9050"));
        assert_eq!(accounts.followers[0].name, "WEBf…0001");
    }

    #[test]
    fn duplicate_uids_are_named_by_location() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.txt", "WEBleader0000001\n");
        write(dir.path(), "a.txt", "WEBsame000000001\nWEBsame000000001|1.2.3.4:1080\n");
        let accounts = load_accounts(dir.path()).unwrap();
        let names: Vec<_> = accounts.followers.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a:1", "a:2"]);
    }

    #[test]
    fn missing_leader_or_followers_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "WEBfollower00001\n");
        assert!(load_accounts(dir.path()).is_err());

        write(dir.path(), "main.txt", "WEBleader0000001\n");
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let err = load_accounts(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no follower accounts"));
    }

    #[test]
    fn bad_multiplier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.txt", "WEBleader0000001\n");
        write(dir.path(), "a.txt", "WEBfollower00001||-1\n");
        assert!(load_accounts(dir.path()).is_err());
    }

    #[test]
    fn debug_output_masks_uid() {
        let c = Credentials {
            uid: "WEB0123456789abcdef".into(),
            proxy: None,
        };
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("0123456789"));
    }
}
