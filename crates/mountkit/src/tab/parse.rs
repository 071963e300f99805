//! Table provider: fstab, mountinfo and utab text formats.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{Fs, Table};

/// Entry filter applied while loading the live mount table.
pub type TableFilter = Arc<dyn Fn(&Fs) -> bool + Send + Sync>;

/// Produces tables on demand.
pub trait TableProvider: Send + Sync + fmt::Debug {
    /// Load the static mount table.
    fn fstab(&self, path: &Path) -> MountResult<Table>;

    /// Load the live mount table, keeping only entries accepted by `filter`.
    fn mountinfo(&self, path: &Path, filter: Option<&TableFilter>) -> MountResult<Table>;

    /// Load the userspace mount table; a missing file is an empty table.
    fn utab(&self, path: &Path) -> MountResult<Table>;
}

/// Reads tables from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTableProvider;

impl TableProvider for FileTableProvider {
    fn fstab(&self, path: &Path) -> MountResult<Table> {
        let text = std::fs::read_to_string(path)?;
        Ok(parse_fstab(&text))
    }

    fn mountinfo(&self, path: &Path, filter: Option<&TableFilter>) -> MountResult<Table> {
        let text = std::fs::read_to_string(path)?;
        let mut table = parse_mountinfo(&text);
        if let Some(filter) = filter {
            table = Table::from_entries(
                table
                    .iter(super::Direction::Forward)
                    .filter(|fs| filter(fs))
                    .map(|fs| Fs::clone(fs)),
            );
        }
        Ok(table)
    }

    fn utab(&self, path: &Path) -> MountResult<Table> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(parse_utab(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
            Err(err) => Err(MountError::Io(err)),
        }
    }
}

/// Escape whitespace and backslashes as `\ooo`.
#[must_use]
pub fn mangle(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' | '\t' | '\n' | '\\' => out.push_str(&format!("\\{:03o}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`mangle`].
#[must_use]
pub fn unmangle(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Parse `/etc/fstab` text. Malformed lines are skipped.
#[must_use]
pub fn parse_fstab(text: &str) -> Table {
    let mut table = Table::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            tracing::warn!(line = lineno + 1, "Skipping malformed fstab line");
            continue;
        }
        let field = |i: usize| fields.get(i).map(|f| unmangle(f));
        table.push(Fs {
            source: field(0),
            target: field(1),
            fstype: field(2),
            options: field(3),
            freq: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
            passno: fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(0),
            ..Fs::default()
        });
    }
    table
}

/// Parse `/proc/self/mountinfo` text. Malformed lines are skipped.
#[must_use]
pub fn parse_mountinfo(text: &str) -> Table {
    let mut table = Table::new();
    for (lineno, line) in text.lines().enumerate() {
        let Some((left, right)) = line.split_once(" - ") else {
            if !line.trim().is_empty() {
                tracing::warn!(line = lineno + 1, "Skipping malformed mountinfo line");
            }
            continue;
        };
        let left: Vec<&str> = left.split_whitespace().collect();
        let right: Vec<&str> = right.split_whitespace().collect();
        if left.len() < 6 || right.len() < 2 {
            tracing::warn!(line = lineno + 1, "Skipping malformed mountinfo line");
            continue;
        }

        let vfs = left[5];
        let options = match right.get(2) {
            Some(fs_opts) => format!("{vfs},{fs_opts}"),
            None => vfs.to_string(),
        };
        table.push(Fs {
            id: left[0].parse().ok(),
            parent_id: left[1].parse().ok(),
            root: Some(unmangle(left[3])),
            target: Some(unmangle(left[4])),
            options: Some(options),
            fstype: Some(unmangle(right[0])),
            source: Some(unmangle(right[1])),
            ..Fs::default()
        });
    }
    table
}

/// Parse utab text (`SRC=... TARGET=... OPTS=...` per line).
#[must_use]
pub fn parse_utab(text: &str) -> Table {
    let mut table = Table::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fs = Fs::default();
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let value = non_empty(&unmangle(value));
            match key {
                "ID" => fs.id = value.and_then(|v| v.parse().ok()),
                "SRC" => fs.source = value,
                "TARGET" => fs.target = value,
                "ROOT" => fs.root = value,
                "BINDSRC" => fs.bindsrc = value,
                "ATTRS" => fs.attrs = value,
                "OPTS" => fs.user_options = value,
                _ => tracing::debug!(key, "Ignoring unknown utab key"),
            }
        }
        if fs.target.is_some() {
            table.push(fs);
        }
    }
    table
}

/// Format one utab line (without trailing newline).
#[must_use]
pub fn format_utab_line(fs: &Fs) -> String {
    let mut fields = Vec::with_capacity(6);
    if let Some(id) = fs.id {
        fields.push(format!("ID={id}"));
    }
    let mut push = |key: &str, value: Option<&str>| {
        if let Some(value) = value {
            fields.push(format!("{key}={}", mangle(value)));
        }
    };
    push("SRC", fs.source.as_deref());
    push("TARGET", fs.target.as_deref());
    push("ROOT", Some(fs.root.as_deref().unwrap_or("/")));
    push("BINDSRC", fs.bindsrc.as_deref());
    push("ATTRS", fs.attrs.as_deref());
    push("OPTS", fs.user_options.as_deref());
    fields.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tab::Direction;

    #[test]
    fn fstab_lines() {
        let table = parse_fstab(
            "# comment\n\
             UUID=abcd /            ext4 defaults 0 1\n\
             /dev/sdb1 /mnt/my\\040data xfs  noauto,user\n\
             \n\
             bogus\n",
        );
        assert_eq!(table.len(), 2);
        let root = table.get(0).unwrap();
        assert_eq!(root.tag(), Some(("UUID", "abcd")));
        assert_eq!(root.passno, 1);
        let data = table.get(1).unwrap();
        assert_eq!(data.target.as_deref(), Some("/mnt/my data"));
        assert_eq!(data.options.as_deref(), Some("noauto,user"));
    }

    #[test]
    fn mountinfo_lines() {
        let table = parse_mountinfo(
            "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue\n\
             22 1 0:21 / /proc rw,nosuid - proc proc rw\n",
        );
        assert_eq!(table.len(), 2);
        let fs = table.find_target("/mnt2", Direction::Backward).unwrap();
        assert_eq!(fs.id, Some(36));
        assert_eq!(fs.parent_id, Some(35));
        assert_eq!(fs.root.as_deref(), Some("/mnt1"));
        assert_eq!(fs.source.as_deref(), Some("/dev/root"));
        assert_eq!(fs.fstype.as_deref(), Some("ext3"));
        assert_eq!(fs.options.as_deref(), Some("rw,noatime,rw,errors=continue"));
    }

    #[test]
    fn utab_round_trip() {
        let mut fs = Fs::new().with_source("/dev/sdb1").with_target("/mnt/my data");
        fs.user_options = Some("user=kay,x-foo".into());
        let line = format_utab_line(&fs);
        assert_eq!(
            line,
            "SRC=/dev/sdb1 TARGET=/mnt/my\\040data ROOT=/ OPTS=user=kay,x-foo"
        );

        let table = parse_utab(&line);
        let parsed = table.get(0).unwrap();
        assert_eq!(parsed.target.as_deref(), Some("/mnt/my data"));
        assert_eq!(parsed.user_options.as_deref(), Some("user=kay,x-foo"));
        assert_eq!(parsed.root.as_deref(), Some("/"));
    }

    #[test]
    fn mangle_escapes() {
        assert_eq!(mangle("a b\\c"), "a\\040b\\134c");
        assert_eq!(unmangle("a\\040b\\134c"), "a b\\c");
        assert_eq!(unmangle("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn provider_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(&fstab, "/dev/sdb1 /data xfs defaults 0 0\n").unwrap();
        let provider = FileTableProvider;
        assert_eq!(provider.fstab(&fstab).unwrap().len(), 1);
        assert!(provider.utab(&dir.path().join("missing")).unwrap().is_empty());
        assert!(provider.fstab(&dir.path().join("missing")).is_err());

        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(
            &mountinfo,
            "1 0 8:1 / / rw - ext4 /dev/sda1 rw\n2 1 8:17 / /data rw - xfs /dev/sdb1 rw\n",
        )
        .unwrap();
        let only_data: TableFilter = Arc::new(|fs: &Fs| fs.target.as_deref() == Some("/data"));
        let table = provider.mountinfo(&mountinfo, Some(&only_data)).unwrap();
        assert_eq!(table.len(), 1);
    }
}
