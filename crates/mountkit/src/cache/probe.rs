//! On-disk filesystem signature probing.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Result of probing a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// No known signature.
    Unknown,
    /// Exactly one signature.
    Found(String),
    /// More than one signature; the caller has to choose.
    Ambiguous(Vec<String>),
}

/// Detects the filesystem type stored on a device or image.
pub trait FsProber: Send + Sync + fmt::Debug {
    /// Probe `device`.
    fn probe(&self, device: &Path) -> io::Result<Probe>;
}

/// Superblock magic prober for common filesystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuperblockProber;

/// Bytes needed to see every supported superblock.
const PROBE_SIZE: usize = 0x10048;

fn at(buf: &[u8], offset: usize, magic: &[u8]) -> bool {
    buf.get(offset..offset + magic.len()) == Some(magic)
}

fn le32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn ext_family(buf: &[u8]) -> Option<&'static str> {
    const HAS_JOURNAL: u32 = 0x0004;
    const INCOMPAT_EXT4: u32 = 0x0040 | 0x0080 | 0x0200;

    if !at(buf, 0x438, &0xEF53_u16.to_le_bytes()) {
        return None;
    }
    if le32(buf, 0x460) & INCOMPAT_EXT4 != 0 {
        Some("ext4")
    } else if le32(buf, 0x45c) & HAS_JOURNAL != 0 {
        Some("ext3")
    } else {
        Some("ext2")
    }
}

/// All signatures found in `buf`.
#[must_use]
pub fn signatures(buf: &[u8]) -> Vec<String> {
    let mut found: Vec<&str> = Vec::new();

    if let Some(ext) = ext_family(buf) {
        found.push(ext);
    }
    if at(buf, 0, b"XFSB") {
        found.push("xfs");
    }
    if at(buf, 0x10040, b"_BHRfS_M") {
        found.push("btrfs");
    }
    if at(buf, 0, b"hsqs") {
        found.push("squashfs");
    }
    if at(buf, 0x8001, b"CD001") {
        found.push("iso9660");
    }
    if at(buf, 3, b"EXFAT   ") {
        found.push("exfat");
    } else if at(buf, 54, b"FAT12   ") || at(buf, 54, b"FAT16   ") || at(buf, 82, b"FAT32   ") {
        found.push("vfat");
    }
    if at(buf, 4096 - 10, b"SWAPSPACE2") || at(buf, 4096 - 10, b"SWAP-SPACE") {
        found.push("swap");
    }

    found.into_iter().map(String::from).collect()
}

impl FsProber for SuperblockProber {
    fn probe(&self, device: &Path) -> io::Result<Probe> {
        let mut buf = Vec::with_capacity(PROBE_SIZE);
        File::open(device)?
            .take(PROBE_SIZE as u64)
            .read_to_end(&mut buf)?;

        let mut found = signatures(&buf);
        tracing::debug!(device = %device.display(), ?found, "Probed signatures");
        Ok(match found.len() {
            0 => Probe::Unknown,
            1 => Probe::Found(found.remove(0)),
            _ => Probe::Ambiguous(found),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(patches: &[(usize, &[u8])]) -> tempfile::NamedTempFile {
        let mut buf = vec![0u8; PROBE_SIZE];
        for (offset, bytes) in patches {
            buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&buf).unwrap();
        file
    }

    #[test]
    fn empty_image_is_unknown() {
        let file = image(&[]);
        assert_eq!(SuperblockProber.probe(file.path()).unwrap(), Probe::Unknown);
    }

    #[test]
    fn ext4_detected() {
        let file = image(&[(0x438, &[0x53, 0xEF]), (0x460, &[0x40, 0, 0, 0])]);
        assert_eq!(
            SuperblockProber.probe(file.path()).unwrap(),
            Probe::Found("ext4".into())
        );
    }

    #[test]
    fn ext2_without_features() {
        let file = image(&[(0x438, &[0x53, 0xEF])]);
        assert_eq!(
            SuperblockProber.probe(file.path()).unwrap(),
            Probe::Found("ext2".into())
        );
    }

    #[test]
    fn two_signatures_are_ambiguous() {
        let file = image(&[(0, b"XFSB"), (0x10040, b"_BHRfS_M")]);
        assert_eq!(
            SuperblockProber.probe(file.path()).unwrap(),
            Probe::Ambiguous(vec!["xfs".into(), "btrfs".into()])
        );
    }

    #[test]
    fn short_files_are_fine() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hsqs").unwrap();
        assert_eq!(
            SuperblockProber.probe(file.path()).unwrap(),
            Probe::Found("squashfs".into())
        );
    }
}
