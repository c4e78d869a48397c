// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Architecture resolution for uploaded files.
//!
//! Sources are tried in order: explicit value, the RPM header's arch tag,
//! the `name-ver-rel.<arch>.rpm` file name, then an architecture directory
//! somewhere in the path.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{PulpError, PulpResult};
use crate::types::{is_supported_arch, SUPPORTED_ARCHITECTURES};

const RPM_LEAD_SIZE: u64 = 96;
const RPM_LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];
const RPM_HEADER_MAGIC: [u8; 3] = [0x8e, 0xad, 0xe8];
const RPMTAG_ARCH: u32 = 1022;
const RPM_STRING_TYPE: u32 = 6;
/// Upper bound on header index entries; real packages stay far below it.
const MAX_INDEX_ENTRIES: u32 = 65_536;
const MAX_ARCH_LEN: usize = 64;

static RPM_FILENAME_ARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.([a-z0-9_]+)\.rpm$").expect("RPM filename regex is valid")
});

static PATH_ARCH_SEGMENTS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    SUPPORTED_ARCHITECTURES
        .iter()
        .map(|arch| {
            let pattern = format!(r"(?i)[^/\\][/\\]{}[/\\][^/\\]", regex::escape(arch));
            (*arch, Regex::new(&pattern).expect("arch segment regex is valid"))
        })
        .collect()
});

/// Resolve the architecture of an RPM. The header is read on the blocking pool.
pub async fn resolve_rpm_arch(path: &Path, explicit: Option<&str>) -> PulpResult<String> {
    if let Some(arch) = explicit.filter(|a| !a.is_empty()) {
        return Ok(arch.to_string());
    }
    let owned = path.to_path_buf();
    let header = tokio::task::spawn_blocking(move || read_rpm_header_arch(&owned))
        .await
        .unwrap_or_else(|e| Err(io::Error::other(format!("header read task failed: {}", e))));
    match header {
        Ok(Some(arch)) if is_supported_arch(&arch) => return Ok(arch),
        Ok(Some(arch)) => {
            tracing::debug!("{}: header arch '{}' is not supported", path.display(), arch);
        }
        Ok(None) => {}
        Err(e) => tracing::debug!("{}: could not read RPM header: {}", path.display(), e),
    }
    arch_from_rpm_filename(path)
        .or_else(|| arch_from_path(path))
        .map(str::to_string)
        .ok_or_else(|| PulpError::ArchitectureUndetectable { path: path.to_path_buf() })
}

/// Resolve the architecture of a log or other per-arch file (no header).
pub fn resolve_path_arch(path: &Path, explicit: Option<&str>) -> PulpResult<String> {
    if let Some(arch) = explicit.filter(|a| !a.is_empty()) {
        return Ok(arch.to_string());
    }
    arch_from_path(path)
        .map(str::to_string)
        .ok_or_else(|| PulpError::ArchitectureUndetectable { path: path.to_path_buf() })
}

/// `pkg-1.0-1.x86_64.rpm` -> `x86_64`, only for supported architectures.
pub fn arch_from_rpm_filename(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?;
    let captured = RPM_FILENAME_ARCH.captures(name)?.get(1)?.as_str();
    SUPPORTED_ARCHITECTURES.iter().copied().find(|arch| *arch == captured)
}

/// `/builds/x86_64/pkg.rpm` -> `x86_64`.
pub fn arch_from_path(path: &Path) -> Option<&'static str> {
    let text = path.to_string_lossy();
    PATH_ARCH_SEGMENTS
        .iter()
        .find(|(_, re)| re.is_match(&text))
        .map(|(arch, _)| *arch)
}

/// Read the arch tag from an RPM header. `Ok(None)` when the file is not an
/// RPM or the tag is absent.
pub fn read_rpm_header_arch(path: &Path) -> io::Result<Option<String>> {
    let mut file = File::open(path)?;

    let mut lead = [0u8; RPM_LEAD_SIZE as usize];
    if file.read_exact(&mut lead).is_err() || lead[..4] != RPM_LEAD_MAGIC {
        return Ok(None);
    }

    // Signature header, padded to 8 bytes.
    let Some((_, sig_index, sig_data)) = read_header_intro(&mut file)? else {
        return Ok(None);
    };
    let sig_len = u64::from(sig_index) * 16 + u64::from(sig_data);
    let padding = (8 - (sig_len % 8)) % 8;
    file.seek(SeekFrom::Current((sig_len + padding) as i64))?;

    // Main header.
    let Some((_, entries, data_len)) = read_header_intro(&mut file)? else {
        return Ok(None);
    };
    let mut index = vec![0u8; entries as usize * 16];
    file.read_exact(&mut index)?;
    let data_start = file.stream_position()?;

    for entry in index.chunks_exact(16) {
        let tag = be_u32(&entry[0..4]);
        let kind = be_u32(&entry[4..8]);
        let offset = be_u32(&entry[8..12]);
        if tag != RPMTAG_ARCH || kind != RPM_STRING_TYPE || offset >= data_len {
            continue;
        }
        file.seek(SeekFrom::Start(data_start + u64::from(offset)))?;
        let mut buf = vec![0u8; MAX_ARCH_LEN];
        let n = file.read(&mut buf)?;
        let end = buf[..n].iter().position(|b| *b == 0).unwrap_or(n);
        let arch = String::from_utf8_lossy(&buf[..end]).into_owned();
        return Ok(Some(arch).filter(|a| !a.is_empty()));
    }
    Ok(None)
}

/// Header intro: magic(3) version(1) reserved(4) index count(4) data size(4).
fn read_header_intro(file: &mut File) -> io::Result<Option<(u8, u32, u32)>> {
    let mut intro = [0u8; 16];
    if file.read_exact(&mut intro).is_err() || intro[..3] != RPM_HEADER_MAGIC {
        return Ok(None);
    }
    let entries = be_u32(&intro[8..12]);
    if entries > MAX_INDEX_ENTRIES {
        return Ok(None);
    }
    Ok(Some((intro[3], entries, be_u32(&intro[12..16]))))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
