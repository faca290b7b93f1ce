//! Argument parsers for numbers and data.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Parses decimal or `0x`-prefixed hex; `_` separators are allowed.
pub fn u64(s: &str) -> Result<u64, String> {
    let digits = s.replace('_', "");
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

/// Like [`u64`], limited to 32 bits.
pub fn u32(s: &str) -> Result<u32, String> {
    let v = self::u64(s)?;
    u32::try_from(v).map_err(|_| format!("{s} does not fit in 32 bits"))
}

/// Like [`u64`], limited to 16 bits.
pub fn u16(s: &str) -> Result<u16, String> {
    let v = self::u64(s)?;
    u16::try_from(v).map_err(|_| format!("{s} does not fit in 16 bits"))
}

/// Narrows an address to a 32-bit address space.
pub fn addr32(addr: u64) -> Result<u32> {
    u32::try_from(addr).with_context(|| format!("address {addr:#x} exceeds 32 bits"))
}

/// Data to write, given inline as hex or read from a file.
#[derive(Debug, clap::Args)]
#[group(required = true, multiple = false)]
pub struct DataArg {
    /// Bytes as hex, e.g. `deadbeef` or `0xde_ad_be_ef`.
    #[arg(long)]
    pub hex: Option<String>,

    /// File whose contents are written.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

impl DataArg {
    /// Returns the bytes to write.
    pub fn load(&self) -> Result<Vec<u8>> {
        match (&self.hex, &self.file) {
            (Some(text), _) => decode_hex(text),
            (None, Some(path)) => {
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))
            }
            (None, None) => bail!("no data given; use --hex or --file"),
        }
    }
}

/// Decodes hex text, ignoring a `0x` prefix, whitespace and `_`.
pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let clean: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    hex::decode(&clean).with_context(|| format!("invalid hex data {text:?}"))
}
