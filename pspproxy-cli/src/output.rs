//! Rendering of command results.

use std::io::{self, Write};

/// Writes `data` as a canonical hex dump, labelling lines from `base`.
pub fn hexdump(out: &mut impl Write, base: u64, data: &[u8]) -> io::Result<()> {
    for (line, chunk) in (0u64..).zip(data.chunks(16)) {
        let cols: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let (lo, hi) = cols.split_at(cols.len().min(8));
        let hex = format!("{} {}", lo.join(" "), hi.join(" "));
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    char::from(b)
                } else {
                    '.'
                }
            })
            .collect();
        let addr = base.wrapping_add(line * 16);
        writeln!(out, "{addr:016x}  {hex:<48} |{ascii}|")?;
    }
    Ok(())
}

/// Formats a register value padded to its access width.
pub fn register(value: u64, size: u32) -> String {
    let digits = usize::try_from(size).unwrap_or(8).saturating_mul(2);
    format!("0x{value:0digits$x}")
}
