//! Commands that run against a target: registers, memory, calls and code
//! modules.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pspproxy::{CoProcReg, Session};
use serde_json::json;

use crate::OutputFormat;
use crate::output::{hexdump, register};
use crate::parse::{self, DataArg, addr32};

/// Arguments for register reads.
#[derive(Debug, clap::Args)]
pub struct ReadReg {
    /// Register address.
    #[arg(value_parser = parse::u64)]
    pub addr: u64,

    /// Access width in bytes (1, 2, 4 or 8).
    #[arg(short, long, default_value_t = 4)]
    pub size: u32,
}

/// Arguments for register writes.
#[derive(Debug, clap::Args)]
pub struct WriteReg {
    /// Register address.
    #[arg(value_parser = parse::u64)]
    pub addr: u64,

    /// Value to write.
    #[arg(value_parser = parse::u64)]
    pub value: u64,

    /// Access width in bytes (1, 2, 4 or 8).
    #[arg(short, long, default_value_t = 4)]
    pub size: u32,
}

/// Arguments for buffer reads.
#[derive(Debug, clap::Args)]
pub struct ReadBuf {
    /// Start address (a kernel token for `kern-read`).
    #[arg(value_parser = parse::u64)]
    pub addr: u64,

    /// Number of bytes.
    #[arg(value_parser = parse::u32)]
    pub len: u32,

    /// Save the raw bytes to a file instead of printing them.
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Arguments for buffer writes.
#[derive(Debug, clap::Args)]
pub struct WriteBuf {
    /// Start address (a kernel token for `kern-write`).
    #[arg(value_parser = parse::u64)]
    pub addr: u64,

    #[command(flatten)]
    pub data: DataArg,
}

/// A co-processor register, as in `MRC p15, opc1, rX, crn, crm, opc2`.
#[derive(Debug, clap::Args)]
pub struct CoProcArgs {
    /// Co-processor number.
    pub coproc: u8,
    /// Primary register.
    pub crn: u8,
    /// Secondary register.
    pub crm: u8,
    /// First opcode.
    pub opc1: u8,
    /// Second opcode.
    pub opc2: u8,
}

impl CoProcArgs {
    const fn reg(&self) -> CoProcReg {
        CoProcReg::new(self.coproc, self.crn, self.crm, self.opc1, self.opc2)
    }
}

/// Arguments for `pspproxy cm-exec`.
#[derive(Debug, clap::Args)]
pub struct CmExecArgs {
    /// Code module image.
    pub module: PathBuf,

    /// Argument registers r0..r3, in order.
    #[arg(short, long = "arg", value_parser = parse::u32)]
    pub args: Vec<u32>,

    /// How long the module may run, in milliseconds [default: request timeout].
    #[arg(long, value_name = "MS")]
    pub run_timeout_ms: Option<u64>,
}

/// Target operations.
#[derive(Debug, clap::Subcommand)]
pub enum Access {
    /// Show what the target reported at connect time.
    Info,

    /// Read an SMN register through a PSP.
    SmnRead {
        /// CCD whose PSP performs the access [default: --ccd].
        #[arg(long)]
        die: Option<u32>,
        #[command(flatten)]
        reg: ReadReg,
    },

    /// Write an SMN register through a PSP.
    SmnWrite {
        /// CCD whose PSP performs the access [default: --ccd].
        #[arg(long)]
        die: Option<u32>,
        #[command(flatten)]
        reg: WriteReg,
    },

    /// Read PSP SRAM.
    MemRead(ReadBuf),

    /// Write PSP SRAM.
    MemWrite(WriteBuf),

    /// Read a PSP MMIO register.
    MmioRead(ReadReg),

    /// Write a PSP MMIO register.
    MmioWrite(WriteReg),

    /// Read x86 physical memory through the PSP.
    X86MemRead(ReadBuf),

    /// Write x86 physical memory through the PSP.
    X86MemWrite(WriteBuf),

    /// Read x86 MMIO through the PSP.
    X86MmioRead(ReadReg),

    /// Write x86 MMIO through the PSP.
    X86MmioWrite(WriteReg),

    /// Read a co-processor register.
    CoprocRead(CoProcArgs),

    /// Write a co-processor register.
    CoprocWrite {
        #[command(flatten)]
        reg: CoProcArgs,
        /// Value to write.
        #[arg(value_parser = parse::u32)]
        value: u32,
    },

    /// Issue a supervisor call and print r0.
    Svc {
        /// Syscall number.
        #[arg(value_parser = parse::u32)]
        syscall: u32,
        /// Argument registers r0..r3; missing ones are zero.
        #[arg(value_parser = parse::u32)]
        args: Vec<u32>,
    },

    /// Read an SMN register from the host side.
    X86SmnRead {
        /// Host node.
        #[arg(long, default_value_t = 0, value_parser = parse::u16)]
        node: u16,
        #[command(flatten)]
        reg: ReadReg,
    },

    /// Write an SMN register from the host side.
    X86SmnWrite {
        /// Host node.
        #[arg(long, default_value_t = 0, value_parser = parse::u16)]
        node: u16,
        #[command(flatten)]
        reg: WriteReg,
    },

    /// Allocate host kernel memory.
    Alloc {
        /// Bytes to allocate.
        #[arg(value_parser = parse::u32)]
        len: u32,
    },

    /// Free host kernel memory.
    Free {
        /// Token returned by `alloc`.
        #[arg(value_parser = parse::u64)]
        token: u64,
    },

    /// Read host kernel memory by token.
    KernRead(ReadBuf),

    /// Write host kernel memory by token.
    KernWrite(WriteBuf),

    /// Read host physical memory.
    PhysRead(ReadBuf),

    /// Write host physical memory.
    PhysWrite(WriteBuf),

    /// Load and run a code module with the terminal attached.
    CmExec(CmExecArgs),
}

/// Fills r0..r3 from up to four values.
fn registers(values: &[u32]) -> Result<[u32; 4]> {
    if values.len() > 4 {
        bail!("at most 4 argument registers, got {}", values.len());
    }
    let mut regs = [0; 4];
    regs[..values.len()].copy_from_slice(values);
    Ok(regs)
}

impl Access {
    /// Whether the command needs stdin and stdout wired to the target.
    pub const fn wants_console(&self) -> bool {
        matches!(self, Self::CmExec(_))
    }

    /// Runs the command and writes its result to `out`.
    pub fn run(self, psp: &mut Session, format: OutputFormat, out: &mut impl Write) -> Result<()> {
        let ccd = psp.ccd();
        match self {
            Self::Info => {
                let info = *psp.target_info();
                if format == OutputFormat::Json {
                    let obj = json!({
                        "max_pdu": info.max_pdu,
                        "scratch_addr": info.scratch_addr,
                        "scratch_len": info.scratch_len,
                        "sockets": info.sockets,
                        "ccds_per_socket": info.ccds_per_socket,
                        "ccd": ccd,
                    });
                    writeln!(out, "{}", serde_json::to_string_pretty(&obj)?)?;
                    return Ok(());
                }
                writeln!(out, "sockets:         {}", info.sockets)?;
                writeln!(out, "CCDs per socket: {}", info.ccds_per_socket)?;
                writeln!(out, "max PDU:         {} bytes", info.max_pdu)?;
                writeln!(
                    out,
                    "scratch:         {:#x} ({} bytes)",
                    info.scratch_addr, info.scratch_len
                )?;
                writeln!(out, "selected CCD:    {ccd}")?;
                Ok(())
            }
            Self::SmnRead { die, reg } => {
                let v = psp.read_smn(die.unwrap_or(ccd), addr32(reg.addr)?, reg.size)?;
                emit_value(out, format, v, reg.size)
            }
            Self::SmnWrite { die, reg } => {
                psp.write_smn(die.unwrap_or(ccd), addr32(reg.addr)?, reg.size, reg.value)?;
                Ok(())
            }
            Self::MemRead(a) => {
                let data = psp.read_mem(addr32(a.addr)?, a.len)?;
                emit_data(out, format, &a, &data)
            }
            Self::MemWrite(a) => Ok(psp.write_mem(addr32(a.addr)?, &a.data.load()?)?),
            Self::MmioRead(r) => {
                let v = psp.read_mmio(addr32(r.addr)?, r.size)?;
                emit_value(out, format, v, r.size)
            }
            Self::MmioWrite(r) => Ok(psp.write_mmio(addr32(r.addr)?, r.size, r.value)?),
            Self::X86MemRead(a) => {
                let data = psp.read_x86_mem(a.addr, a.len)?;
                emit_data(out, format, &a, &data)
            }
            Self::X86MemWrite(a) => Ok(psp.write_x86_mem(a.addr, &a.data.load()?)?),
            Self::X86MmioRead(r) => {
                let v = psp.read_x86_mmio(r.addr, r.size)?;
                emit_value(out, format, v, r.size)
            }
            Self::X86MmioWrite(r) => Ok(psp.write_x86_mmio(r.addr, r.size, r.value)?),
            Self::CoprocRead(c) => {
                let v = psp.read_coproc(c.reg())?;
                emit_value(out, format, u64::from(v), 4)
            }
            Self::CoprocWrite { reg, value } => Ok(psp.write_coproc(reg.reg(), value)?),
            Self::Svc { syscall, args } => {
                let r0 = psp.call_svc(syscall, registers(&args)?)?;
                emit_value(out, format, u64::from(r0), 4)
            }
            Self::X86SmnRead { node, reg } => {
                let v = psp.read_x86_smn(node, addr32(reg.addr)?, reg.size)?;
                emit_value(out, format, v, reg.size)
            }
            Self::X86SmnWrite { node, reg } => {
                Ok(psp.write_x86_smn(node, addr32(reg.addr)?, reg.size, reg.value)?)
            }
            Self::Alloc { len } => {
                let a = psp.alloc_x86_mem(len)?;
                if format == OutputFormat::Json {
                    writeln!(out, "{}", json!({ "token": a.token, "phys": a.phys, "len": len }))?;
                } else {
                    writeln!(out, "token {:#x} phys {:#x} ({len} bytes)", a.token, a.phys)?;
                }
                Ok(())
            }
            Self::Free { token } => Ok(psp.free_x86_mem(token)?),
            Self::KernRead(a) => {
                let data = psp.read_x86_kern_mem(a.addr, a.len)?;
                emit_data(out, format, &a, &data)
            }
            Self::KernWrite(a) => Ok(psp.write_x86_kern_mem(a.addr, &a.data.load()?)?),
            Self::PhysRead(a) => {
                let data = psp.read_x86_phys_mem(a.addr, a.len)?;
                emit_data(out, format, &a, &data)
            }
            Self::PhysWrite(a) => Ok(psp.write_x86_phys_mem(a.addr, &a.data.load()?)?),
            Self::CmExec(a) => {
                let image = std::fs::read(&a.module)
                    .with_context(|| format!("reading {}", a.module.display()))?;
                let regs = registers(&a.args)?;
                psp.load_code_module(&image)?;
                let r0 = psp.exec_code_module(regs, a.run_timeout_ms.map(Duration::from_millis))?;
                emit_value(out, format, u64::from(r0), 4)
            }
        }
    }
}

/// Prints a register value.
fn emit_value(out: &mut impl Write, format: OutputFormat, value: u64, size: u32) -> Result<()> {
    match format {
        OutputFormat::Json => writeln!(out, "{}", json!({ "value": value }))?,
        OutputFormat::Table => writeln!(out, "{}", register(value, size))?,
    }
    Ok(())
}

/// Prints or saves a buffer.
fn emit_data(out: &mut impl Write, format: OutputFormat, args: &ReadBuf, data: &[u8]) -> Result<()> {
    if let Some(path) = &args.out {
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
        return Ok(());
    }
    match format {
        OutputFormat::Json => writeln!(
            out,
            "{}",
            json!({ "addr": args.addr, "data": hex::encode(data) })
        )?,
        OutputFormat::Table => hexdump(out, args.addr, data)?,
    }
    Ok(())
}
