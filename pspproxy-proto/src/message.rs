//! Message types carried in PDU payloads.
//!
//! A PDU header names its payload with a [`MsgId`]: a class (request,
//! response or notification) in the upper half-word and an operation or
//! notification code in the lower one. Requests and their responses share an
//! [`Op`] code.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::scalar::{Scalar, Width};

/// Address on the System Management Network.
pub type SmnAddr = u32;
/// Address in the PSP's local address space.
pub type PspAddr = u32;
/// x86 physical address.
pub type X86PAddr = u64;
/// Kernel-virtual address of a host-side allocation, used as its token.
pub type R0Ptr = u64;

/// Status codes a target reports in the header of a rejected response.
pub mod rc {
    /// The request was carried out.
    pub const SUCCESS: i32 = 0;
    /// An operand is malformed or out of range.
    pub const INVALID_PARAMETER: i32 = 1;
    /// The address range is not backed by anything.
    pub const INVALID_ADDRESS: i32 = 2;
    /// The PDU names a CCD the target does not have.
    pub const INVALID_CCD: i32 = 3;
    /// The allocation token is unknown or already freed.
    pub const INVALID_TOKEN: i32 = 4;
    /// The target ran out of memory for the request.
    pub const NO_MEMORY: i32 = 5;
    /// The request is understood but not supported.
    pub const UNSUPPORTED: i32 = 6;
    /// Execution requested before a code module was loaded.
    pub const NO_CODE_MODULE: i32 = 7;
}

/// Class code for requests (host to target).
const CLASS_REQUEST: u32 = 1;
/// Class code for responses (target to host).
const CLASS_RESPONSE: u32 = 2;
/// Class code for notifications (either direction).
const CLASS_NOTIFICATION: u32 = 3;

/// Operation codes shared by a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum Op {
    /// Session handshake.
    Connect = 1,
    /// SMN read issued by the PSP.
    PspSmnRead,
    /// SMN write issued by the PSP.
    PspSmnWrite,
    /// PSP SRAM read.
    PspMemRead,
    /// PSP SRAM write.
    PspMemWrite,
    /// PSP MMIO register read.
    PspMmioRead,
    /// PSP MMIO register write.
    PspMmioWrite,
    /// x86 memory read through the PSP.
    PspX86MemRead,
    /// x86 memory write through the PSP.
    PspX86MemWrite,
    /// x86 MMIO read through the PSP.
    PspX86MmioRead,
    /// x86 MMIO write through the PSP.
    PspX86MmioWrite,
    /// Co-processor register read.
    CoProcRead,
    /// Co-processor register write.
    CoProcWrite,
    /// Supervisor call on the PSP.
    SvcCall,
    /// SMN read issued by the host CPU.
    X86SmnRead,
    /// SMN write issued by the host CPU.
    X86SmnWrite,
    /// Host kernel memory allocation.
    X86MemAlloc,
    /// Host kernel memory release.
    X86MemFree,
    /// Host kernel memory read.
    X86MemRead,
    /// Host kernel memory write.
    X86MemWrite,
    /// Host physical memory read.
    X86PhysMemRead,
    /// Host physical memory write.
    X86PhysMemWrite,
    /// Code module upload.
    CodeModLoad,
    /// Code module execution.
    CodeModExec,
}

impl Op {
    /// Every operation, in code order.
    pub const ALL: [Self; 24] = [
        Self::Connect,
        Self::PspSmnRead,
        Self::PspSmnWrite,
        Self::PspMemRead,
        Self::PspMemWrite,
        Self::PspMmioRead,
        Self::PspMmioWrite,
        Self::PspX86MemRead,
        Self::PspX86MemWrite,
        Self::PspX86MmioRead,
        Self::PspX86MmioWrite,
        Self::CoProcRead,
        Self::CoProcWrite,
        Self::SvcCall,
        Self::X86SmnRead,
        Self::X86SmnWrite,
        Self::X86MemAlloc,
        Self::X86MemFree,
        Self::X86MemRead,
        Self::X86MemWrite,
        Self::X86PhysMemRead,
        Self::X86PhysMemWrite,
        Self::CodeModLoad,
        Self::CodeModExec,
    ];

    /// Looks up an operation by its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u16 == code)
    }

    /// Kebab-case name used in logs and errors.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::PspSmnRead => "psp-smn-read",
            Self::PspSmnWrite => "psp-smn-write",
            Self::PspMemRead => "psp-mem-read",
            Self::PspMemWrite => "psp-mem-write",
            Self::PspMmioRead => "psp-mmio-read",
            Self::PspMmioWrite => "psp-mmio-write",
            Self::PspX86MemRead => "psp-x86-mem-read",
            Self::PspX86MemWrite => "psp-x86-mem-write",
            Self::PspX86MmioRead => "psp-x86-mmio-read",
            Self::PspX86MmioWrite => "psp-x86-mmio-write",
            Self::CoProcRead => "coproc-read",
            Self::CoProcWrite => "coproc-write",
            Self::SvcCall => "svc-call",
            Self::X86SmnRead => "x86-smn-read",
            Self::X86SmnWrite => "x86-smn-write",
            Self::X86MemAlloc => "x86-mem-alloc",
            Self::X86MemFree => "x86-mem-free",
            Self::X86MemRead => "x86-mem-read",
            Self::X86MemWrite => "x86-mem-write",
            Self::X86PhysMemRead => "x86-phys-mem-read",
            Self::X86PhysMemWrite => "x86-phys-mem-write",
            Self::CodeModLoad => "code-mod-load",
            Self::CodeModExec => "code-mod-exec",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unsolicited message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum NotifyKind {
    /// Periodic liveness counter from the target.
    Beacon = 1,
    /// Log line from the target firmware.
    LogMsg,
    /// Data for one of the host's output buffers.
    OutBuf,
    /// Data from one of the host's input buffers.
    InBuf,
}

impl NotifyKind {
    /// Every notification kind, in code order.
    pub const ALL: [Self; 4] = [Self::Beacon, Self::LogMsg, Self::OutBuf, Self::InBuf];

    /// Looks up a notification kind by its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u16 == code)
    }
}

/// Message id carried in every PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MsgId {
    /// A request for `Op`.
    Request(Op),
    /// The response to a request for `Op`.
    Response(Op),
    /// An unsolicited notification.
    Notification(NotifyKind),
}

impl MsgId {
    /// Packs the id into its 32-bit wire form.
    pub const fn to_u32(self) -> u32 {
        let (class, code) = match self {
            Self::Request(op) => (CLASS_REQUEST, op as u16),
            Self::Response(op) => (CLASS_RESPONSE, op as u16),
            Self::Notification(kind) => (CLASS_NOTIFICATION, kind as u16),
        };
        (class << 16) | code as u32
    }

    /// Unpacks a wire id, or `None` if the class or code is unknown.
    pub fn from_u32(raw: u32) -> Option<Self> {
        let code = u16::try_from(raw & 0xffff).ok()?;
        match raw >> 16 {
            CLASS_REQUEST => Op::from_code(code).map(Self::Request),
            CLASS_RESPONSE => Op::from_code(code).map(Self::Response),
            CLASS_NOTIFICATION => NotifyKind::from_code(code).map(Self::Notification),
            _ => None,
        }
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(op) => write!(f, "{op} request"),
            Self::Response(op) => write!(f, "{op} response"),
            Self::Notification(kind) => write!(f, "{kind:?} notification"),
        }
    }
}

/// A payload type that knows which header id it travels under.
pub trait Message: Serialize + DeserializeOwned {
    /// Header id for this message.
    fn id(&self) -> MsgId;
}

/// Identifies one co-processor register (`MRC`/`MCR` operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoProcReg {
    /// Co-processor number, 0..=15.
    pub coproc: u8,
    /// Primary register, 0..=15.
    pub crn: u8,
    /// Additional register, 0..=15.
    pub crm: u8,
    /// First opcode, 0..=7.
    pub opc1: u8,
    /// Second opcode, 0..=7.
    pub opc2: u8,
}

impl CoProcReg {
    /// Builds a register selector without checking ranges.
    pub const fn new(coproc: u8, crn: u8, crm: u8, opc1: u8, opc2: u8) -> Self {
        Self {
            coproc,
            crn,
            crm,
            opc1,
            opc2,
        }
    }

    /// Checks every operand against its encodable range.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value, max) in [
            ("coprocessor", self.coproc, 15),
            ("crn", self.crn, 15),
            ("crm", self.crm, 15),
            ("opc1", self.opc1, 7),
            ("opc2", self.opc2, 7),
        ] {
            if value > max {
                return Err(format!("{name} {value} out of range 0..={max}"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CoProcReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p{}, {}, c{}, c{}, {}",
            self.coproc, self.opc1, self.crn, self.crm, self.opc2
        )
    }
}

/// Target description returned by the connect handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Largest PDU the target accepts, header and footer included.
    pub max_pdu: u32,
    /// PSP address of the scratch area code modules are loaded to.
    pub scratch_addr: PspAddr,
    /// Size of the scratch area in bytes.
    pub scratch_len: u32,
    /// Number of sockets in the system.
    pub sockets: u32,
    /// CCDs per socket.
    pub ccds_per_socket: u32,
}

impl TargetInfo {
    /// Total CCD count across all sockets.
    pub const fn ccd_count(&self) -> u32 {
        self.sockets.saturating_mul(self.ccds_per_socket)
    }
}

/// Requests sent from host to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Request {
    /// Opens the session; answered with [`TargetInfo`].
    Connect,
    /// Reads an SMN register through the PSP of `ccd_tgt`.
    PspSmnRead {
        /// CCD whose SMN is addressed.
        ccd_tgt: u32,
        /// Register address.
        addr: SmnAddr,
        /// Access width.
        width: Width,
    },
    /// Writes an SMN register through the PSP of `ccd_tgt`.
    PspSmnWrite {
        /// CCD whose SMN is addressed.
        ccd_tgt: u32,
        /// Register address.
        addr: SmnAddr,
        /// Value to store.
        value: Scalar,
    },
    /// Reads PSP SRAM.
    PspMemRead {
        /// Start address.
        addr: PspAddr,
        /// Byte count.
        len: u32,
    },
    /// Writes PSP SRAM.
    PspMemWrite {
        /// Start address.
        addr: PspAddr,
        /// Bytes to store.
        data: Vec<u8>,
    },
    /// Reads a PSP MMIO register.
    PspMmioRead {
        /// Register address.
        addr: PspAddr,
        /// Access width.
        width: Width,
    },
    /// Writes a PSP MMIO register.
    PspMmioWrite {
        /// Register address.
        addr: PspAddr,
        /// Value to store.
        value: Scalar,
    },
    /// Reads x86 memory through the PSP.
    PspX86MemRead {
        /// Start address.
        addr: X86PAddr,
        /// Byte count.
        len: u32,
    },
    /// Writes x86 memory through the PSP.
    PspX86MemWrite {
        /// Start address.
        addr: X86PAddr,
        /// Bytes to store.
        data: Vec<u8>,
    },
    /// Reads x86 MMIO through the PSP.
    PspX86MmioRead {
        /// Register address.
        addr: X86PAddr,
        /// Access width.
        width: Width,
    },
    /// Writes x86 MMIO through the PSP.
    PspX86MmioWrite {
        /// Register address.
        addr: X86PAddr,
        /// Value to store.
        value: Scalar,
    },
    /// Reads a co-processor register.
    CoProcRead {
        /// Register selector.
        reg: CoProcReg,
    },
    /// Writes a co-processor register.
    CoProcWrite {
        /// Register selector.
        reg: CoProcReg,
        /// Value to store.
        value: u32,
    },
    /// Issues a supervisor call on the PSP.
    SvcCall {
        /// Syscall number.
        syscall: u32,
        /// Arguments in r0..r3.
        args: [u32; 4],
    },
    /// Reads an SMN register from the host CPU side.
    X86SmnRead {
        /// Node (die) index.
        node: u16,
        /// Register address.
        addr: SmnAddr,
        /// Access width.
        width: Width,
    },
    /// Writes an SMN register from the host CPU side.
    X86SmnWrite {
        /// Node (die) index.
        node: u16,
        /// Register address.
        addr: SmnAddr,
        /// Value to store.
        value: Scalar,
    },
    /// Allocates host kernel memory.
    X86MemAlloc {
        /// Bytes to allocate.
        len: u32,
    },
    /// Frees a host kernel allocation.
    X86MemFree {
        /// Token returned by the allocation.
        token: R0Ptr,
    },
    /// Reads host kernel memory.
    X86MemRead {
        /// Kernel-virtual start address inside an allocation.
        token: R0Ptr,
        /// Byte count.
        len: u32,
    },
    /// Writes host kernel memory.
    X86MemWrite {
        /// Kernel-virtual start address inside an allocation.
        token: R0Ptr,
        /// Bytes to store.
        data: Vec<u8>,
    },
    /// Reads host physical memory.
    X86PhysMemRead {
        /// Start address.
        addr: X86PAddr,
        /// Byte count.
        len: u32,
    },
    /// Writes host physical memory.
    X86PhysMemWrite {
        /// Start address.
        addr: X86PAddr,
        /// Bytes to store.
        data: Vec<u8>,
    },
    /// Uploads a code module image to the scratch area.
    CodeModLoad {
        /// Raw module image.
        image: Vec<u8>,
    },
    /// Runs the loaded code module.
    CodeModExec {
        /// Arguments in r0..r3.
        args: [u32; 4],
    },
}

impl Request {
    /// Operation this request invokes.
    pub const fn op(&self) -> Op {
        match self {
            Self::Connect => Op::Connect,
            Self::PspSmnRead { .. } => Op::PspSmnRead,
            Self::PspSmnWrite { .. } => Op::PspSmnWrite,
            Self::PspMemRead { .. } => Op::PspMemRead,
            Self::PspMemWrite { .. } => Op::PspMemWrite,
            Self::PspMmioRead { .. } => Op::PspMmioRead,
            Self::PspMmioWrite { .. } => Op::PspMmioWrite,
            Self::PspX86MemRead { .. } => Op::PspX86MemRead,
            Self::PspX86MemWrite { .. } => Op::PspX86MemWrite,
            Self::PspX86MmioRead { .. } => Op::PspX86MmioRead,
            Self::PspX86MmioWrite { .. } => Op::PspX86MmioWrite,
            Self::CoProcRead { .. } => Op::CoProcRead,
            Self::CoProcWrite { .. } => Op::CoProcWrite,
            Self::SvcCall { .. } => Op::SvcCall,
            Self::X86SmnRead { .. } => Op::X86SmnRead,
            Self::X86SmnWrite { .. } => Op::X86SmnWrite,
            Self::X86MemAlloc { .. } => Op::X86MemAlloc,
            Self::X86MemFree { .. } => Op::X86MemFree,
            Self::X86MemRead { .. } => Op::X86MemRead,
            Self::X86MemWrite { .. } => Op::X86MemWrite,
            Self::X86PhysMemRead { .. } => Op::X86PhysMemRead,
            Self::X86PhysMemWrite { .. } => Op::X86PhysMemWrite,
            Self::CodeModLoad { .. } => Op::CodeModLoad,
            Self::CodeModExec { .. } => Op::CodeModExec,
        }
    }
}

impl Message for Request {
    fn id(&self) -> MsgId {
        MsgId::Request(self.op())
    }
}

/// Responses sent from target to host.
///
/// A rejected request is answered with an empty payload and a non-zero
/// status in the header, so these variants only describe successes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Response {
    /// Handshake accepted.
    Connect(TargetInfo),
    /// SMN register value.
    PspSmnRead {
        /// Value read.
        value: Scalar,
    },
    /// SMN write done.
    PspSmnWrite,
    /// PSP SRAM contents.
    PspMemRead {
        /// Bytes read.
        data: Vec<u8>,
    },
    /// PSP SRAM write done.
    PspMemWrite,
    /// PSP MMIO register value.
    PspMmioRead {
        /// Value read.
        value: Scalar,
    },
    /// PSP MMIO write done.
    PspMmioWrite,
    /// x86 memory contents.
    PspX86MemRead {
        /// Bytes read.
        data: Vec<u8>,
    },
    /// x86 memory write done.
    PspX86MemWrite,
    /// x86 MMIO register value.
    PspX86MmioRead {
        /// Value read.
        value: Scalar,
    },
    /// x86 MMIO write done.
    PspX86MmioWrite,
    /// Co-processor register value.
    CoProcRead {
        /// Value read.
        value: u32,
    },
    /// Co-processor write done.
    CoProcWrite,
    /// Supervisor call finished.
    SvcCall {
        /// r0 after the call.
        r0: u32,
    },
    /// Host-side SMN register value.
    X86SmnRead {
        /// Value read.
        value: Scalar,
    },
    /// Host-side SMN write done.
    X86SmnWrite,
    /// Host kernel memory allocated.
    X86MemAlloc {
        /// Kernel-virtual address, used as the token.
        token: R0Ptr,
        /// Physical address of the allocation.
        phys: X86PAddr,
    },
    /// Host kernel memory freed.
    X86MemFree,
    /// Host kernel memory contents.
    X86MemRead {
        /// Bytes read.
        data: Vec<u8>,
    },
    /// Host kernel memory write done.
    X86MemWrite,
    /// Host physical memory contents.
    X86PhysMemRead {
        /// Bytes read.
        data: Vec<u8>,
    },
    /// Host physical memory write done.
    X86PhysMemWrite,
    /// Code module stored.
    CodeModLoad,
    /// Code module returned.
    CodeModExec {
        /// r0 on return.
        r0: u32,
    },
}

impl Response {
    /// Operation this response answers.
    pub const fn op(&self) -> Op {
        match self {
            Self::Connect(_) => Op::Connect,
            Self::PspSmnRead { .. } => Op::PspSmnRead,
            Self::PspSmnWrite => Op::PspSmnWrite,
            Self::PspMemRead { .. } => Op::PspMemRead,
            Self::PspMemWrite => Op::PspMemWrite,
            Self::PspMmioRead { .. } => Op::PspMmioRead,
            Self::PspMmioWrite => Op::PspMmioWrite,
            Self::PspX86MemRead { .. } => Op::PspX86MemRead,
            Self::PspX86MemWrite => Op::PspX86MemWrite,
            Self::PspX86MmioRead { .. } => Op::PspX86MmioRead,
            Self::PspX86MmioWrite => Op::PspX86MmioWrite,
            Self::CoProcRead { .. } => Op::CoProcRead,
            Self::CoProcWrite => Op::CoProcWrite,
            Self::SvcCall { .. } => Op::SvcCall,
            Self::X86SmnRead { .. } => Op::X86SmnRead,
            Self::X86SmnWrite => Op::X86SmnWrite,
            Self::X86MemAlloc { .. } => Op::X86MemAlloc,
            Self::X86MemFree => Op::X86MemFree,
            Self::X86MemRead { .. } => Op::X86MemRead,
            Self::X86MemWrite => Op::X86MemWrite,
            Self::X86PhysMemRead { .. } => Op::X86PhysMemRead,
            Self::X86PhysMemWrite => Op::X86PhysMemWrite,
            Self::CodeModLoad => Op::CodeModLoad,
            Self::CodeModExec { .. } => Op::CodeModExec,
        }
    }

    /// The scalar carried by a register read response.
    pub const fn scalar(&self) -> Option<Scalar> {
        match self {
            Self::PspSmnRead { value }
            | Self::PspMmioRead { value }
            | Self::PspX86MmioRead { value }
            | Self::X86SmnRead { value } => Some(*value),
            _ => None,
        }
    }

    /// The 32-bit word carried by a co-processor, svc or exec response.
    pub const fn word(&self) -> Option<u32> {
        match self {
            Self::CoProcRead { value } => Some(*value),
            Self::SvcCall { r0 } | Self::CodeModExec { r0 } => Some(*r0),
            _ => None,
        }
    }

    /// The buffer carried by a memory read response.
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Self::PspMemRead { data }
            | Self::PspX86MemRead { data }
            | Self::X86MemRead { data }
            | Self::X86PhysMemRead { data } => Some(data),
            _ => None,
        }
    }
}

impl Message for Response {
    fn id(&self) -> MsgId {
        MsgId::Response(self.op())
    }
}

/// Unsolicited messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Notification {
    /// Liveness counter; increments by one per beacon.
    Beacon {
        /// Beacons sent since the target started.
        count: u32,
    },
    /// Log line from the target.
    LogMsg {
        /// Message text.
        msg: String,
    },
    /// Data for a host output buffer.
    OutBuf {
        /// Output buffer id.
        id: u32,
        /// Bytes to append.
        data: Vec<u8>,
    },
    /// Data from a host input buffer.
    InBuf {
        /// Input buffer id.
        id: u32,
        /// Bytes read from the buffer.
        data: Vec<u8>,
    },
}

impl Message for Notification {
    fn id(&self) -> MsgId {
        MsgId::Notification(match self {
            Self::Beacon { .. } => NotifyKind::Beacon,
            Self::LogMsg { .. } => NotifyKind::LogMsg,
            Self::OutBuf { .. } => NotifyKind::OutBuf,
            Self::InBuf { .. } => NotifyKind::InBuf,
        })
    }
}
