//! In-memory PSP target.
//!
//! [`SimTarget`] answers every request of the protocol from sparse byte
//! memories, so hosts can be developed and tested without hardware. State
//! outlives connections: a host that reconnects sees what it wrote before.

use std::collections::HashMap;
use std::time::Instant;

use pspproxy_proto::{
    CoProcReg, FOOTER_LEN, HEADER_LEN, MAX_PDU, Message, MsgId, Notification, Op, Pdu, PspAddr,
    R0Ptr, Request, Response, Scalar, TargetInfo, Width, X86PAddr, rc,
};
use tracing::{debug, warn};

/// PSP SRAM size per CCD.
pub const SRAM_LEN: u32 = 256 * 1024;

/// Value returned by syscall [`SVC_VERSION`].
pub const STUB_VERSION: u32 = 0x0001_0000;

/// Syscall returning [`STUB_VERSION`].
pub const SVC_VERSION: u32 = 0;

/// Syscall returning the wrapping sum of r0..r3 and logging it.
pub const SVC_SUM: u32 = 1;

/// Reply payload bytes not available to read data.
const REPLY_OVERHEAD: usize = 32;

/// Page granularity of [`SparseMem`].
const PAGE_LEN: u64 = 4096;

/// Upper bound on outstanding host allocations.
const ALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// First kernel-virtual address handed out as an allocation token.
const KERN_BASE: R0Ptr = 0xffff_8880_0000_0000;

/// First physical address backing host allocations.
const ALLOC_PHYS_BASE: X86PAddr = 0x1_0000_0000;

/// Default geometry: one socket with two CCDs and a 32 KiB scratch area at
/// the top of SRAM.
pub const DEFAULT_INFO: TargetInfo = TargetInfo {
    max_pdu: 4096,
    scratch_addr: SRAM_LEN - 0x8000,
    scratch_len: 0x8000,
    sockets: 1,
    ccds_per_socket: 2,
};

/// Byte-addressable memory that reads zero where nothing was written.
#[derive(Debug, Default, Clone)]
struct SparseMem {
    /// Written pages keyed by page number.
    pages: HashMap<u64, Box<[u8]>>,
}

impl SparseMem {
    /// Reads `len` bytes at `addr`, wrapping at the end of the address space.
    fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let a = addr.wrapping_add(i);
                self.pages
                    .get(&(a / PAGE_LEN))
                    .map_or(0, |page| page[(a % PAGE_LEN) as usize])
            })
            .collect()
    }

    /// Stores `data` at `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) {
        for (i, &b) in (0u64..).zip(data) {
            let a = addr.wrapping_add(i);
            let page = self
                .pages
                .entry(a / PAGE_LEN)
                .or_insert_with(|| vec![0; PAGE_LEN as usize].into_boxed_slice());
            page[(a % PAGE_LEN) as usize] = b;
        }
    }

    /// Reads a scalar of `width` at `addr`.
    fn read_scalar(&self, addr: u64, width: Width) -> Scalar {
        let mut raw = [0u8; 8];
        raw[..width.bytes()].copy_from_slice(&self.read(addr, width.bytes()));
        Scalar::truncate(width, u64::from_le_bytes(raw))
    }

    /// Stores a scalar at `addr`.
    fn write_scalar(&mut self, addr: u64, value: Scalar) {
        self.write(addr, &value.to_le_bytes());
    }
}

/// A host allocation.
#[derive(Debug, Clone, Copy)]
struct Alloc {
    /// Physical base address.
    phys: X86PAddr,
    /// Length in bytes.
    len: u64,
}

/// Simulated PSP target.
#[derive(Debug)]
pub struct SimTarget {
    /// Geometry reported at connect time.
    info: TargetInfo,
    /// Sequence number of the last PDU sent.
    tx_seq: u32,
    /// Beacons sent so far.
    beacons: u32,
    /// Start time, for PDU timestamps.
    epoch: Instant,
    /// PSP SRAM per CCD.
    sram: HashMap<u32, SparseMem>,
    /// PSP MMIO per CCD.
    mmio: HashMap<u32, SparseMem>,
    /// SMN space per target CCD.
    smn: HashMap<u32, SparseMem>,
    /// SMN space per host node.
    x86_smn: HashMap<u16, SparseMem>,
    /// x86 physical memory, shared by PSP and host accesses.
    x86_mem: SparseMem,
    /// x86 MMIO space.
    x86_mmio: SparseMem,
    /// Co-processor registers per CCD.
    coproc: HashMap<(u32, CoProcReg), u32>,
    /// Live host allocations keyed by token.
    allocs: HashMap<R0Ptr, Alloc>,
    /// Offset of the next allocation from the token and physical bases.
    next_alloc: u64,
    /// Loaded code module image.
    code_module: Option<Vec<u8>>,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new(DEFAULT_INFO)
    }
}

impl SimTarget {
    /// Creates a target with the given geometry.
    pub fn new(info: TargetInfo) -> Self {
        Self {
            info,
            tx_seq: 0,
            beacons: 0,
            epoch: Instant::now(),
            sram: HashMap::new(),
            mmio: HashMap::new(),
            smn: HashMap::new(),
            x86_smn: HashMap::new(),
            x86_mem: SparseMem::default(),
            x86_mmio: SparseMem::default(),
            coproc: HashMap::new(),
            allocs: HashMap::new(),
            next_alloc: 0,
            code_module: None,
        }
    }

    /// Geometry reported at connect time.
    pub const fn info(&self) -> &TargetInfo {
        &self.info
    }

    /// Emits the next beacon.
    pub fn beacon(&mut self) -> pspproxy_proto::Result<Pdu> {
        self.beacons = self.beacons.wrapping_add(1);
        let beacon = Notification::Beacon {
            count: self.beacons,
        };
        self.stamp(&beacon, 0)
    }

    /// Processes one PDU from the host and returns the PDUs to send back,
    /// notifications first and the response last.
    ///
    /// Errors mean the host sent an undecodable payload; the connection
    /// should be dropped.
    pub fn handle(&mut self, pdu: &Pdu) -> pspproxy_proto::Result<Vec<Pdu>> {
        let mut out = Vec::new();
        match pdu.id {
            MsgId::Request(op) => {
                let req: Request = pdu.decode()?;
                let mut notes = Vec::new();
                // Replies always name a CCD that exists; connect is how the
                // host learns which do.
                let (ccd, result) = if op != Op::Connect && pdu.ccd >= self.info.ccd_count() {
                    (0, Err(rc::INVALID_CCD))
                } else {
                    (pdu.ccd, self.execute(pdu.ccd, req, &mut notes))
                };
                for note in &notes {
                    out.push(self.stamp(note, ccd)?);
                }
                match result {
                    Ok(resp) => out.push(self.stamp(&resp, ccd)?),
                    Err(code) => {
                        debug!(%op, code, "rejecting request");
                        let mut rejected = Pdu::rejected(op, ccd, code);
                        self.sequence(&mut rejected);
                        out.push(rejected);
                    }
                }
            }
            MsgId::Notification(_) => match pdu.decode::<Notification>()? {
                Notification::InBuf { id, data } => {
                    out.push(self.stamp(&Notification::OutBuf { id, data }, pdu.ccd)?);
                }
                other => warn!(id = %other.id(), "ignoring notification from host"),
            },
            other => warn!(id = %other, "ignoring unexpected PDU from host"),
        }
        Ok(out)
    }

    /// Encodes `msg` as the next outgoing PDU.
    fn stamp(&mut self, msg: &impl Message, ccd: u32) -> pspproxy_proto::Result<Pdu> {
        let mut pdu = Pdu::from_message(msg, ccd)?;
        self.sequence(&mut pdu);
        Ok(pdu)
    }

    /// Assigns sequence number and timestamp.
    fn sequence(&mut self, pdu: &mut Pdu) {
        self.tx_seq = self.tx_seq.wrapping_add(1);
        pdu.seq = self.tx_seq;
        pdu.timestamp_ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
    }

    /// Carries out one request for CCD `ccd`.
    fn execute(
        &mut self,
        ccd: u32,
        req: Request,
        notes: &mut Vec<Notification>,
    ) -> Result<Response, i32> {
        Ok(match req {
            Request::Connect => Response::Connect(self.info),
            Request::PspSmnRead {
                ccd_tgt,
                addr,
                width,
            } => Response::PspSmnRead {
                value: self.smn_space(ccd_tgt)?.read_scalar(u64::from(addr), width),
            },
            Request::PspSmnWrite {
                ccd_tgt,
                addr,
                value,
            } => {
                self.smn_space(ccd_tgt)?.write_scalar(u64::from(addr), value);
                Response::PspSmnWrite
            }
            Request::PspMemRead { addr, len } => {
                self.check_reply(len)?;
                check_sram(addr, len)?;
                Response::PspMemRead {
                    data: self.sram.entry(ccd).or_default().read(u64::from(addr), len as usize),
                }
            }
            Request::PspMemWrite { addr, data } => {
                check_sram(addr, data_len(&data))?;
                self.sram.entry(ccd).or_default().write(u64::from(addr), &data);
                Response::PspMemWrite
            }
            Request::PspMmioRead { addr, width } => Response::PspMmioRead {
                value: self.mmio.entry(ccd).or_default().read_scalar(u64::from(addr), width),
            },
            Request::PspMmioWrite { addr, value } => {
                self.mmio.entry(ccd).or_default().write_scalar(u64::from(addr), value);
                Response::PspMmioWrite
            }
            Request::PspX86MemRead { addr, len } => {
                self.check_reply(len)?;
                Response::PspX86MemRead {
                    data: self.x86_mem.read(addr, len as usize),
                }
            }
            Request::PspX86MemWrite { addr, data } => {
                self.x86_mem.write(addr, &data);
                Response::PspX86MemWrite
            }
            Request::PspX86MmioRead { addr, width } => Response::PspX86MmioRead {
                value: self.x86_mmio.read_scalar(addr, width),
            },
            Request::PspX86MmioWrite { addr, value } => {
                self.x86_mmio.write_scalar(addr, value);
                Response::PspX86MmioWrite
            }
            Request::CoProcRead { reg } => {
                reg.validate().map_err(|_| rc::INVALID_PARAMETER)?;
                Response::CoProcRead {
                    value: self.coproc.get(&(ccd, reg)).copied().unwrap_or(0),
                }
            }
            Request::CoProcWrite { reg, value } => {
                reg.validate().map_err(|_| rc::INVALID_PARAMETER)?;
                self.coproc.insert((ccd, reg), value);
                Response::CoProcWrite
            }
            Request::SvcCall { syscall, args } => Response::SvcCall {
                r0: svc(syscall, args, notes)?,
            },
            Request::X86SmnRead { node, addr, width } => Response::X86SmnRead {
                value: self.node_space(node)?.read_scalar(u64::from(addr), width),
            },
            Request::X86SmnWrite { node, addr, value } => {
                self.node_space(node)?.write_scalar(u64::from(addr), value);
                Response::X86SmnWrite
            }
            Request::X86MemAlloc { len } => {
                let (token, phys) = self.alloc(len)?;
                Response::X86MemAlloc { token, phys }
            }
            Request::X86MemFree { token } => {
                self.allocs.remove(&token).ok_or(rc::INVALID_TOKEN)?;
                Response::X86MemFree
            }
            Request::X86MemRead { token, len } => {
                self.check_reply(len)?;
                let phys = self.resolve(token, u64::from(len))?;
                Response::X86MemRead {
                    data: self.x86_mem.read(phys, len as usize),
                }
            }
            Request::X86MemWrite { token, data } => {
                let phys = self.resolve(token, u64::from(data_len(&data)))?;
                self.x86_mem.write(phys, &data);
                Response::X86MemWrite
            }
            Request::X86PhysMemRead { addr, len } => {
                self.check_reply(len)?;
                Response::X86PhysMemRead {
                    data: self.x86_mem.read(addr, len as usize),
                }
            }
            Request::X86PhysMemWrite { addr, data } => {
                self.x86_mem.write(addr, &data);
                Response::X86PhysMemWrite
            }
            Request::CodeModLoad { image } => {
                if image.is_empty() {
                    return Err(rc::INVALID_PARAMETER);
                }
                if data_len(&image) > self.info.scratch_len {
                    return Err(rc::NO_MEMORY);
                }
                self.sram
                    .entry(ccd)
                    .or_default()
                    .write(u64::from(self.info.scratch_addr), &image);
                self.code_module = Some(image);
                Response::CodeModLoad
            }
            Request::CodeModExec { args } => {
                let image = self.code_module.as_ref().ok_or(rc::NO_CODE_MODULE)?;
                let r0 = image.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
                notes.push(Notification::LogMsg {
                    msg: format!("code module: {} bytes, args {args:x?}", image.len()),
                });
                notes.push(Notification::OutBuf {
                    id: 0,
                    data: b"code module running\n".to_vec(),
                });
                Response::CodeModExec { r0 }
            }
            _ => return Err(rc::UNSUPPORTED),
        })
    }

    /// SMN space of CCD `ccd_tgt`.
    fn smn_space(&mut self, ccd_tgt: u32) -> Result<&mut SparseMem, i32> {
        if ccd_tgt >= self.info.ccd_count() {
            return Err(rc::INVALID_CCD);
        }
        Ok(self.smn.entry(ccd_tgt).or_default())
    }

    /// SMN space of host node `node`.
    fn node_space(&mut self, node: u16) -> Result<&mut SparseMem, i32> {
        if u32::from(node) >= self.info.sockets {
            return Err(rc::INVALID_PARAMETER);
        }
        Ok(self.x86_smn.entry(node).or_default())
    }

    /// Reserves `len` bytes of host memory.
    fn alloc(&mut self, len: u32) -> Result<(R0Ptr, X86PAddr), i32> {
        if len == 0 {
            return Err(rc::INVALID_PARAMETER);
        }
        let len = u64::from(len);
        let used: u64 = self.allocs.values().map(|a| a.len).sum();
        if used + len > ALLOC_LIMIT {
            return Err(rc::NO_MEMORY);
        }
        let offset = self.next_alloc;
        self.next_alloc += len.div_ceil(PAGE_LEN) * PAGE_LEN;
        let token = KERN_BASE + offset;
        let phys = ALLOC_PHYS_BASE + offset;
        self.allocs.insert(token, Alloc { phys, len });
        Ok((token, phys))
    }

    /// Rejects reads whose data would not fit in one reply PDU.
    fn check_reply(&self, len: u32) -> Result<(), i32> {
        let pdu = usize::try_from(self.info.max_pdu)
            .unwrap_or(MAX_PDU)
            .min(MAX_PDU);
        let room = pdu.saturating_sub(HEADER_LEN + FOOTER_LEN + REPLY_OVERHEAD);
        match usize::try_from(len) {
            Ok(len) if len <= room => Ok(()),
            _ => Err(rc::INVALID_PARAMETER),
        }
    }

    /// Translates a kernel-virtual range to physical, if it lies inside one
    /// live allocation.
    fn resolve(&self, token: R0Ptr, len: u64) -> Result<X86PAddr, i32> {
        self.allocs
            .iter()
            .find_map(|(&base, a)| {
                let off = token.checked_sub(base)?;
                (off.checked_add(len)? <= a.len).then_some(a.phys + off)
            })
            .ok_or(rc::INVALID_TOKEN)
    }
}

/// Rejects ranges that fall outside PSP SRAM.
fn check_sram(addr: PspAddr, len: u32) -> Result<(), i32> {
    match addr.checked_add(len) {
        Some(end) if end <= SRAM_LEN => Ok(()),
        _ => Err(rc::INVALID_ADDRESS),
    }
}

/// Length of a payload buffer; bounded by the PDU size.
fn data_len(data: &[u8]) -> u32 {
    u32::try_from(data.len()).unwrap_or(u32::MAX)
}

/// Supervisor call dispatch.
fn svc(syscall: u32, args: [u32; 4], notes: &mut Vec<Notification>) -> Result<u32, i32> {
    match syscall {
        SVC_VERSION => Ok(STUB_VERSION),
        SVC_SUM => {
            let sum = args.iter().fold(0u32, |acc, &a| acc.wrapping_add(a));
            notes.push(Notification::LogMsg {
                msg: format!("svc {SVC_SUM}: sum = {sum:#x}"),
            });
            Ok(sum)
        }
        _ => Err(rc::UNSUPPORTED),
    }
}
