//! Typed PSP and host operations.
//!
//! Every operation validates its arguments before anything goes on the
//! wire, so an [`Error::InvalidArgument`] never costs a round trip or
//! disturbs the PDU stream.

use std::time::Duration;

use pspproxy_proto::{
    CoProcReg, Op, PspAddr, R0Ptr, Request, Response, Scalar, SmnAddr, Width, X86PAddr,
};
use tracing::info;

use crate::error::{Error, Result};
use crate::session::{Deadline, Session};

/// A host kernel allocation made through [`Session::alloc_x86_mem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct X86Alloc {
    /// Kernel-virtual address; pass it to the kernel memory operations and
    /// to [`Session::free_x86_mem`].
    pub token: R0Ptr,
    /// Physical address of the same memory.
    pub phys: X86PAddr,
}

/// Converts a byte count into an access width.
fn width_of(size: u32) -> Result<Width> {
    Width::try_from(size)
        .map_err(|_| Error::invalid(format!("access size {size} is not 1, 2, 4 or 8")))
}

/// Error for a response that lacks the payload its op promises.
fn missing(op: Op, what: &str) -> Error {
    Error::Desync(format!("{op} response carries no {what}"))
}

impl Session {
    /// Reads an SMN register through the PSP of CCD `ccd_tgt`.
    pub fn read_smn(&mut self, ccd_tgt: u32, addr: SmnAddr, size: u32) -> Result<u64> {
        self.read_scalar(size, |width| Request::PspSmnRead {
            ccd_tgt,
            addr,
            width,
        })
    }

    /// Writes an SMN register through the PSP of CCD `ccd_tgt`.
    pub fn write_smn(&mut self, ccd_tgt: u32, addr: SmnAddr, size: u32, value: u64) -> Result<()> {
        self.write_scalar(size, value, |value| Request::PspSmnWrite {
            ccd_tgt,
            addr,
            value,
        })
    }

    /// Reads `len` bytes of PSP SRAM.
    pub fn read_mem(&mut self, addr: PspAddr, len: u32) -> Result<Vec<u8>> {
        self.read_buf(len, Request::PspMemRead { addr, len })
    }

    /// Writes PSP SRAM.
    pub fn write_mem(&mut self, addr: PspAddr, data: &[u8]) -> Result<()> {
        self.write_buf(data, |data| Request::PspMemWrite { addr, data })
    }

    /// Reads a PSP MMIO register.
    pub fn read_mmio(&mut self, addr: PspAddr, size: u32) -> Result<u64> {
        self.read_scalar(size, |width| Request::PspMmioRead { addr, width })
    }

    /// Writes a PSP MMIO register.
    pub fn write_mmio(&mut self, addr: PspAddr, size: u32, value: u64) -> Result<()> {
        self.write_scalar(size, value, |value| Request::PspMmioWrite { addr, value })
    }

    /// Reads x86 memory as the PSP sees it.
    pub fn read_x86_mem(&mut self, addr: X86PAddr, len: u32) -> Result<Vec<u8>> {
        self.read_buf(len, Request::PspX86MemRead { addr, len })
    }

    /// Writes x86 memory as the PSP sees it.
    pub fn write_x86_mem(&mut self, addr: X86PAddr, data: &[u8]) -> Result<()> {
        self.write_buf(data, |data| Request::PspX86MemWrite { addr, data })
    }

    /// Reads x86 MMIO as the PSP sees it.
    pub fn read_x86_mmio(&mut self, addr: X86PAddr, size: u32) -> Result<u64> {
        self.read_scalar(size, |width| Request::PspX86MmioRead { addr, width })
    }

    /// Writes x86 MMIO as the PSP sees it.
    pub fn write_x86_mmio(&mut self, addr: X86PAddr, size: u32, value: u64) -> Result<()> {
        self.write_scalar(size, value, |value| Request::PspX86MmioWrite { addr, value })
    }

    /// Reads a co-processor register.
    pub fn read_coproc(&mut self, reg: CoProcReg) -> Result<u32> {
        self.run(|s| {
            reg.validate().map_err(Error::InvalidArgument)?;
            s.transact(Request::CoProcRead { reg })?
                .word()
                .ok_or_else(|| missing(Op::CoProcRead, "value"))
        })
    }

    /// Writes a co-processor register.
    pub fn write_coproc(&mut self, reg: CoProcReg, value: u32) -> Result<()> {
        self.run(|s| {
            reg.validate().map_err(Error::InvalidArgument)?;
            s.transact(Request::CoProcWrite { reg, value }).map(drop)
        })
    }

    /// Issues supervisor call `syscall` with r0..r3 and returns r0.
    pub fn call_svc(&mut self, syscall: u32, args: [u32; 4]) -> Result<u32> {
        self.run(|s| {
            s.transact(Request::SvcCall { syscall, args })?
                .word()
                .ok_or_else(|| missing(Op::SvcCall, "r0"))
        })
    }

    /// Reads an SMN register from the host CPU of `node`.
    pub fn read_x86_smn(&mut self, node: u16, addr: SmnAddr, size: u32) -> Result<u64> {
        self.read_scalar(size, |width| Request::X86SmnRead { node, addr, width })
    }

    /// Writes an SMN register from the host CPU of `node`.
    pub fn write_x86_smn(&mut self, node: u16, addr: SmnAddr, size: u32, value: u64) -> Result<()> {
        self.write_scalar(size, value, |value| Request::X86SmnWrite { node, addr, value })
    }

    /// Allocates `len` bytes of host kernel memory.
    pub fn alloc_x86_mem(&mut self, len: u32) -> Result<X86Alloc> {
        self.run(|s| {
            if len == 0 {
                return Err(Error::invalid("allocation of zero bytes"));
            }
            match s.transact(Request::X86MemAlloc { len })? {
                Response::X86MemAlloc { token, phys } => {
                    info!(len, token = format_args!("{token:#x}"), "host memory allocated");
                    Ok(X86Alloc { token, phys })
                }
                _ => Err(missing(Op::X86MemAlloc, "token")),
            }
        })
    }

    /// Releases a host kernel allocation.
    pub fn free_x86_mem(&mut self, token: R0Ptr) -> Result<()> {
        self.run(|s| s.transact(Request::X86MemFree { token }).map(drop))
    }

    /// Reads host kernel memory starting at `token`.
    pub fn read_x86_kern_mem(&mut self, token: R0Ptr, len: u32) -> Result<Vec<u8>> {
        self.read_buf(len, Request::X86MemRead { token, len })
    }

    /// Writes host kernel memory starting at `token`.
    pub fn write_x86_kern_mem(&mut self, token: R0Ptr, data: &[u8]) -> Result<()> {
        self.write_buf(data, |data| Request::X86MemWrite { token, data })
    }

    /// Reads host physical memory.
    pub fn read_x86_phys_mem(&mut self, addr: X86PAddr, len: u32) -> Result<Vec<u8>> {
        self.read_buf(len, Request::X86PhysMemRead { addr, len })
    }

    /// Writes host physical memory.
    pub fn write_x86_phys_mem(&mut self, addr: X86PAddr, data: &[u8]) -> Result<()> {
        self.write_buf(data, |data| Request::X86PhysMemWrite { addr, data })
    }

    /// Uploads a code module image to the target's scratch area.
    pub fn load_code_module(&mut self, image: &[u8]) -> Result<()> {
        self.run(|s| {
            if image.is_empty() {
                return Err(Error::invalid("empty code module image"));
            }
            s.check_xfer(image.len())?;
            s.transact(Request::CodeModLoad {
                image: image.to_vec(),
            })
            .map(drop)
        })
    }

    /// Runs the loaded code module with r0..r3 and returns its r0.
    ///
    /// While it runs, data offered on input buffer 0 is forwarded to the
    /// target and output buffer writes reach the session's callbacks. With no
    /// `timeout`, the session's request timeout applies. A zero `timeout` is
    /// an invalid argument.
    pub fn exec_code_module(&mut self, args: [u32; 4], timeout: Option<Duration>) -> Result<u32> {
        self.run(|s| {
            if timeout == Some(Duration::ZERO) {
                return Err(Error::invalid("code module run timeout of zero"));
            }
            let budget = timeout.unwrap_or_else(|| s.request_timeout());
            let deadline = Deadline::new(Op::CodeModExec, budget);
            s.exchange(Request::CodeModExec { args }, deadline, true)?
                .word()
                .ok_or_else(|| missing(Op::CodeModExec, "r0"))
        })
    }

    /// Shared path for register reads.
    fn read_scalar(&mut self, size: u32, build: impl FnOnce(Width) -> Request) -> Result<u64> {
        self.run(|s| {
            let width = width_of(size)?;
            let req = build(width);
            let op = req.op();
            let value = s
                .transact(req)?
                .scalar()
                .ok_or_else(|| missing(op, "value"))?;
            if value.width() != width {
                return Err(Error::Mismatch {
                    op,
                    expected: width.bytes(),
                    actual: value.width().bytes(),
                });
            }
            Ok(value.value())
        })
    }

    /// Shared path for register writes.
    fn write_scalar(
        &mut self,
        size: u32,
        value: u64,
        build: impl FnOnce(Scalar) -> Request,
    ) -> Result<()> {
        self.run(|s| {
            let width = width_of(size)?;
            let scalar = Scalar::new(width, value).ok_or_else(|| {
                Error::invalid(format!("value {value:#x} does not fit in {size} bytes"))
            })?;
            s.transact(build(scalar)).map(drop)
        })
    }

    /// Shared path for buffer reads.
    fn read_buf(&mut self, len: u32, req: Request) -> Result<Vec<u8>> {
        self.run(|s| {
            let expected = usize::try_from(len).unwrap_or(usize::MAX);
            s.check_xfer(expected)?;
            let op = req.op();
            let data = s
                .transact(req)?
                .into_data()
                .ok_or_else(|| missing(op, "data"))?;
            if data.len() != expected {
                return Err(Error::Mismatch {
                    op,
                    expected,
                    actual: data.len(),
                });
            }
            Ok(data)
        })
    }

    /// Shared path for buffer writes.
    fn write_buf(&mut self, data: &[u8], build: impl FnOnce(Vec<u8>) -> Request) -> Result<()> {
        self.run(|s| {
            s.check_xfer(data.len())?;
            s.transact(build(data.to_vec())).map(drop)
        })
    }

    /// Rejects transfers larger than one PDU can carry.
    fn check_xfer(&self, len: usize) -> Result<()> {
        let max = self.max_xfer();
        if len > max {
            return Err(Error::invalid(format!(
                "transfer of {len} bytes exceeds the {max} byte limit"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use pspproxy_proto::{Pdu, TargetInfo, rc};
    use pspproxy_stub::{DEFAULT_INFO, STUB_VERSION, SVC_VERSION, SimTarget};

    use super::*;
    use crate::error::Status;
    use crate::loopback;

    #[test]
    fn bad_arguments_never_reach_the_wire() {
        let (mut psp, wire) = loopback::session();
        let calls = wire.io_calls();
        let too_big = u32::try_from(psp.max_xfer() + 1).unwrap();

        assert!(matches!(psp.write_mmio(0, 1, 0x100), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            psp.write_x86_smn(0, 0, 2, 0x1_0000),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            psp.read_coproc(CoProcReg::new(16, 0, 0, 0, 0)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            psp.write_coproc(CoProcReg::new(15, 0, 0, 8, 0), 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(psp.read_mem(0, too_big), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            psp.write_x86_phys_mem(0, &vec![0; too_big as usize]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(psp.alloc_x86_mem(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(psp.load_code_module(&[]), Err(Error::InvalidArgument(_))));

        assert_eq!(psp.last_status(), Status::INVALID_ARGUMENT);
        assert_eq!(wire.io_calls(), calls);
        assert!(psp.fault().is_none());
        psp.read_mmio(0, 4).unwrap();
    }

    #[test]
    fn register_sizes_are_checked_locally() {
        let (mut psp, wire) = loopback::session();
        let calls = wire.io_calls();
        for size in [0, 3, 5, 16] {
            let results = [
                psp.read_smn(0, 0, size).map(drop),
                psp.write_smn(0, 0, size, 0),
                psp.read_mmio(0, size).map(drop),
                psp.write_mmio(0, size, 0),
                psp.read_x86_mmio(0, size).map(drop),
                psp.write_x86_mmio(0, size, 0),
                psp.read_x86_smn(0, 0, size).map(drop),
                psp.write_x86_smn(0, 0, size, 0),
            ];
            for (i, result) in results.into_iter().enumerate() {
                assert!(
                    matches!(result, Err(Error::InvalidArgument(_))),
                    "op {i} with size {size}: {result:?}"
                );
            }
        }
        assert_eq!(wire.io_calls(), calls);
        assert!(psp.fault().is_none());
    }

    #[test]
    fn zero_run_timeout_is_rejected() {
        let (mut psp, wire) = loopback::session();
        psp.load_code_module(&[1]).unwrap();
        let calls = wire.io_calls();
        let err = psp.exec_code_module([0; 4], Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(wire.io_calls(), calls);
        assert!(psp.fault().is_none());
        assert_eq!(psp.exec_code_module([1, 0, 0, 0], None).unwrap(), 0x1);
    }

    #[test]
    fn max_xfer_follows_target_pdu_size() {
        let (psp, _wire) = loopback::session();
        assert_eq!(psp.max_xfer(), 4096 - 32 - 8 - 32);

        let small = SimTarget::new(TargetInfo {
            max_pdu: 512,
            ..DEFAULT_INFO
        });
        let (mut psp, _wire) = loopback::session_with(
            small,
            Session::builder().timeout(Duration::from_millis(200)),
        );
        assert_eq!(psp.max_xfer(), 512 - 72);
        psp.write_mem(0, &[7; 440]).unwrap();
        assert!(matches!(psp.write_mem(0, &[7; 441]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn register_widths() {
        let (mut psp, _wire) = loopback::session();
        for (size, value) in [(1, 0xab), (2, 0xabcd), (4, 0xabcd_ef01), (8, u64::MAX)] {
            psp.write_mmio(0x40, size, value).unwrap();
            assert_eq!(psp.read_mmio(0x40, size).unwrap(), value);
        }
        // Narrow reads see the low bytes of the last wide write.
        assert_eq!(psp.read_mmio(0x40, 2).unwrap(), 0xffff);
    }

    #[test]
    fn smn_per_target_ccd() {
        let (mut psp, _wire) = loopback::session();
        psp.write_smn(1, 0x5a078, 4, 0x00a0_0f11).unwrap();
        assert_eq!(psp.read_smn(1, 0x5a078, 4).unwrap(), 0x00a0_0f11);
        assert_eq!(psp.read_smn(0, 0x5a078, 4).unwrap(), 0);

        let err = psp.read_smn(9, 0x5a078, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected {
                op: Op::PspSmnRead,
                code: rc::INVALID_CCD
            }
        ));
    }

    #[test]
    fn psp_memory_roundtrip() {
        let (mut psp, _wire) = loopback::session();
        let data: Vec<u8> = (0..=255).collect();
        psp.write_mem(0x1000, &data).unwrap();
        assert_eq!(psp.read_mem(0x1000, 256).unwrap(), data);
        assert_eq!(psp.read_mem(0x10fe, 4).unwrap(), vec![0xfe, 0xff, 0, 0]);

        let err = psp.read_mem(0x3_fffe, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected {
                code: rc::INVALID_ADDRESS,
                ..
            }
        ));
    }

    #[test]
    fn zero_length_buffers_are_forwarded() {
        let (mut psp, wire) = loopback::session();
        let calls = wire.io_calls();
        assert!(psp.read_mem(0, 0).unwrap().is_empty());
        psp.write_x86_mem(0, &[]).unwrap();
        assert!(wire.io_calls() > calls);
    }

    #[test]
    fn psp_x86_writes_are_host_visible() {
        let (mut psp, _wire) = loopback::session();
        psp.write_x86_mem(0x8_0000, b"from psp").unwrap();
        assert_eq!(psp.read_x86_phys_mem(0x8_0000, 8).unwrap(), b"from psp");
        psp.write_x86_phys_mem(0x8_0004, b"HOST").unwrap();
        assert_eq!(psp.read_x86_mem(0x8_0000, 8).unwrap(), b"fromHOST");
    }

    #[test]
    fn x86_mmio_and_smn() {
        let (mut psp, _wire) = loopback::session();
        psp.write_x86_mmio(0xfed8_0300, 4, 0x1234).unwrap();
        assert_eq!(psp.read_x86_mmio(0xfed8_0300, 4).unwrap(), 0x1234);

        psp.write_x86_smn(0, 0x1380_0000, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(psp.read_x86_smn(0, 0x1380_0004, 4).unwrap(), 0x0102_0304);
        let err = psp.read_x86_smn(1, 0, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected {
                code: rc::INVALID_PARAMETER,
                ..
            }
        ));
    }

    #[test]
    fn coproc_registers_are_writable() {
        let (mut psp, _wire) = loopback::session();
        let reg = CoProcReg::new(15, 1, 0, 0, 0);
        assert_eq!(psp.read_coproc(reg).unwrap(), 0);
        psp.write_coproc(reg, 0x00c5_0078).unwrap();
        assert_eq!(psp.read_coproc(reg).unwrap(), 0x00c5_0078);
        psp.set_target(1).unwrap();
        assert_eq!(psp.read_coproc(reg).unwrap(), 0);
    }

    #[test]
    fn supervisor_calls() {
        let (mut psp, _wire) = loopback::session();
        assert_eq!(psp.call_svc(SVC_VERSION, [0; 4]).unwrap(), STUB_VERSION);
        let err = psp.call_svc(0x77, [0; 4]).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected {
                op: Op::SvcCall,
                code: rc::UNSUPPORTED
            }
        ));
    }

    #[test]
    fn host_allocation_lifecycle() {
        let (mut psp, _wire) = loopback::session();
        let a = psp.alloc_x86_mem(64).unwrap();
        psp.write_x86_kern_mem(a.token + 8, b"kernel").unwrap();
        assert_eq!(psp.read_x86_kern_mem(a.token + 8, 6).unwrap(), b"kernel");
        assert_eq!(psp.read_x86_phys_mem(a.phys + 8, 6).unwrap(), b"kernel");

        let past_end = psp.read_x86_kern_mem(a.token + 60, 8).unwrap_err();
        assert!(matches!(
            past_end,
            Error::Rejected {
                code: rc::INVALID_TOKEN,
                ..
            }
        ));

        let b = psp.alloc_x86_mem(1).unwrap();
        assert_ne!(a.token, b.token);
        psp.free_x86_mem(a.token).unwrap();
        assert!(matches!(
            psp.free_x86_mem(a.token),
            Err(Error::Rejected {
                code: rc::INVALID_TOKEN,
                ..
            })
        ));
        assert!(matches!(
            psp.read_x86_kern_mem(a.token, 1),
            Err(Error::Rejected { .. })
        ));
        psp.free_x86_mem(b.token).unwrap();
    }

    #[test]
    fn code_module_lands_in_scratch() {
        let (mut psp, _wire) = loopback::session();
        psp.load_code_module(&[0x10, 0x20]).unwrap();
        let scratch = psp.target_info().scratch_addr;
        assert_eq!(psp.read_mem(scratch, 2).unwrap(), vec![0x10, 0x20]);
        assert_eq!(psp.exec_code_module([1, 2, 3, 4], None).unwrap(), 0x30);
    }

    #[test]
    fn short_read_is_a_protocol_failure() {
        let (mut psp, wire) = loopback::session();
        wire.tamper(|pdu: &mut Pdu| {
            if let Ok(Response::PspMemRead { mut data }) = pdu.decode::<Response>() {
                data.pop();
                *pdu = Pdu {
                    seq: pdu.seq,
                    ..Pdu::from_message(&Response::PspMemRead { data }, pdu.ccd).unwrap()
                };
            }
        });
        let err = psp.read_mem(0, 8).unwrap_err();
        assert!(matches!(
            err,
            Error::Mismatch {
                op: Op::PspMemRead,
                expected: 8,
                actual: 7
            }
        ));
        assert_eq!(psp.fault(), Some(Status::PROTOCOL));
    }

    #[test]
    fn narrow_scalar_reply_is_a_protocol_failure() {
        let (mut psp, wire) = loopback::session();
        wire.tamper(|pdu: &mut Pdu| {
            if let Ok(Response::PspMmioRead { value }) = pdu.decode::<Response>() {
                let value = Scalar::truncate(Width::U8, value.value());
                *pdu = Pdu {
                    seq: pdu.seq,
                    ..Pdu::from_message(&Response::PspMmioRead { value }, pdu.ccd).unwrap()
                };
            }
        });
        let err = psp.read_mmio(0, 4).unwrap_err();
        assert_eq!(err.status(), Status::PROTOCOL);
    }

    #[test]
    fn stub_over_tcp() {
        let addr = pspproxy_stub::spawn_tcp("127.0.0.1:0".parse().unwrap(), SimTarget::default()).unwrap();
        let device = format!("tcp://{addr}");
        {
            let mut psp = Session::open(&device).unwrap();
            assert_eq!(psp.target_info().ccd_count(), 2);
            psp.write_smn(0, 0x100, 4, 0x1122_3344).unwrap();
            psp.write_mem(0x40, b"persist").unwrap();
        }
        let mut psp = Session::open(&device).unwrap();
        assert_eq!(psp.read_smn(0, 0x100, 4).unwrap(), 0x1122_3344);
        assert_eq!(psp.read_mem(0x40, 7).unwrap(), b"persist");
        psp.close();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn smn_reads_return_last_write(
            ccd in 0u32..2,
            addr in any::<u32>(),
            size in prop::sample::select(vec![1u32, 2, 4, 8]),
            raw in any::<u64>(),
        ) {
            let (mut psp, _wire) = loopback::session();
            let value = if size == 8 { raw } else { raw & ((1u64 << (size * 8)) - 1) };
            psp.write_smn(ccd, addr, size, value).unwrap();
            prop_assert_eq!(psp.read_smn(ccd, addr, size).unwrap(), value);
        }
    }
}
