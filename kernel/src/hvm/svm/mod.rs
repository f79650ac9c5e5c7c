//! AMD SVM backend.
//!
//! The VMCB lives in a pool frame; guest general registers other than
//! RAX are carried in host memory around `vmrun`. Nested paging uses
//! the shared two-level table, which is exactly what NPT walks in
//! legacy mode. I/O and MSR intercepts are driven by the permission
//! bitmaps: all ones at creation, so every port access exits until a
//! device claims it.

pub mod vmcb;

use vmcb::{decode_ioio, encode_eventinj, intercept, Seg, Vmcb};

use super::{
    nested::NestedPtab, CacheType, ExitInfo, ExitReason, GuestEvent, GuestInstr, GuestReg,
    GuestSeg, GuestSegDesc, IoportExit, VendorVm, GUEST_FL_IF,
};
use crate::{
    error::HvmError,
    mm::{FrameNumber, PhysPool, PAGE_SIZE},
};

/// EFER.SVME enable bit and the MSRs that manage SVM.
const MSR_EFER: u32 = 0xC000_0080;
const EFER_SVME: u64 = 1 << 12;
const MSR_VM_HSAVE_PA: u32 = 0xC001_0117;

/// I/O permission bitmap: 64 Ki ports, one bit each, plus the padding
/// page the processor insists on.
const IOPM_FRAMES: u32 = 3;
/// MSR permission bitmap: two pages.
const MSRPM_FRAMES: u32 = 2;

/// Guest general-purpose registers not held in the VMCB.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct GuestGpRegs {
    ebx: u32,
    ecx: u32,
    edx: u32,
    esi: u32,
    edi: u32,
    ebp: u32,
}

/// One SVM-backed virtual machine.
pub struct SvmVm {
    pool: &'static PhysPool,
    vmcb_frame: FrameNumber,
    iopm: FrameNumber,
    msrpm: FrameNumber,
    hsave: FrameNumber,
    /// Always Some while the VM lives; taken by Drop.
    npt: Option<NestedPtab>,
    gp: GuestGpRegs,
}

impl SvmVm {
    pub fn new(pool: &'static PhysPool) -> Result<Self, HvmError> {
        let vmcb_frame = alloc_zeroed(pool, 1, 0)?;
        let iopm = alloc_zeroed(pool, IOPM_FRAMES, 0)?;
        let msrpm = alloc_zeroed(pool, MSRPM_FRAMES, 0)?;
        let hsave = alloc_zeroed(pool, 1, 0)?;
        let npt = NestedPtab::new(pool)?;

        let vm = SvmVm {
            pool,
            vmcb_frame,
            iopm,
            msrpm,
            hsave,
            npt: Some(npt),
            gp: GuestGpRegs::default(),
        };
        vm.init_control();
        vm.init_guest_state();
        Ok(vm)
    }

    fn vmcb_ptr(&self) -> *mut Vmcb {
        self.pool.frame_ptr(self.vmcb_frame).cast::<Vmcb>()
    }

    fn npt(&self) -> &NestedPtab {
        self.npt.as_ref().expect("nested table taken before drop")
    }

    /// Run `f` with the VMCB. All VMCB access funnels through here so
    /// the aliasing story stays one-liner simple: the frame is owned by
    /// this object and never borrowed out.
    fn with_vmcb<R>(&self, f: impl FnOnce(&mut Vmcb) -> R) -> R {
        // SAFETY: The frame is pool-backed, page-sized, and exclusively
        // owned by this SvmVm.
        f(unsafe { &mut *self.vmcb_ptr() })
    }

    fn init_control(&self) {
        let iopm_pa = self.iopm.addr().as_u32() as u64;
        let msrpm_pa = self.msrpm.addr().as_u32() as u64;
        let ncr3 = self.npt().root().addr().as_u32() as u64;

        // Intercept everything the monitor must see: interrupts, the
        // whole port space, select MSRs, CPUID/HLT/INVLPG/RDTSC,
        // shutdown, and the entire vm* family.
        self.with_vmcb(|v| {
            v.control.intercept = intercept::INTR
                | intercept::RDTSC
                | intercept::CPUID
                | intercept::HLT
                | intercept::INVLPG
                | intercept::IOIO_PROT
                | intercept::MSR_PROT
                | intercept::SHUTDOWN
                | intercept::VMRUN
                | intercept::VMMCALL
                | intercept::VMLOAD
                | intercept::VMSAVE
                | intercept::STGI
                | intercept::CLGI
                | intercept::SKINIT;
            v.control.iopm_base_pa = iopm_pa;
            v.control.msrpm_base_pa = msrpm_pa;
            v.control.asid = 1;
            v.control.nested_ctl = vmcb::NESTED_CTL_NP_ENABLE;
            v.control.nested_cr3 = ncr3;
        });

        // All ones: every port and every MSR exits.
        for f in 0..IOPM_FRAMES {
            fill_frame(self.pool, FrameNumber::new(self.iopm.as_u32() + f), 0xFF);
        }
        for f in 0..MSRPM_FRAMES {
            fill_frame(self.pool, FrameNumber::new(self.msrpm.as_u32() + f), 0xFF);
        }
    }

    /// Architectural reset state: real mode at F000:FFF0.
    fn init_guest_state(&self) {
        self.with_vmcb(|v| {
            v.save.cs = Seg {
                selector: 0xF000,
                attrib: 0x009B,
                limit: 0xFFFF,
                base: 0xF_0000,
            };
            let data = Seg {
                selector: 0,
                attrib: 0x0093,
                limit: 0xFFFF,
                base: 0,
            };
            v.save.ds = data;
            v.save.es = data;
            v.save.fs = data;
            v.save.gs = data;
            v.save.ss = data;
            v.save.gdtr = Seg { selector: 0, attrib: 0, limit: 0xFFFF, base: 0 };
            v.save.idtr = Seg { selector: 0, attrib: 0, limit: 0xFFFF, base: 0 };
            v.save.ldtr = Seg { selector: 0, attrib: 0x0082, limit: 0xFFFF, base: 0 };
            v.save.tr = Seg { selector: 0, attrib: 0x008B, limit: 0xFFFF, base: 0 };
            v.save.cr0 = 0x6000_0010;
            v.save.rflags = 1 << 1;
            v.save.rip = 0xFFF0;
            v.save.efer = EFER_SVME; // required set even for the guest
            v.save.g_pat = 0x0007_0406_0007_0406;
        });
    }

    fn classify(&self) -> (ExitReason, ExitInfo) {
        let (code, info1) =
            self.with_vmcb(|v| (v.control.exit_code, v.control.exit_info_1));
        match code {
            vmcb::VMEXIT_INTR => (ExitReason::ExtIntr, ExitInfo::None),
            vmcb::VMEXIT_VINTR => (ExitReason::IntrWindow, ExitInfo::None),
            vmcb::VMEXIT_IOIO => {
                let io = decode_ioio(info1);
                (
                    ExitReason::Ioport,
                    ExitInfo::Ioport(IoportExit {
                        port: io.port,
                        width: io.sz,
                        write: !io.input,
                        rep: io.rep,
                        str_op: io.str_op,
                    }),
                )
            }
            vmcb::VMEXIT_NPF => (
                ExitReason::PageFault,
                ExitInfo::PageFault {
                    gpa: self.with_vmcb(|v| v.control.exit_info_2) as u32,
                },
            ),
            vmcb::VMEXIT_MSR => {
                // exit_info_1: 0 = rdmsr, 1 = wrmsr.
                if info1 & 1 == 0 {
                    (ExitReason::Rdmsr, ExitInfo::None)
                } else {
                    (ExitReason::Wrmsr, ExitInfo::None)
                }
            }
            vmcb::VMEXIT_CPUID => (ExitReason::Cpuid, ExitInfo::None),
            vmcb::VMEXIT_RDTSC | vmcb::VMEXIT_RDTSCP => (ExitReason::Rdtsc, ExitInfo::None),
            vmcb::VMEXIT_HLT => (ExitReason::Hlt, ExitInfo::None),
            vmcb::VMEXIT_SHUTDOWN => (ExitReason::Shutdown, ExitInfo::None),
            vmcb::VMEXIT_VMRUN..=vmcb::VMEXIT_SKINIT | vmcb::VMEXIT_INVLPG => {
                (ExitReason::InvalInstr, ExitInfo::None)
            }
            vmcb::VMEXIT_INVALID => (ExitReason::Invalid, ExitInfo::None),
            other => {
                log::warn!("svm: unclassified exit {:#x}", other);
                (ExitReason::Invalid, ExitInfo::None)
            }
        }
    }
}

impl Drop for SvmVm {
    fn drop(&mut self) {
        release_frames(self.pool, self.vmcb_frame, 1);
        release_frames(self.pool, self.iopm, IOPM_FRAMES);
        release_frames(self.pool, self.msrpm, MSRPM_FRAMES);
        release_frames(self.pool, self.hsave, 1);
        if let Some(npt) = self.npt.take() {
            npt.destroy(self.pool);
        }
    }
}

impl VendorVm for SvmVm {
    fn run(&mut self) -> Result<(ExitReason, ExitInfo), HvmError> {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let vmcb_pa = self.vmcb_frame.addr().as_u32();
            // SAFETY: The VMCB and bitmaps are fully initialized; the
            // stub preserves host state around vmrun.
            unsafe { svm_enter(vmcb_pa, &mut self.gp) };
            // A consumed HLT still needs its EIP advance; settle it
            // here so the exit never surfaces half-done.
            if self.with_vmcb(|v| v.control.exit_code) == vmcb::VMEXIT_HLT {
                let next = self.with_vmcb(|v| v.control.next_rip);
                if next != 0 {
                    self.with_vmcb(|v| v.save.rip = next);
                }
            }
            return Ok(self.classify());
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        return Err(HvmError::NotSupported);
    }

    fn set_reg(&mut self, reg: GuestReg, val: u32) -> Result<(), HvmError> {
        match reg {
            GuestReg::Eax => self.with_vmcb(|v| v.save.rax = val as u64),
            GuestReg::Ebx => self.gp.ebx = val,
            GuestReg::Ecx => self.gp.ecx = val,
            GuestReg::Edx => self.gp.edx = val,
            GuestReg::Esi => self.gp.esi = val,
            GuestReg::Edi => self.gp.edi = val,
            GuestReg::Ebp => self.gp.ebp = val,
            GuestReg::Esp => self.with_vmcb(|v| v.save.rsp = val as u64),
            GuestReg::Eip => self.with_vmcb(|v| v.save.rip = val as u64),
            GuestReg::Eflags => self.with_vmcb(|v| v.save.rflags = val as u64),
            GuestReg::Cr0 => self.with_vmcb(|v| v.save.cr0 = val as u64),
            GuestReg::Cr2 => self.with_vmcb(|v| v.save.cr2 = val as u64),
            GuestReg::Cr3 => self.with_vmcb(|v| v.save.cr3 = val as u64),
            GuestReg::Cr4 => self.with_vmcb(|v| v.save.cr4 = val as u64),
        }
        Ok(())
    }

    fn get_reg(&self, reg: GuestReg) -> Result<u32, HvmError> {
        let val = match reg {
            GuestReg::Eax => self.with_vmcb(|v| v.save.rax) as u32,
            GuestReg::Ebx => self.gp.ebx,
            GuestReg::Ecx => self.gp.ecx,
            GuestReg::Edx => self.gp.edx,
            GuestReg::Esi => self.gp.esi,
            GuestReg::Edi => self.gp.edi,
            GuestReg::Ebp => self.gp.ebp,
            GuestReg::Esp => self.with_vmcb(|v| v.save.rsp) as u32,
            GuestReg::Eip => self.with_vmcb(|v| v.save.rip) as u32,
            GuestReg::Eflags => self.with_vmcb(|v| v.save.rflags) as u32,
            GuestReg::Cr0 => self.with_vmcb(|v| v.save.cr0) as u32,
            GuestReg::Cr2 => self.with_vmcb(|v| v.save.cr2) as u32,
            GuestReg::Cr3 => self.with_vmcb(|v| v.save.cr3) as u32,
            GuestReg::Cr4 => self.with_vmcb(|v| v.save.cr4) as u32,
        };
        Ok(val)
    }

    fn set_desc(&mut self, seg: GuestSeg, desc: &GuestSegDesc) -> Result<(), HvmError> {
        let s = Seg {
            selector: desc.sel,
            attrib: Seg::attrib_from_ar(desc.ar),
            limit: desc.lim,
            base: desc.base,
        };
        self.with_vmcb(|v| match seg {
            GuestSeg::Cs => v.save.cs = s,
            GuestSeg::Ds => v.save.ds = s,
            GuestSeg::Es => v.save.es = s,
            GuestSeg::Fs => v.save.fs = s,
            GuestSeg::Gs => v.save.gs = s,
            GuestSeg::Ss => v.save.ss = s,
            GuestSeg::Ldtr => v.save.ldtr = s,
            GuestSeg::Tr => v.save.tr = s,
            GuestSeg::Gdtr => v.save.gdtr = s,
            GuestSeg::Idtr => v.save.idtr = s,
        });
        Ok(())
    }

    fn get_desc(&self, seg: GuestSeg) -> Result<GuestSegDesc, HvmError> {
        let s = self.with_vmcb(|v| match seg {
            GuestSeg::Cs => v.save.cs,
            GuestSeg::Ds => v.save.ds,
            GuestSeg::Es => v.save.es,
            GuestSeg::Fs => v.save.fs,
            GuestSeg::Gs => v.save.gs,
            GuestSeg::Ss => v.save.ss,
            GuestSeg::Ldtr => v.save.ldtr,
            GuestSeg::Tr => v.save.tr,
            GuestSeg::Gdtr => v.save.gdtr,
            GuestSeg::Idtr => v.save.idtr,
        });
        Ok(GuestSegDesc {
            sel: s.selector,
            base: s.base,
            lim: s.limit,
            ar: Seg::ar_from_attrib(s.attrib),
        })
    }

    fn get_next_eip(&self, instr: GuestInstr) -> Result<u32, HvmError> {
        match instr {
            // For IOIO exits the following-instruction RIP rides in
            // exit_info_2.
            GuestInstr::In | GuestInstr::Out => {
                Ok(self.with_vmcb(|v| v.control.exit_info_2) as u32)
            }
            _ => {
                let next = self.with_vmcb(|v| v.control.next_rip);
                if next == 0 {
                    // No decode assist on this part.
                    return Err(HvmError::ExitFault);
                }
                Ok(next as u32)
            }
        }
    }

    fn inject_event(
        &mut self,
        ev: GuestEvent,
        vector: u8,
        errcode: u32,
        deliver_errcode: bool,
    ) -> Result<(), HvmError> {
        let typ = match ev {
            GuestEvent::ExtIntr => vmcb::EVENTINJ_TYPE_INTR,
            GuestEvent::Nmi => vmcb::EVENTINJ_TYPE_NMI,
            GuestEvent::Exception => vmcb::EVENTINJ_TYPE_EXCEPTION,
            GuestEvent::SwInt => vmcb::EVENTINJ_TYPE_SWINT,
        };
        self.with_vmcb(|v| {
            v.control.event_inj = encode_eventinj(typ, vector, deliver_errcode);
            v.control.event_inj_err = errcode;
        });
        Ok(())
    }

    fn pending_event(&self) -> bool {
        self.with_vmcb(|v| v.control.event_inj) & vmcb::EVENTINJ_VALID != 0
    }

    fn intr_shadow(&self) -> bool {
        self.with_vmcb(|v| v.control.int_state) & vmcb::INT_STATE_SHADOW != 0
    }

    fn guest_intr_enabled(&self) -> bool {
        self.with_vmcb(|v| v.save.rflags) as u32 & GUEST_FL_IF != 0
    }

    fn intercept_ioport(&mut self, port: u16, enable: bool) {
        let byte = port as usize / 8;
        let bit = port as usize % 8;
        let frame = FrameNumber::new(self.iopm.as_u32() + (byte / PAGE_SIZE) as u32);
        // SAFETY: The bitmap frames are pool-backed and owned here.
        unsafe {
            let p = self.pool.frame_ptr(frame).add(byte % PAGE_SIZE);
            if enable {
                *p |= 1 << bit;
            } else {
                *p &= !(1 << bit);
            }
        }
    }

    fn intercept_msr(&mut self, msr: u32, enable: bool) {
        // MSRPM: 2 bits per MSR, three architected ranges of 8K MSRs.
        let (range, idx) = match msr {
            0..=0x1FFF => (0usize, msr),
            0xC000_0000..=0xC000_1FFF => (1, msr - 0xC000_0000),
            0xC001_0000..=0xC001_1FFF => (2, msr - 0xC001_0000),
            _ => return,
        };
        let bitpos = idx as usize * 2;
        let byte = range * 2048 + bitpos / 8;
        let frame = FrameNumber::new(self.msrpm.as_u32() + (byte / PAGE_SIZE) as u32);
        // SAFETY: See intercept_ioport.
        unsafe {
            let p = self.pool.frame_ptr(frame).add(byte % PAGE_SIZE);
            let mask = 0b11 << (bitpos % 8);
            if enable {
                *p |= mask;
            } else {
                *p &= !mask;
            }
        }
    }

    fn intercept_intr_window(&mut self, enable: bool) {
        self.with_vmcb(|v| {
            if enable {
                v.control.int_ctl |= vmcb::INT_CTL_V_IRQ;
                v.control.intercept |= intercept::VINTR;
            } else {
                v.control.int_ctl &= !vmcb::INT_CTL_V_IRQ;
                v.control.intercept &= !intercept::VINTR;
            }
        });
    }

    fn set_mmap(&mut self, gpa: u32, hpa: u32, ctype: CacheType) -> Result<(), HvmError> {
        self.npt().set_mmap(self.pool, gpa, hpa, ctype)
    }

    fn translate_gpa(&self, gpa: u32) -> Option<u32> {
        self.npt().translate(self.pool, gpa)
    }

    fn set_tsc_offset(&mut self, offset: u64) {
        self.with_vmcb(|v| v.control.tsc_offset = offset);
    }
}

fn alloc_zeroed(pool: &PhysPool, n: u32, align: u32) -> Result<FrameNumber, HvmError> {
    let first = if n == 1 {
        pool.alloc_page().map_err(HvmError::from)?
    } else {
        pool.alloc_pages(n, align).map_err(HvmError::from)?
    };
    for i in 0..n {
        let f = FrameNumber::new(first.as_u32() + i);
        pool.incref(f);
        pool.zero_frame(f);
    }
    Ok(first)
}

fn fill_frame(pool: &PhysPool, frame: FrameNumber, byte: u8) {
    // SAFETY: Pool frame owned by the caller.
    unsafe { core::ptr::write_bytes(pool.frame_ptr(frame), byte, PAGE_SIZE) };
}

fn release_frames(pool: &PhysPool, first: FrameNumber, n: u32) {
    for i in 0..n {
        pool.decref(FrameNumber::new(first.as_u32() + i));
    }
}

/// Enter the guest. Saves and restores the host's callee-saved state,
/// shuttles the guest GP registers, and returns after the next VM exit.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    ".globl svm_enter",
    "svm_enter:",
    "  push ebp",
    "  push ebx",
    "  push esi",
    "  push edi",
    "  mov eax, [esp + 20]", // vmcb physical address
    "  mov ebp, [esp + 24]", // &mut GuestGpRegs
    "  push ebp",
    "  mov ebx, [ebp + 0]",
    "  mov ecx, [ebp + 4]",
    "  mov edx, [ebp + 8]",
    "  mov esi, [ebp + 12]",
    "  mov edi, [ebp + 16]",
    "  mov ebp, [ebp + 20]",
    "  clgi",
    "  vmload eax",
    "  vmrun eax",
    "  vmsave eax",
    "  stgi",
    "  xchg ebp, [esp]", // guest ebp out, regs pointer in
    "  mov [ebp + 0], ebx",
    "  mov [ebp + 4], ecx",
    "  mov [ebp + 8], edx",
    "  mov [ebp + 12], esi",
    "  mov [ebp + 16], edi",
    "  pop eax",
    "  mov [ebp + 20], eax",
    "  pop edi",
    "  pop esi",
    "  pop ebx",
    "  pop ebp",
    "  ret",
);

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    fn svm_enter(vmcb_pa: u32, gp: *mut GuestGpRegs);
}

/// Enable SVM on the calling CPU.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn hw_init(hsave_pa: u32) -> Result<(), HvmError> {
    use crate::arch::x86::cpu;

    let (_, _, ecx, _) = cpu::cpuid(0x8000_0001, 0);
    if ecx & (1 << 2) == 0 {
        return Err(HvmError::NotSupported);
    }
    cpu::wrmsr(MSR_EFER, cpu::rdmsr(MSR_EFER) | EFER_SVME);
    cpu::wrmsr(MSR_VM_HSAVE_PA, hsave_pa as u64);
    Ok(())
}
